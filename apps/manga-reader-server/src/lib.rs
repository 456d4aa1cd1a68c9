//! Manga Reader Server Library
//!
//! The server binary is in main.rs; everything it wires together lives here
//! so it can be tested in-process.
//!
//! # Modules
//!
//! - `db`: Page store and OCR run records (SQLite)
//! - `ocr`: Inference client, job queue, worker pool, recovery
//! - `routes`: HTTP control surface and progress events

pub mod config;
pub mod db;
pub mod error;
pub mod ocr;
pub mod routes;
pub mod state;
