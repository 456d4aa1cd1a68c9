//! Configuration management for the manga reader server

use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub inference: InferenceConfig,
    pub ocr: OcrQueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Where the OCR inference service lives
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    pub base_url: String,
    /// Per-request timeout. `None` waits for as long as the service takes.
    pub timeout_secs: Option<u64>,
}

/// OCR worker pool settings
#[derive(Debug, Clone, Deserialize)]
pub struct OcrQueueConfig {
    /// Initial number of concurrent workers
    pub concurrency: usize,
    /// Upper bound accepted by `set_concurrency`
    pub max_concurrency: usize,
    /// Failed pages with at least this many failures are not retried at boot.
    /// `None` retries every failed page on every start.
    pub retry_ceiling: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./manga.db".to_string(),
            },
            inference: InferenceConfig {
                base_url: "http://localhost:8000".to_string(),
                timeout_secs: None,
            },
            ocr: OcrQueueConfig::default(),
        }
    }
}

impl Default for OcrQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_concurrency: 8,
            retry_ceiling: Some(3),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = OcrQueueConfig::default();

        let max_concurrency = env::var("OCR_MAX_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n >= 1)
            .unwrap_or(defaults.max_concurrency);

        let concurrency = env::var("OCR_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n >= 1)
            .unwrap_or(defaults.concurrency)
            .min(max_concurrency);

        // 0 disables the ceiling
        let retry_ceiling = match env::var("OCR_RETRY_CEILING") {
            Ok(v) => match v.parse::<u32>() {
                Ok(0) => None,
                Ok(n) => Some(n),
                Err(_) => defaults.retry_ceiling,
            },
            Err(_) => defaults.retry_ceiling,
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .unwrap_or(3000),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./manga.db".to_string()),
            },
            inference: InferenceConfig {
                base_url: env::var("INFERENCE_URL")
                    .unwrap_or_else(|_| "http://localhost:8000".to_string()),
                timeout_secs: env::var("INFERENCE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok()),
            },
            ocr: OcrQueueConfig {
                concurrency,
                max_concurrency,
                retry_ceiling,
            },
        })
    }
}
