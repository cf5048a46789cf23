//! Configuration for the optimizer service

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
}

impl RedisConfig {
    /// Build the `redis://` connection URL deadpool-redis expects
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) if !pw.is_empty() => {
                format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db)
            }
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// HTTP server bind configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub update_interval: Duration,
    pub min_exposures_for_update: u64,
}

/// Top-level optimizer service configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub redis: RedisConfig,
    pub datafiles_dir: PathBuf,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// documented defaults. Reads a `.env` file if present.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let redis = RedisConfig {
            host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("REDIS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(6379),
            db: std::env::var("REDIS_DB")
                .ok()
                .and_then(|d| d.parse().ok())
                .unwrap_or(0),
            password: std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
        };

        let datafiles_dir = std::env::var("DATAFILES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./dist"));

        let server = ServerConfig {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5050),
        };

        let update_interval_minutes: u64 = std::env::var("UPDATE_INTERVAL_MINUTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let min_exposures_for_update: u64 = std::env::var("MIN_EXPOSURES_FOR_UPDATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        let scheduler = SchedulerConfig {
            update_interval: Duration::from_secs(update_interval_minutes * 60),
            min_exposures_for_update,
        };

        Ok(Self {
            redis,
            datafiles_dir,
            server,
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_without_password() {
        let cfg = RedisConfig {
            host: "localhost".into(),
            port: 6379,
            db: 0,
            password: None,
        };
        assert_eq!(cfg.url(), "redis://localhost:6379/0");
    }

    #[test]
    fn redis_url_with_password() {
        let cfg = RedisConfig {
            host: "redis.internal".into(),
            port: 6380,
            db: 2,
            password: Some("secret".into()),
        };
        assert_eq!(cfg.url(), "redis://:secret@redis.internal:6380/2");
    }
}
