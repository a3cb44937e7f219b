use std::env;
use std::path::PathBuf;

use crate::error::ServerError;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Database file path (default: ./entrysync.db)
    pub database_path: PathBuf,
    /// Upper bound on items returned by one pull (default: 500)
    pub pull_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./entrysync.db"),
            pull_limit: 500,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ServerError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let pull_limit = match env::var("PULL_LIMIT") {
            Ok(value) => value
                .parse::<usize>()
                .ok()
                .filter(|limit| *limit > 0)
                .ok_or_else(|| ServerError::Config(format!("Invalid PULL_LIMIT '{}'", value)))?,
            Err(_) => defaults.pull_limit,
        };

        Ok(Config {
            database_path,
            pull_limit,
        })
    }

    /// Clamp a client-requested batch size to the configured limit
    pub fn clamp_limit(&self, requested: usize) -> usize {
        requested.clamp(1, self.pull_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        let config = Config {
            pull_limit: 10,
            ..Config::default()
        };
        assert_eq!(config.clamp_limit(0), 1);
        assert_eq!(config.clamp_limit(5), 5);
        assert_eq!(config.clamp_limit(50), 10);
    }
}
