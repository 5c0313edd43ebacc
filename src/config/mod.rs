/// Configuration management for Mechasync
///
/// Handles server, storage, scheduler and lineage endpoints plus the sync policy.

use crate::runtime::SyncSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub lineage: LineageConfig,
    pub sync: SyncConfig,
    pub catalog: CatalogConfig,
    /// Max log level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL (e.g., "sqlite://data/mechasync.db")
    pub url: String,
}

/// Scheduler REST API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub base_url: String,
    /// Sent as the `token` header when set
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageConfig {
    /// SQL lineage service endpoint
    pub endpoint: String,
}

/// Runtime sync policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Workflow codes that never sync
    pub disabled_workflows: BTreeSet<i64>,
    pub fetch_timeout_secs: u64,
    pub commit_retry_budget: u32,
    pub default_operator: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// JSON file of registered tables loaded at startup
    pub path: Option<String>,
}

impl SyncConfig {
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            enabled: self.enabled,
            disabled_workflows: self.disabled_workflows.clone(),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            commit_retry_budget: self.commit_retry_budget,
            default_operator: self.default_operator.clone(),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("MECHASYNC_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("MECHASYNC_PORT")
                    .unwrap_or_else(|_| "3005".to_string())
                    .parse()
                    .unwrap_or(3005),
            },
            database: DatabaseConfig {
                url: std::env::var("MECHASYNC_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/mechasync.db".to_string()),
            },
            scheduler: SchedulerConfig {
                base_url: std::env::var("MECHASYNC_SCHEDULER_URL")
                    .unwrap_or_else(|_| "http://localhost:12345/dolphinscheduler".to_string()),
                token: std::env::var("MECHASYNC_SCHEDULER_TOKEN").ok().filter(|token| !token.is_empty()),
            },
            lineage: LineageConfig {
                endpoint: std::env::var("MECHASYNC_LINEAGE_URL")
                    .unwrap_or_else(|_| "http://localhost:8090/api/lineage/tables".to_string()),
            },
            sync: SyncConfig {
                enabled: std::env::var("MECHASYNC_SYNC_ENABLED")
                    .map(|value| parse_flag(&value))
                    .unwrap_or(true),
                disabled_workflows: std::env::var("MECHASYNC_SYNC_DISABLED_WORKFLOWS")
                    .map(|value| parse_codes(&value))
                    .unwrap_or_default(),
                fetch_timeout_secs: std::env::var("MECHASYNC_FETCH_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                commit_retry_budget: std::env::var("MECHASYNC_COMMIT_RETRIES")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
                default_operator: std::env::var("MECHASYNC_DEFAULT_OPERATOR")
                    .unwrap_or_else(|_| "runtime-sync".to_string()),
            },
            catalog: CatalogConfig {
                path: std::env::var("MECHASYNC_CATALOG_PATH").ok().filter(|path| !path.is_empty()),
            },
            log_level: std::env::var("MECHASYNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

/// Parse a boolean flag; anything unrecognized keeps sync on
fn parse_flag(value: &str) -> bool {
    !matches!(value.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off")
}

/// Comma-separated workflow codes, skipping blanks and junk
fn parse_codes(value: &str) -> BTreeSet<i64> {
    value
        .split(',')
        .filter_map(|code| code.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag("yes"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(" OFF "));
        assert!(!parse_flag("0"));
    }

    #[test]
    fn test_parse_codes() {
        assert_eq!(parse_codes("100, 200,,abc,300"), BTreeSet::from([100, 200, 300]));
        assert!(parse_codes("").is_empty());
    }

    #[test]
    fn test_sync_settings() {
        let config = SyncConfig {
            enabled: false,
            disabled_workflows: BTreeSet::from([7]),
            fetch_timeout_secs: 3,
            commit_retry_budget: 1,
            default_operator: "ops".to_string(),
        };

        let settings = config.settings();
        assert!(!settings.enabled);
        assert_eq!(settings.fetch_timeout, Duration::from_secs(3));
        assert!(settings.disabled_workflows.contains(&7));
    }
}
