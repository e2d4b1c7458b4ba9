use std::time::Duration;

use env_helpers::get_env_default;
use secrecy::SecretString;
use strum::{AsRefStr, Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum StorageBackend {
    Postgres,
    /// Process-local stores; state is lost on exit.
    Memory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

pub struct AppConfig {
    pub storage_backend: StorageBackend,
    /// Required for the Postgres backend only.
    pub database_url: Option<SecretString>,
    pub database_max_connections: u32,
    pub run_migrations: bool,
    pub pause_sweep_interval: Duration,
    /// Compare-and-set attempts before a contended write gives up with `Conflict`.
    pub ledger_max_retries: u32,
    /// Deadline applied to every storage call made by the sweeper.
    pub storage_timeout: Duration,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let storage_backend: StorageBackend =
            get_env_default("STORAGE_BACKEND", StorageBackend::Postgres);
        let database_url: Option<SecretString> = std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| SecretString::new(s.into()));
        let database_max_connections: u32 = get_env_default("DATABASE_MAX_CONNECTIONS", 5);
        let run_migrations: bool = get_env_default("RUN_MIGRATIONS", true);
        let pause_sweep_interval_secs: u64 = get_env_default("PAUSE_SWEEP_INTERVAL_SECS", 60);
        let ledger_max_retries: u32 = get_env_default("LEDGER_MAX_RETRIES", 5);
        let storage_timeout_ms: u64 = get_env_default("STORAGE_TIMEOUT_MS", 5_000);
        let log_format: LogFormat = get_env_default("LOG_FORMAT", LogFormat::Pretty);

        Self {
            storage_backend,
            database_url,
            database_max_connections: database_max_connections.max(1),
            run_migrations,
            pause_sweep_interval: Duration::from_secs(pause_sweep_interval_secs.max(1)),
            ledger_max_retries,
            storage_timeout: Duration::from_millis(storage_timeout_ms),
            log_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_and_format_parse_case_insensitively() {
        assert_eq!(
            "Memory".parse::<StorageBackend>().unwrap(),
            StorageBackend::Memory
        );
        assert_eq!(
            "postgres".parse::<StorageBackend>().unwrap(),
            StorageBackend::Postgres
        );
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("sqlite".parse::<StorageBackend>().is_err());
    }
}
