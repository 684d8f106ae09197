use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};

use crate::store::DEFAULT_MAX_ENTRIES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreBackend,
    pub redis_url: Option<String>,
    pub redis_key: String,
    pub max_entries: usize,
    pub shutdown_grace: Duration,
    pub log_filter: String,
}

#[derive(Debug, Parser)]
#[command(name = "logger-service", version, about = "Stores log entries posted by the listener")]
pub struct Cli {
    #[arg(long, env = "LOGGER_LISTEN_ADDR", default_value = "0.0.0.0:6000")]
    pub listen_addr: String,

    /// Where entries are kept.
    #[arg(long, env = "LOGGER_STORE", value_enum, default_value_t = StoreBackend::Memory)]
    pub store: StoreBackend,

    /// Required when `--store redis`.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "LOGGER_REDIS_KEY", default_value = "logger:entries")]
    pub redis_key: String,

    /// Entries retained before the oldest are dropped.
    #[arg(long, env = "LOGGER_MAX_ENTRIES", default_value_t = DEFAULT_MAX_ENTRIES)]
    pub max_entries: usize,

    #[arg(long, env = "LOGGER_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    #[arg(
        long,
        env = "RUST_LOG",
        default_value = "info,logger_service=debug,topic_bus=info"
    )]
    pub log_filter: String,
}

impl TryFrom<Cli> for LoggerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.store == StoreBackend::Redis && cli.redis_url.is_none() {
            bail!("--store redis requires REDIS_URL");
        }
        if cli.max_entries == 0 {
            bail!("max entries must be greater than zero");
        }
        Ok(LoggerConfig {
            listen_addr,
            store: cli.store,
            redis_url: cli.redis_url,
            redis_key: cli.redis_key,
            max_entries: cli.max_entries,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            log_filter: cli.log_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<LoggerConfig> {
        let mut argv = vec!["logger-service"];
        argv.extend_from_slice(args);
        LoggerConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_to_memory_on_port_6000() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.listen_addr.port(), 6000);
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.max_entries, DEFAULT_MAX_ENTRIES);
    }

    #[test]
    fn redis_backend_needs_url() {
        let err = parse(&["--store", "redis"]).unwrap_err();
        assert!(err.to_string().contains("REDIS_URL"));
        let config = parse(&["--store", "redis", "--redis-url", "redis://127.0.0.1/"]).unwrap();
        assert_eq!(config.store, StoreBackend::Redis);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(parse(&["--max-entries", "0"]).is_err());
    }
}
