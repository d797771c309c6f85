//! CLI surface: flags and defaults for the standalone binary.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Intercepting HTTP/HTTPS forward proxy with policy-based domain blocking
/// and response caching.
#[derive(Debug, Parser)]
#[command(name = "mitm-proxy", version, about)]
pub struct ProxyConfig {
    /// Address to listen on.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Directory holding cached responses.
    #[arg(long, default_value = "./proxy_cache")]
    pub cache_dir: PathBuf,

    /// How long a cached response stays fresh, in seconds. 0 disables the cache.
    #[arg(long, default_value_t = 3600)]
    pub cache_ttl_seconds: i64,

    /// PEM-encoded CA certificate used to sign minted leaf certs.
    #[arg(long, default_value = "./proxy_ca.crt")]
    pub ca_cert: PathBuf,

    /// PEM-encoded CA private key.
    #[arg(long, default_value = "./proxy_ca.key")]
    pub ca_key: PathBuf,

    /// Directory where minted leaf certs are cached on disk.
    #[arg(long, default_value = "./certs")]
    pub certs_dir: PathBuf,

    /// Log output format.
    #[arg(long, value_enum, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Seconds to wait for in-flight connections to drain on shutdown.
    #[arg(long, default_value_t = 10)]
    pub shutdown_grace_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = ProxyConfig::parse_from(["mitm-proxy"]);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8080);
        assert_eq!(config.cache_ttl_seconds, 3600);
        assert_eq!(config.shutdown_grace_seconds, 10);
    }

    #[test]
    fn flags_override_defaults() {
        let config = ProxyConfig::parse_from([
            "mitm-proxy",
            "--host",
            "0.0.0.0",
            "--port",
            "9090",
            "--cache-ttl-seconds",
            "0",
        ]);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9090);
        assert_eq!(config.cache_ttl_seconds, 0);
    }
}
