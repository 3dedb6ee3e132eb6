use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::BrokerConfig;

#[derive(Parser, Debug)]
#[command(name = "pgbroker")]
#[command(about = "Provision and converge multi-node PostgreSQL clusters")]
#[command(version)]
pub struct Args {
    /// Path to the broker config file (defaults to ~/.pgbroker/config.yml)
    #[arg(short, long, value_name = "FILE", env = "PGBROKER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Path to a .env file loaded before the config
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Override the API bind address
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the API port
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Validate the config, print a summary and exit
    #[arg(long)]
    pub check: bool,
}

impl Args {
    /// Apply command line overrides to a loaded config
    pub fn apply_overrides(&self, config: &mut BrokerConfig) {
        if let Some(ref addr) = self.bind_addr {
            config.broker.bind_addr = addr.clone();
        }
        if let Some(port) = self.port {
            config.broker.port = port;
        }
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Summary printed by `--check`
pub fn format_check(config: &BrokerConfig, path: &str) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "pgbroker v{} - Configuration Check\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Config: {}\n\n", path));

    output.push_str(&format!(
        "API: {}:{} (auth: {})\n",
        config.broker.bind_addr,
        config.broker.port,
        if config.broker.api_key.is_some() { "api key" } else { "none" }
    ));
    match &config.kv_store {
        Some(kv) => output.push_str(&format!("Store: etcd at {} (prefix '{}')\n", kv.endpoint, kv.prefix)),
        None => output.push_str("Store: in-memory (development only)\n"),
    }
    output.push_str(&format!(
        "Public ports: {}-{} ({} available)\n",
        config.routing.port_min,
        config.routing.port_max,
        config.routing.capacity()
    ));
    output.push_str(&format!(
        "Backups: {}\n\n",
        if config.callbacks.is_some() { "callback commands" } else { "in-memory" }
    ));

    output.push_str(&format!("Backends ({}):\n", config.backends.len()));
    for backend in &config.backends {
        output.push_str(&format!(
            "  - {} [{}] {}\n",
            backend.guid, backend.availability_zone, backend.uri
        ));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn backend(guid: &str, az: &str) -> BackendConfig {
        BackendConfig {
            guid: guid.to_string(),
            uri: format!("http://{}:8080", guid),
            username: String::new(),
            password: String::new(),
            availability_zone: az.to_string(),
        }
    }

    #[test]
    fn test_parse_args() {
        let args = Args::parse_from(["pgbroker", "-vv", "--port", "9000", "--check"]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.port, Some(9000));
        assert!(args.check);
        assert!(args.bind_addr.is_none());
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from(["pgbroker", "--bind-addr", "127.0.0.1", "-p", "9001"]);
        let mut config = BrokerConfig::with_backends(vec![backend("b1", "z1")]);
        args.apply_overrides(&mut config);
        assert_eq!(config.broker.bind_addr, "127.0.0.1");
        assert_eq!(config.broker.port, 9001);
    }

    #[test]
    fn test_format_check() {
        let config = BrokerConfig::with_backends(vec![backend("b1", "z1"), backend("b2", "z2")]);
        let output = format_check(&config, "/etc/pgbroker.yml");

        assert!(output.contains("Config: /etc/pgbroker.yml"));
        assert!(output.contains("Store: in-memory"));
        assert!(output.contains("Backends (2):"));
        assert!(output.contains("  - b2 [z2] http://b2:8080"));
    }
}
