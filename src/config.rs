use std::{fs::read_to_string, net::SocketAddr};

use anyhow::{Context, Result, ensure};
use clap::Parser;
use serde::Deserialize;

/// SSL configuration
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Ssl {
    ///
    /// SSL private key file
    ///
    #[serde(default = "Ssl::private_key")]
    pub private_key: String,
    ///
    /// SSL certificate chain file
    ///
    #[serde(default = "Ssl::certificate_chain")]
    pub certificate_chain: String,
}

impl Ssl {
    fn private_key() -> String {
        "server.key".to_string()
    }

    fn certificate_chain() -> String {
        "server.crt".to_string()
    }
}

impl Default for Ssl {
    fn default() -> Self {
        Self {
            private_key: Self::private_key(),
            certificate_chain: Self::certificate_chain(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// control channel listen address
    ///
    /// The address and port the TLS control channel binds to. The RDMA
    /// transport itself never listens here; every wire-level parameter
    /// is exchanged over this channel before a single RDMA packet
    /// moves.
    ///
    #[serde(default = "Server::listen")]
    pub listen: SocketAddr,
    ///
    /// connection slot table size
    ///
    /// Bounds concurrent clients; admission closes any TLS stream that
    /// arrives while the table is full. Overridable with the
    /// MAX_CLIENTS environment variable.
    ///
    #[serde(default = "Server::max_clients")]
    pub max_clients: usize,
    ///
    /// RDMA device index
    ///
    /// Index into the device enumeration of the device to open. The
    /// broker opens exactly one device for its whole lifetime.
    ///
    #[serde(default)]
    pub device_index: usize,
}

impl Server {
    fn listen() -> SocketAddr {
        "0.0.0.0:4433".parse().unwrap()
    }

    fn max_clients() -> usize {
        100
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            max_clients: Self::max_clients(),
            device_index: 0,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub ssl: Ssl,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: rdma-broker --config /etc/rdma-broker/config.toml
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// If a configuration file path is specified the configuration is
    /// read from it, otherwise the built-in defaults are used. The
    /// MAX_CLIENTS environment variable overrides the slot table size
    /// either way.
    ///
    pub fn load() -> Result<Self> {
        let mut config: Self = match Cli::parse().config {
            Some(path) => toml::from_str(&read_to_string(&path)?)?,
            None => Self::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("MAX_CLIENTS") {
            self.server.max_clients = value
                .parse()
                .with_context(|| format!("invalid MAX_CLIENTS value: {}", value))?;
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            (1..=10_000).contains(&self.server.max_clients),
            "max-clients must be within [1, 10000], got {}",
            self.server.max_clients
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert_eq!(config.server.listen.port(), 4433);
        assert_eq!(config.server.max_clients, 100);
        assert_eq!(config.server.device_index, 0);
        assert_eq!(config.ssl.private_key, "server.key");
        assert_eq!(config.ssl.certificate_chain, "server.crt");
    }

    #[test]
    fn kebab_case_file() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9433"
            max-clients = 512
            device-index = 1

            [ssl]
            private-key = "/etc/broker/key.pem"
            certificate-chain = "/etc/broker/chain.pem"

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen.port(), 9433);
        assert_eq!(config.server.max_clients, 512);
        assert_eq!(config.server.device_index, 1);
        assert_eq!(config.ssl.private_key, "/etc/broker/key.pem");
    }

    #[test]
    fn max_clients_env_override() {
        let mut config = Config::default();

        unsafe { std::env::set_var("MAX_CLIENTS", "42") };
        config.apply_env_overrides().unwrap();
        unsafe { std::env::remove_var("MAX_CLIENTS") };

        assert_eq!(config.server.max_clients, 42);
    }
}
