use std::{env, fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Hub {
    /// control socket bind address
    ///
    /// The address agents dial for the control channel. The port can
    /// also come from `--port` or the `PORT` / `HUB_PORT` environment;
    /// one of the three is required.
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    /// pre-allocated directory capacity
    #[serde(default = "Hub::capacity")]
    pub capacity: usize,

    /// trust agent-supplied addresses verbatim
    ///
    /// Development mode only. The default policy publishes the observed
    /// remote IP with the agent-supplied port, which defeats naive
    /// spoofing of peer identity by address.
    #[serde(default)]
    pub trust_client_address: bool,
}

impl Hub {
    fn capacity() -> usize {
        1024
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self {
            listen: None,
            capacity: Self::capacity(),
            trust_client_address: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Api {
    /// http server bind address
    ///
    /// Informational surface only, but it enumerates every agent the
    /// directory knows; do not expose it directly to an unsafe
    /// environment.
    #[serde(default = "Api::listen")]
    pub listen: SocketAddr,
}

impl Api {
    fn listen() -> SocketAddr {
        "127.0.0.1:3000".parse().unwrap()
    }
}

impl Default for Api {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
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

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
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
    /// log level
    ///
    /// How chatty the hub is: error, warn, info, debug or trace.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub hub: Hub,
    #[serde(default)]
    pub api: Api,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// path to a toml configuration file.
    #[arg(long)]
    config: Option<String>,

    /// control socket port, overriding the configuration file.
    #[arg(long, short)]
    port: Option<u16>,
}

impl Config {
    /// Load command line parameters, the optional configuration file and
    /// the environment. The control port is required and may come from
    /// any of the three; missing everywhere is fatal at startup.
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();

        let mut config: Config = match &cli.config {
            Some(path) => toml::from_str(
                &read_to_string(path).with_context(|| format!("read config file: {}", path))?,
            )
            .context("parse config file")?,
            None => Config::default(),
        };

        let env_port = ["PORT", "HUB_PORT"]
            .iter()
            .find_map(|name| env::var(name).ok())
            .map(|value| value.parse::<u16>().context("parse PORT / HUB_PORT"))
            .transpose()?;

        if let Some(port) = cli.port.or(env_port) {
            let host = config
                .hub
                .listen
                .map(|addr| addr.ip())
                .unwrap_or_else(|| "0.0.0.0".parse().unwrap());

            config.hub.listen = Some(SocketAddr::new(host, port));
        }

        if config.hub.listen.is_none() {
            bail!("hub port is required: set PORT / HUB_PORT, pass --port, or configure hub.listen");
        }

        Ok(config)
    }

    /// The resolved control socket address. [`Config::load`] guarantees
    /// it is present.
    pub fn control_addr(&self) -> SocketAddr {
        self.hub
            .listen
            .expect("control listen address resolved at load")
    }
}
