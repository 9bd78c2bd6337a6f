use serde::Deserialize;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use backtrace::Backtrace;
use log::{error, warn};

// Main configuration struct
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub imap: ImapConfig,
    pub server: ServerConfig,
    pub fetch: FetchConfig,
    pub logging: LoggingConfig,
    /// YAML file with the invoice classifier tables; built-in tables otherwise.
    pub classifier_settings: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ImapConfig {
    pub server: String,
    pub port: u16,
    pub mailbox: String,
    /// Provider tag used in external message ids, `<uid@tag>`.
    pub uid_tag: String,
    pub connect_timeout_seconds: u64,
    pub auth_timeout_seconds: u64,
    pub accept_invalid_certs: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        ImapConfig {
            server: "imap.mail.yahoo.com".to_string(),
            port: 993,
            mailbox: "INBOX".to_string(),
            uid_tag: "yahoo.imap".to_string(),
            connect_timeout_seconds: 30,
            auth_timeout_seconds: 30,
            accept_invalid_certs: false,
        }
    }
}

// REST server configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FetchConfig {
    pub default_limit: usize,
    /// Bytes of body text requested per message for snippets.
    pub preview_bytes: u32,
    pub decode_timeout_seconds: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            default_limit: 100,
            preview_bytes: 2048,
            decode_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// `PORT` in the environment wins over the configured server port.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(port) = std::env::var("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(e) => warn!("Ignoring PORT={}: {}", port, e),
            }
        }
        self
    }
}

pub fn parse_settings(yaml: &str) -> Result<Config> {
    if yaml.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(yaml).context("Cannot deserialize settings")
}

pub fn load_settings(path: &Path) -> Result<Config> {
    // Open the YAML file
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            error!("Error: {}", err);

            // Capture and print the backtrace
            let backtrace = Backtrace::new();
            error!("Backtrace:\n{:?}", backtrace);
            return Err(err).with_context(|| format!("Cannot find settings {}", path.display()));
        }
    };

    let mut yaml = String::new();
    BufReader::new(file)
        .read_to_string(&mut yaml)
        .with_context(|| format!("Cannot read settings {}", path.display()))?;

    parse_settings(&yaml)
}
