use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{fs, path::PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address players connect to (the TCP forwarder listener).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Backend server (Velocity/Paper) dialed once per connection.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Multiauth HTTP server listen address.
    #[serde(default = "default_auth_listen")]
    pub auth_listen: String,
    /// Session server base URLs, queried in parallel per hasJoined.
    #[serde(default = "default_session_servers")]
    pub session_servers: Vec<String>,
}

fn default_listen() -> String {
    "0.0.0.0:25565".into()
}

fn default_backend() -> String {
    "127.0.0.1:25566".into()
}

fn default_auth_listen() -> String {
    "127.0.0.1:8652".into()
}

fn default_session_servers() -> Vec<String> {
    vec![
        "https://sessionserver.mojang.com".into(),
        "https://api.minehut.com/mitm/proxy".into(),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend: default_backend(),
            auth_listen: default_auth_listen(),
            session_servers: default_session_servers(),
        }
    }
}

impl Config {
    /// Load from a TOML file, or fall back to defaults when no path is
    /// given. Every field is optional in the file.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let cfg: Config = match path {
            Some(path) => {
                let text =
                    fs::read_to_string(&path).with_context(|| format!("reading {path:?}"))?;
                toml::from_str(&text).with_context(|| "parsing config")?
            }
            None => Config::default(),
        };
        cfg.validated()
    }

    fn validated(mut self) -> Result<Self> {
        self.session_servers = self
            .session_servers
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if self.session_servers.is_empty() {
            bail!("at least one session server must be configured");
        }
        Ok(self)
    }
}
