use crate::client::{ClientOptions, DEFAULT_MAX_PAYLOAD};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

pub const DEFAULT_PORT: u16 = 11300;
pub const DEFAULT_CONFIG_PATH: &str = "beanstalkd-view.yaml";

/// Arguments de ligne de commande (prioritaires sur le fichier et l'environnement)
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "beanstalkd-view", version, about = "Web dashboard for beanstalkd")]
pub struct Args {
    /// Fichier de configuration YAML
    #[arg(long, env = "BEANSTALKD_VIEW_CONFIG")]
    pub config: Option<String>,

    /// Adresse d'écoute HTTP (ex: 0.0.0.0:8080)
    #[arg(long)]
    pub listen: Option<String>,

    /// Instance beanstalkd, répétable (ex: --server 10.0.0.1:11300)
    #[arg(long = "server")]
    pub servers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ViewConfig {
    pub servers: Vec<String>,
    pub listen: String,
    pub base_path: String,
    pub connect_timeout_ms: u64,
    /// Taille maximale d'un bloc de données renvoyé par le démon
    pub max_payload_bytes: usize,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            servers: vec![format!("127.0.0.1:{DEFAULT_PORT}")],
            listen: "0.0.0.0:8080".into(),
            base_path: String::new(),
            connect_timeout_ms: 2000,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl ViewConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout: self.connect_timeout(),
            max_payload: self.max_payload_bytes,
        }
    }

    /// Préfixe de montage normalisé ("" ou "/xxx" sans slash final)
    pub fn mount_path(&self) -> Option<String> {
        let trimmed = self.base_path.trim().trim_matches('/');
        (!trimmed.is_empty()).then(|| format!("/{trimmed}"))
    }

    /// Surcharges : BEANSTALK_URL puis arguments CLI
    pub fn apply_overrides(&mut self, beanstalk_url: Option<&str>, args: &Args) {
        if let Some(url) = beanstalk_url {
            let servers = parse_server_list(url);
            if !servers.is_empty() {
                self.servers = servers;
            }
        }
        if !args.servers.is_empty() {
            self.servers = args.servers.iter().map(|s| normalize_address(s)).collect();
        }
        if let Some(listen) = &args.listen {
            self.listen = listen.clone();
        }
        self.servers = self.servers.iter().map(|s| normalize_address(s)).collect();
        if self.servers.is_empty() {
            self.servers = ViewConfig::default().servers;
        }
    }
}

/// "beanstalk://host:port/" -> "host:port" ; port 11300 ajouté si absent
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    let host = without_scheme.trim_end_matches('/');

    if has_port(host) {
        host.to_string()
    } else {
        format!("{host}:{DEFAULT_PORT}")
    }
}

fn has_port(host: &str) -> bool {
    let port = match host.strip_prefix('[') {
        // IPv6 : "[::1]:11300"
        Some(rest) => rest.split_once("]:").map(|(_, port)| port),
        None => host.rsplit_once(':').map(|(_, port)| port),
    };
    port.is_some_and(|p| p.parse::<u16>().is_ok())
}

/// Liste séparée par des virgules, entrées vides ignorées
pub fn parse_server_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(normalize_address)
        .collect()
}

pub async fn load_config(path: &str) -> ViewConfig {
    if Path::new(path).exists() {
        let txt = fs::read_to_string(path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return ViewConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            tracing::warn!("[config] invalid config {}: {}", path, e);
            ViewConfig::default()
        })
    } else {
        tracing::warn!("[config] no {} found, using default configuration", path);
        ViewConfig::default()
    }
}
