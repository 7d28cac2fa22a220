//! Daemon settings and the services file.
//!
//! Settings are layered: built-in defaults, then an optional settings file, then `HARBOR_*`
//! environment variables (`HARBOR_HTTP_PORT=8080`, `HARBOR_ACME_EMAIL=ops@example.com`).

use harbor_protocol::{Config, ControlPlane, ServiceSpec};
use log::info;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SettingsError;
use crate::network::{parse_network, Ipv4Network, DEFAULT_SUPERNETS};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of all persistent state.
    pub data_dir: PathBuf,
    pub services_file: PathBuf,
    pub listen_addr: String,
    pub http_port: u16,
    pub https_port: u16,
    /// Port every service container listens on.
    pub container_port: u16,
    pub supernets: Vec<String>,
    /// HTTPS is only served when an ACME contact is configured.
    pub acme_email: Option<String>,
    /// Use the production ACME directory instead of staging.
    pub acme_production: bool,
    /// How often `serve` looks for deployments made by other processes.
    pub store_poll_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            services_file: PathBuf::from("harbor.yml"),
            listen_addr: "0.0.0.0".to_string(),
            http_port: 80,
            https_port: 443,
            container_port: 80,
            supernets: DEFAULT_SUPERNETS.iter().map(|s| s.to_string()).collect(),
            acme_email: None,
            acme_production: false,
            store_poll_secs: 2,
        }
    }
}

impl Settings {
    /// Loads settings from `file` (if given) and the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(true));
        }

        let settings: Settings = builder
            .add_source(config::Environment::with_prefix("HARBOR").separator("__"))
            .build()?
            .try_deserialize()?;

        // Validated up front so a typo fails at startup rather than at the first allocation.
        settings.supernets()?;
        Ok(settings)
    }

    pub fn subnet_record(&self) -> PathBuf {
        self.data_dir.join("subnets")
    }

    pub fn deployments_dir(&self) -> PathBuf {
        self.data_dir.join("deployments")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }

    pub fn store_poll_interval(&self) -> Duration {
        Duration::from_secs(self.store_poll_secs.max(1))
    }

    pub fn supernets(&self) -> Result<Vec<Ipv4Network>, SettingsError> {
        self.supernets
            .iter()
            .map(|s| parse_network(s).map_err(SettingsError::from))
            .collect()
    }
}

/// Layout of the services file.
#[derive(Debug, Deserialize)]
struct ServicesFile {
    control_plane: ControlPlane,
    #[serde(default)]
    services: BTreeMap<String, ServiceSpec>,
}

/// Parses and validates a services file; JSON by extension, YAML otherwise.
pub fn parse_services(contents: &str, json: bool) -> Result<Config, SettingsError> {
    let file: ServicesFile = if json {
        serde_json::from_str(contents).map_err(|e| SettingsError::Parse(e.to_string()))?
    } else {
        serde_yaml::from_str(contents).map_err(|e| SettingsError::Parse(e.to_string()))?
    };
    Ok(Config::from_specs(file.services, file.control_plane)?)
}

pub fn load_services(path: &Path) -> Result<Config, SettingsError> {
    let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let config = parse_services(&contents, json)?;
    info!(
        "Settings: loaded {} service(s) from {}",
        config.services().len(),
        path.display()
    );
    Ok(config)
}
