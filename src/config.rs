use std::net::SocketAddr;

use regex::Regex;
use serde::Deserialize;

use crate::vars::{render_template, BerthVarsMaterialized, VarsError};

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8488))
}

fn default_source_port() -> u16 {
    8080
}

/// The `berth.toml` schema, before validation.
#[derive(Debug, Deserialize)]
pub struct BerthConfigFile {
    /// Address the HTTP API binds to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// First port probed when a branch sees its first deployment.
    pub lower_port: u16,
    /// The port the containerized service exposes.
    #[serde(default = "default_source_port")]
    pub source_port: u16,
    /// Endpoint prefix reported on success, e.g. "http://localhost".
    pub base_url: String,
    /// Regexes that signal a successful startup when matched against
    /// the container's accumulated stdout.
    pub success_patterns: Vec<String>,
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub push: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BerthConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Templating error: {0:?}")]
    Template(#[from] minijinja::Error),
    #[error("Vars error: {0}")]
    Vars(#[from] VarsError),
    #[error("Invalid success pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("success_patterns must not be empty")]
    NoPatterns,
    #[error("Invalid base_url: {0}")]
    BaseUrl(#[from] url::ParseError),
}

/// Validated configuration.
#[derive(Debug)]
pub struct BerthConfig {
    pub listen: SocketAddr,
    pub lower_port: u16,
    pub source_port: u16,
    pub base_url: String,
    pub success_patterns: Vec<Regex>,
    pub registry: Option<RegistryConfig>,
}

impl BerthConfigFile {
    fn try_init_from_string(
        config: &str,
        vars: &BerthVarsMaterialized,
    ) -> Result<Self, BerthConfigError> {
        let rendered = render_template(config, vars)?;
        Ok(toml::from_str(&rendered)?)
    }

    pub fn try_init() -> Result<Self, BerthConfigError> {
        use std::io::Read;
        let mut config = String::new();
        std::fs::File::open(&crate::cli::get_cli_args().config)?.read_to_string(&mut config)?;
        let vars = BerthVarsMaterialized::try_init()?;

        Self::try_init_from_string(&config, &vars)
    }

    pub fn into_config(self) -> Result<BerthConfig, BerthConfigError> {
        if self.success_patterns.is_empty() {
            return Err(BerthConfigError::NoPatterns);
        }
        let success_patterns = self
            .success_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;

        // Validated but kept as a string: the endpoint is built by
        // appending ":port", which Url would normalize away.
        url::Url::parse(&self.base_url)?;

        Ok(BerthConfig {
            listen: self.listen,
            lower_port: self.lower_port,
            source_port: self.source_port,
            base_url: self.base_url,
            success_patterns,
            registry: self.registry,
        })
    }
}

impl BerthConfig {
    pub fn try_init() -> Result<Self, BerthConfigError> {
        BerthConfigFile::try_init()?.into_config()
    }
}
