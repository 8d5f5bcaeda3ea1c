//! Deployment configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, an
//! optional TOML file, a `.env` file in the working directory, and the
//! process environment. Secrets (`POSTGRES_PASSWORD`, `SECRET_KEY`) are
//! expected from the environment; the TOML file holds the layout.

use crate::container::is_valid_name;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const ENV_POSTGRES_USER: &str = "POSTGRES_USER";
pub const ENV_POSTGRES_PASSWORD: &str = "POSTGRES_PASSWORD";
pub const ENV_POSTGRES_DB: &str = "POSTGRES_DB";
pub const ENV_SECRET_KEY: &str = "SECRET_KEY";
pub const ENV_ALGORITHM: &str = "ALGORITHM";
pub const ENV_ACCESS_TOKEN_EXPIRE_MINUTES: &str = "ACCESS_TOKEN_EXPIRE_MINUTES";
pub const ENV_DATABASE_URL: &str = "SQLALCHEMY_DATABASE_URL";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Working copy the images are built from
    pub repo_path: PathBuf,
    pub remote: String,
    pub branch: String,
    /// Cloned into `repo_path` when no working copy exists yet
    pub clone_url: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            remote: "origin".to_string(),
            branch: "main".to_string(),
            clone_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub image: String,
    pub user: String,
    pub password: String,
    pub name: String,
    pub port: u16,
    pub test_port: u16,
    pub volume: String,
    pub test_volume: String,
    /// Generated at load time when left unset
    pub test_password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            image: "postgres:16".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            name: "socialmedia".to_string(),
            port: 5432,
            test_port: 2345,
            volume: "pg_prod_data".to_string(),
            test_volume: "pg_test_data".to_string(),
            test_password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub replicas: usize,
    pub port: u16,
    pub secret_key: String,
    pub algorithm: String,
    pub access_token_expire_minutes: u32,
    pub dockerfile: PathBuf,
    pub test_dockerfile: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            replicas: 2,
            port: 8000,
            secret_key: String::new(),
            algorithm: "HS256".to_string(),
            access_token_expire_minutes: 30,
            dockerfile: PathBuf::from("Dockerfile"),
            test_dockerfile: PathBuf::from("Dockerfile.test"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub port: u16,
    pub dockerfile: PathBuf,
    /// Where the rendered nginx.conf is written, relative to the working copy
    pub conf_path: PathBuf,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            port: 80,
            dockerfile: PathBuf::from("Dockerfile.nginx"),
            conf_path: PathBuf::from("nginx/default.conf"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub enabled: bool,
    /// Defaults to the proxy on localhost
    pub url: Option<String>,
    pub attempts: usize,
    pub timeout_secs: u64,
    /// Defaults to the replica count
    pub min_distinct: Option<usize>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            attempts: 10,
            timeout_secs: 60,
            min_distinct: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Prefix for container, network and image names
    pub project: String,
    /// `docker` or `podman`; detected when unset
    pub runtime: Option<String>,
    pub source: SourceConfig,
    pub database: DatabaseConfig,
    pub app: AppConfig,
    pub proxy: ProxySettings,
    pub verify: VerifyConfig,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            project: "socialmedia".to_string(),
            runtime: None,
            source: SourceConfig::default(),
            database: DatabaseConfig::default(),
            app: AppConfig::default(),
            proxy: ProxySettings::default(),
            verify: VerifyConfig::default(),
        }
    }
}

impl DeployConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Defaults or `path`, then `.env`, then the process environment
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        if let Ok(dotenv_path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", dotenv_path.display());
        }

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.ensure_test_password();
        Ok(config)
    }

    /// Overlay the deployment environment variables
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(user) = lookup(ENV_POSTGRES_USER) {
            self.database.user = user;
        }
        if let Some(password) = lookup(ENV_POSTGRES_PASSWORD) {
            self.database.password = password;
        }
        if let Some(name) = lookup(ENV_POSTGRES_DB) {
            self.database.name = name;
        }
        if let Some(secret) = lookup(ENV_SECRET_KEY) {
            self.app.secret_key = secret;
        }
        if let Some(algorithm) = lookup(ENV_ALGORITHM) {
            self.app.algorithm = algorithm;
        }
        if let Some(minutes) = lookup(ENV_ACCESS_TOKEN_EXPIRE_MINUTES) {
            self.app.access_token_expire_minutes =
                minutes
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: ENV_ACCESS_TOKEN_EXPIRE_MINUTES.to_string(),
                        value: minutes.clone(),
                    })?;
        }
        Ok(())
    }

    pub fn ensure_test_password(&mut self) {
        if self.database.test_password.is_none() {
            self.database.test_password = Some(random_password(24));
        }
    }

    pub fn test_password(&self) -> &str {
        self.database
            .test_password
            .as_deref()
            .unwrap_or(&self.database.password)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify.timeout_secs)
    }

    pub fn verify_url(&self) -> String {
        self.verify
            .url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.proxy.port))
    }

    pub fn min_distinct(&self) -> usize {
        self.verify.min_distinct.unwrap_or(self.app.replicas)
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_repo_path(mut self, repo_path: impl Into<PathBuf>) -> Self {
        self.source.repo_path = repo_path.into();
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.app.replicas = replicas;
        self
    }

    pub fn with_secrets(
        mut self,
        database_password: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.database.password = database_password.into();
        self.app.secret_key = secret_key.into();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_name(&self.project) || self.project.chars().any(|c| c.is_ascii_uppercase())
        {
            return Err(format!(
                "Project name '{}' must be lowercase letters, digits, '.', '_' or '-'",
                self.project
            ));
        }

        if let Some(runtime) = &self.runtime {
            if runtime != "docker" && runtime != "podman" {
                return Err(format!("Unknown container runtime '{}'", runtime));
            }
        }

        if self.app.secret_key.is_empty() {
            return Err(format!("{} must be set", ENV_SECRET_KEY));
        }
        if self.database.password.is_empty() {
            return Err(format!("{} must be set", ENV_POSTGRES_PASSWORD));
        }
        if self.database.user.is_empty() || self.database.name.is_empty() {
            return Err("Database user and name cannot be empty".to_string());
        }
        if self.app.algorithm.is_empty() {
            return Err(format!("{} cannot be empty", ENV_ALGORITHM));
        }
        if self.app.access_token_expire_minutes == 0 {
            return Err(format!(
                "{} must be greater than 0",
                ENV_ACCESS_TOKEN_EXPIRE_MINUTES
            ));
        }
        if self.app.replicas == 0 {
            return Err("At least one application replica is required".to_string());
        }

        let ports = [
            self.database.port,
            self.database.test_port,
            self.proxy.port,
        ];
        if ports.contains(&0) {
            return Err("Published ports must be greater than 0".to_string());
        }
        if ports[0] == ports[1] || ports[0] == ports[2] || ports[1] == ports[2] {
            return Err("Database, test database and proxy ports must differ".to_string());
        }
        if self.app.port == 0 {
            return Err("Application port must be greater than 0".to_string());
        }

        for volume in [&self.database.volume, &self.database.test_volume] {
            if !is_valid_name(volume) {
                return Err(format!("Invalid volume name '{}'", volume));
            }
        }
        if self.database.volume == self.database.test_volume {
            return Err("Production and test volumes must differ".to_string());
        }

        if self.verify.enabled && self.verify.attempts < self.min_distinct() {
            return Err(format!(
                "Verification needs at least {} attempts to reach every replica",
                self.min_distinct()
            ));
        }
        // the deadline would pass before the first request
        if self.verify.enabled && self.verify.timeout_secs == 0 {
            return Err("Verification timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

fn random_password(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
