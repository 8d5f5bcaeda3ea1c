//! Container image build specifications for replica-deploy
//!
//! The deployment consists of three images: the application image that runs
//! in every replica, a test image that runs the application's test suite
//! against a disposable database, and the proxy image that fronts the
//! replicas. This crate describes those builds and turns them into the
//! argument vectors handed to the container runtime's `build` command.

pub mod build_spec;

pub use build_spec::{is_valid_reference, ImageSpec};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors related to image building
#[derive(Error, Debug)]
pub enum ImageBuilderError {
    #[error("Invalid image reference '{reference}'")]
    InvalidReference { reference: String },
    #[error("Dockerfile not found: {0}")]
    DockerfileNotFound(PathBuf),
    #[error("Invalid build argument '{0}': keys must be non-empty and contain no '='")]
    InvalidBuildArg(String),
}

pub type ImageBuilderResult<T> = Result<T, ImageBuilderError>;

/// Kind of image in the deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    /// The application served by every replica
    App,
    /// The application plus its test suite
    Test,
    /// The reverse proxy in front of the replicas
    Proxy,
}

impl ImageKind {
    /// Dockerfile used when the configuration does not name one
    pub fn default_dockerfile(&self) -> &'static str {
        match self {
            ImageKind::App => "Dockerfile",
            ImageKind::Test => "Dockerfile.test",
            ImageKind::Proxy => "Dockerfile.nginx",
        }
    }

    /// Suffix appended to the project name to form the image repository
    pub fn repository_suffix(&self) -> &'static str {
        match self {
            ImageKind::App => "app",
            ImageKind::Test => "test",
            ImageKind::Proxy => "nginx",
        }
    }
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageKind::App => write!(f, "app"),
            ImageKind::Test => write!(f, "test"),
            ImageKind::Proxy => write!(f, "proxy"),
        }
    }
}
