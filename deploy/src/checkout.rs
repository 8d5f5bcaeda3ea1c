//! Source checkout
//!
//! Brings the working copy to the tip of the deployed branch, the way a CI
//! runner does before building: fetch, then a forced checkout of the fetched
//! commit with HEAD detached. Local modifications are discarded.

use crate::config::SourceConfig;
use git2::build::CheckoutBuilder;
use git2::{ErrorCode, Repository};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum CheckoutError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("No repository at {} and no clone URL configured", .path.display())]
    NotARepository { path: PathBuf },

    #[error("Branch '{branch}' not found on remote '{remote}'")]
    BranchNotFound { remote: String, branch: String },
}

pub type CheckoutResult<T> = Result<T, CheckoutError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSpec {
    pub repo_path: PathBuf,
    pub remote: String,
    pub branch: String,
    pub clone_url: Option<String>,
}

impl CheckoutSpec {
    pub fn new(repo_path: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            remote: "origin".to_string(),
            branch: branch.into(),
            clone_url: None,
        }
    }

    pub fn with_clone_url(mut self, url: impl Into<String>) -> Self {
        self.clone_url = Some(url.into());
        self
    }

    fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote, self.branch)
    }
}

impl From<&SourceConfig> for CheckoutSpec {
    fn from(source: &SourceConfig) -> Self {
        Self {
            repo_path: source.repo_path.clone(),
            remote: source.remote.clone(),
            branch: source.branch.clone(),
            clone_url: source.clone_url.clone(),
        }
    }
}

fn open_or_clone(spec: &CheckoutSpec) -> CheckoutResult<Repository> {
    match Repository::open(&spec.repo_path) {
        Ok(repo) => Ok(repo),
        Err(e) if e.code() == ErrorCode::NotFound => match &spec.clone_url {
            Some(url) => {
                info!("Cloning {} into {}", url, spec.repo_path.display());
                Ok(Repository::clone(url, &spec.repo_path)?)
            }
            None => Err(CheckoutError::NotARepository {
                path: spec.repo_path.clone(),
            }),
        },
        Err(e) => Err(e.into()),
    }
}

/// Fetch `branch` from `remote` and force-check out its tip. Returns the
/// commit id now checked out.
pub fn checkout(spec: &CheckoutSpec) -> CheckoutResult<String> {
    let repo = open_or_clone(spec)?;

    let refspec = format!("refs/heads/{}:{}", spec.branch, spec.tracking_ref());
    let mut remote = repo.find_remote(&spec.remote)?;
    debug!("Fetching {} from {}", refspec, spec.remote);
    remote.fetch(&[refspec.as_str()], None, None)?;

    let reference = repo.find_reference(&spec.tracking_ref()).map_err(|e| {
        if e.code() == ErrorCode::NotFound {
            CheckoutError::BranchNotFound {
                remote: spec.remote.clone(),
                branch: spec.branch.clone(),
            }
        } else {
            e.into()
        }
    })?;
    let commit = reference.peel_to_commit()?;

    repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
    repo.set_head_detached(commit.id())?;

    let id = commit.id().to_string();
    info!("Checked out {} at {}", spec.branch, &id[..12.min(id.len())]);
    Ok(id)
}
