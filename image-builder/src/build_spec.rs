//! Image build specifications.
//!
//! An [`ImageSpec`] names the image to produce, the Dockerfile to build it
//! from and the build context. [`ImageSpec::build_args`] renders the runtime
//! invocation; running it is left to whoever owns the container runtime.

use crate::{ImageBuilderError, ImageBuilderResult, ImageKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let component = r"[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*";
        let pattern = format!(
            r"^(?:[a-zA-Z0-9.-]+(?::[0-9]+)?/)?{component}(?:/{component})*(?::[A-Za-z0-9_][A-Za-z0-9_.-]{{0,127}})?$"
        );
        Regex::new(&pattern).expect("image reference pattern is valid")
    })
}

/// Check an image reference (`[registry/]repository[:tag]`) against the
/// runtime's naming rules
pub fn is_valid_reference(reference: &str) -> bool {
    !reference.is_empty() && reference.len() <= 255 && reference_pattern().is_match(reference)
}

/// Specification for a single image build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// What the image is for
    pub kind: ImageKind,
    /// Reference the built image is tagged with
    pub tag: String,
    /// Dockerfile path, relative to the context unless absolute
    pub dockerfile: PathBuf,
    /// Build context directory
    pub context: PathBuf,
    /// `--build-arg` values
    pub build_args: BTreeMap<String, String>,
}

impl ImageSpec {
    /// Create a spec using the kind's default Dockerfile and `.` as context
    pub fn new(kind: ImageKind, tag: impl Into<String>) -> Self {
        Self {
            kind,
            tag: tag.into(),
            dockerfile: PathBuf::from(kind.default_dockerfile()),
            context: PathBuf::from("."),
            build_args: BTreeMap::new(),
        }
    }

    /// Derive the tag from a project name, e.g. `social` + `App` -> `social-app:latest`
    pub fn for_project(kind: ImageKind, project: &str) -> Self {
        Self::new(
            kind,
            format!("{}-{}:latest", project, kind.repository_suffix()),
        )
    }

    pub fn with_dockerfile(mut self, dockerfile: impl Into<PathBuf>) -> Self {
        self.dockerfile = dockerfile.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<PathBuf>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_build_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_args.insert(key.into(), value.into());
        self
    }

    /// Dockerfile location as the runtime will resolve it
    pub fn dockerfile_path(&self) -> PathBuf {
        if self.dockerfile.is_absolute() {
            self.dockerfile.clone()
        } else {
            self.context.join(&self.dockerfile)
        }
    }

    /// Validate the reference and build arguments
    ///
    /// Does not touch the filesystem; see [`ImageSpec::check_sources`].
    pub fn validate(&self) -> ImageBuilderResult<()> {
        if !is_valid_reference(&self.tag) {
            return Err(ImageBuilderError::InvalidReference {
                reference: self.tag.clone(),
            });
        }

        for key in self.build_args.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(ImageBuilderError::InvalidBuildArg(key.clone()));
            }
        }

        Ok(())
    }

    /// Verify the Dockerfile exists in an already checked out context
    pub fn check_sources(&self) -> ImageBuilderResult<()> {
        let path = self.dockerfile_path();
        if !path.is_file() {
            return Err(ImageBuilderError::DockerfileNotFound(path));
        }
        Ok(())
    }

    /// Arguments for `<runtime> build ...`
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "-t".to_string(),
            self.tag.clone(),
            "-f".to_string(),
            self.dockerfile_path().display().to_string(),
        ];

        for (key, value) in &self.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.context.display().to_string());
        args
    }
}
