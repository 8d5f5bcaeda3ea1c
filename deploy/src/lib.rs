//! Deployment of the replicated web application.
//!
//! Builds the images, runs the test suite against a disposable database, and
//! replaces the production stack (database, application replicas, proxy)
//! through the local container runtime.

pub mod checkout;
pub mod config;
pub mod container;
pub mod pipeline;
pub mod topology;
pub mod verify;

pub use checkout::{checkout, CheckoutError, CheckoutSpec};
pub use config::{ConfigError, DeployConfig};
pub use container::{
    detect_runtime, resolve_runtime, CliRunner, CommandLine, CommandOutput, CommandRunner,
    ContainerError, ContainerRuntime, ContainerSpec, DryRunRunner,
};
pub use pipeline::{
    preflight, Pipeline, PipelineError, PipelineReport, Stage, Step, StepAction, StepOutcome,
    StepRecord,
};
pub use topology::{database_url, Environment, Images, Topology};
pub use verify::{verify_rotation, VerifyError, VerifyReport};
