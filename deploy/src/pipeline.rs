//! The CI/CD pipeline.
//!
//! A fixed, strictly sequential list of steps. Best-effort steps (removal of
//! resources left by a previous run) may fail without consequence; any other
//! failure stops the run and the remaining steps are reported as skipped.
//! Nothing is retried and nothing created before a failure is rolled back.
//! Tests run before anything in production is touched, so a failing test
//! run leaves the current deployment alone.

use crate::checkout::{checkout, CheckoutError, CheckoutSpec};
use crate::config::DeployConfig;
use crate::container::{CommandLine, CommandRunner, ContainerError, ContainerRuntime};
use crate::topology::{Images, Topology};
use crate::verify::{verify_rotation, VerifyError};
use balancer::render_nginx_conf;
use chrono::{DateTime, Utc};
use image_builder::{ImageBuilderError, ImageSpec};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Checkout error: {0}")]
    Checkout(#[from] CheckoutError),

    #[error("Verification failed: {0}")]
    Verify(#[from] VerifyError),

    #[error("Image error: {0}")]
    Image(#[from] ImageBuilderError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Pipeline failed at {stage} ({description}): {error}")]
    StepFailed {
        stage: Stage,
        description: String,
        error: String,
    },
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Checkout,
    CheckSources,
    Clean,
    BuildTestImage,
    RunTests,
    BuildProductionImage,
    ReplaceProduction,
    RebuildProxy,
    Verify,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Checkout => "checkout",
            Stage::CheckSources => "check-sources",
            Stage::Clean => "clean",
            Stage::BuildTestImage => "build-test-image",
            Stage::RunTests => "run-tests",
            Stage::BuildProductionImage => "build-production-image",
            Stage::ReplaceProduction => "replace-production",
            Stage::RebuildProxy => "rebuild-proxy",
            Stage::Verify => "verify",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    Command(CommandLine),
    Checkout(CheckoutSpec),
    /// Every image's Dockerfile exists in the checked out tree
    CheckSources(Vec<ImageSpec>),
    WriteFile {
        path: PathBuf,
        contents: String,
    },
    Verify {
        url: String,
        attempts: usize,
        min_distinct: usize,
        timeout: Duration,
    },
}

impl StepAction {
    /// Printable form; secrets in command lines are masked
    pub fn describe(&self) -> String {
        match self {
            StepAction::Command(command) => command.redacted(),
            StepAction::Checkout(spec) => format!(
                "git fetch {} {} && git checkout --force --detach",
                spec.remote, spec.branch
            ),
            StepAction::CheckSources(images) => {
                let paths: Vec<String> = images
                    .iter()
                    .map(|image| image.dockerfile_path().display().to_string())
                    .collect();
                format!("test -f {}", paths.join(" "))
            }
            StepAction::WriteFile { path, .. } => format!("write {}", path.display()),
            StepAction::Verify {
                url,
                attempts,
                min_distinct,
                ..
            } => format!(
                "GET {}/instance x{} (expect {} instances)",
                url.trim_end_matches('/'),
                attempts,
                min_distinct
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub stage: Stage,
    pub description: String,
    pub action: StepAction,
    /// Failure is logged and the run continues
    pub best_effort: bool,
}

impl Step {
    fn new(stage: Stage, description: impl Into<String>, action: StepAction) -> Self {
        Self {
            stage,
            description: description.into(),
            action,
            best_effort: false,
        }
    }

    fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    /// A best-effort step failed
    Tolerated { error: String },
    Failed { error: String },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub stage: Stage,
    pub description: String,
    pub action: String,
    pub best_effort: bool,
    pub outcome: StepOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.failed_step().is_none()
    }

    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps
            .iter()
            .find(|step| matches!(step.outcome, StepOutcome::Failed { .. }))
    }

    /// Whether any step of `stage` was attempted
    pub fn ran(&self, stage: Stage) -> bool {
        self.steps
            .iter()
            .any(|step| step.stage == stage && step.outcome != StepOutcome::Skipped)
    }

    pub fn into_result(self) -> PipelineResult<Self> {
        match self.failed_step() {
            Some(StepRecord {
                stage,
                description,
                outcome: StepOutcome::Failed { error },
                ..
            }) => Err(PipelineError::StepFailed {
                stage: *stage,
                description: description.clone(),
                error: error.clone(),
            }),
            _ => Ok(self),
        }
    }
}

/// Configuration, topologies and image tags are consistent. Run before
/// anything is executed for real.
pub fn preflight(config: &DeployConfig) -> PipelineResult<()> {
    config.validate().map_err(PipelineError::Config)?;
    Topology::production(config)?.validate()?;
    Topology::test(config)?.validate()?;

    let images = Images::for_config(config);
    images.app.validate()?;
    images.test.validate()?;
    images.proxy.validate()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    /// The full run: checkout, test, then replace production
    pub fn plan(config: &DeployConfig, runtime: ContainerRuntime) -> PipelineResult<Self> {
        let test = Topology::test(config)?;
        let production = Topology::production(config)?;
        let images = Images::for_config(config);
        let command = |line: CommandLine| StepAction::Command(line);

        let mut steps = vec![
            Step::new(
                Stage::Checkout,
                format!("Check out {}", config.source.branch),
                StepAction::Checkout(CheckoutSpec::from(&config.source)),
            ),
            Step::new(
                Stage::CheckSources,
                "Check Dockerfiles",
                StepAction::CheckSources(vec![
                    images.test.clone(),
                    images.app.clone(),
                    images.proxy.clone(),
                ]),
            ),
        ];

        // Leftovers of the previous test run
        for container in test.containers().rev() {
            steps.push(
                Step::new(
                    Stage::Clean,
                    format!("Remove {}", container.name),
                    command(runtime.remove_container(&container.name)),
                )
                .best_effort(),
            );
        }
        steps.push(
            Step::new(
                Stage::Clean,
                format!("Remove network {}", test.network),
                command(runtime.remove_network(&test.network)),
            )
            .best_effort(),
        );

        steps.push(
            Step::new(
                Stage::BuildTestImage,
                format!("Create network {}", test.network),
                command(runtime.create_network(&test.network)),
            )
            .best_effort(),
        );
        steps.push(Step::new(
            Stage::BuildTestImage,
            format!("Start {}", test.database.name),
            command(runtime.run_container(&test.database)),
        ));
        steps.push(Step::new(
            Stage::BuildTestImage,
            format!("Build {}", images.test.tag),
            command(runtime.build_image(&images.test)),
        ));

        if let Some(runner) = &test.test_runner {
            steps.push(Step::new(
                Stage::RunTests,
                format!("Run tests in {}", runner.name),
                command(runtime.run_container(runner)),
            ));
        }

        steps.extend(Self::production_steps(config, runtime, &production, &images));

        Ok(Self { steps })
    }

    /// Production only: build, replace, proxy, verify
    pub fn deploy(config: &DeployConfig, runtime: ContainerRuntime) -> PipelineResult<Self> {
        let production = Topology::production(config)?;
        let images = Images::for_config(config);

        let mut steps = vec![Step::new(
            Stage::CheckSources,
            "Check Dockerfiles",
            StepAction::CheckSources(vec![images.app.clone(), images.proxy.clone()]),
        )];
        steps.extend(Self::production_steps(config, runtime, &production, &images));
        Ok(Self { steps })
    }

    fn production_steps(
        config: &DeployConfig,
        runtime: ContainerRuntime,
        production: &Topology,
        images: &Images,
    ) -> Vec<Step> {
        let command = |line: CommandLine| StepAction::Command(line);
        let mut steps = vec![Step::new(
            Stage::BuildProductionImage,
            format!("Build {}", images.app.tag),
            command(runtime.build_image(&images.app)),
        )];

        // The proxy is attached to the network, so it goes too
        for container in production.containers().rev() {
            steps.push(
                Step::new(
                    Stage::ReplaceProduction,
                    format!("Remove {}", container.name),
                    command(runtime.remove_container(&container.name)),
                )
                .best_effort(),
            );
        }
        steps.push(
            Step::new(
                Stage::ReplaceProduction,
                format!("Remove network {}", production.network),
                command(runtime.remove_network(&production.network)),
            )
            .best_effort(),
        );
        steps.push(
            Step::new(
                Stage::ReplaceProduction,
                format!("Create network {}", production.network),
                command(runtime.create_network(&production.network)),
            )
            .best_effort(),
        );
        steps.push(Step::new(
            Stage::ReplaceProduction,
            format!("Start {}", production.database.name),
            command(runtime.run_container(&production.database)),
        ));
        for app in &production.apps {
            steps.push(Step::new(
                Stage::ReplaceProduction,
                format!("Start {}", app.name),
                command(runtime.run_container(app)),
            ));
        }

        if let Some(proxy) = &production.proxy {
            steps.push(Step::new(
                Stage::RebuildProxy,
                "Render nginx configuration",
                StepAction::WriteFile {
                    path: config.source.repo_path.join(&config.proxy.conf_path),
                    contents: render_nginx_conf(&production.proxy_config(config)),
                },
            ));
            steps.push(Step::new(
                Stage::RebuildProxy,
                format!("Build {}", images.proxy.tag),
                command(runtime.build_image(&images.proxy)),
            ));
            steps.push(
                Step::new(
                    Stage::RebuildProxy,
                    format!("Remove {}", proxy.name),
                    command(runtime.remove_container(&proxy.name)),
                )
                .best_effort(),
            );
            steps.push(Step::new(
                Stage::RebuildProxy,
                format!("Start {}", proxy.name),
                command(runtime.run_container(proxy)),
            ));
        }

        if config.verify.enabled {
            steps.push(Step::new(
                Stage::Verify,
                "Check that requests rotate across replicas",
                StepAction::Verify {
                    url: config.verify_url(),
                    attempts: config.verify.attempts,
                    min_distinct: config.min_distinct(),
                    timeout: config.verify_timeout(),
                },
            ));
        }

        steps
    }

    /// Every container and network of both environments; volumes are kept
    pub fn teardown(config: &DeployConfig, runtime: ContainerRuntime) -> PipelineResult<Self> {
        let mut steps = Vec::new();
        for topology in [Topology::production(config)?, Topology::test(config)?] {
            for container in topology.containers().rev() {
                steps.push(
                    Step::new(
                        Stage::Clean,
                        format!("Remove {}", container.name),
                        StepAction::Command(runtime.remove_container(&container.name)),
                    )
                    .best_effort(),
                );
            }
            steps.push(
                Step::new(
                    Stage::Clean,
                    format!("Remove network {}", topology.network),
                    StepAction::Command(runtime.remove_network(&topology.network)),
                )
                .best_effort(),
            );
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn without_stage(mut self, stage: Stage) -> Self {
        self.steps.retain(|step| step.stage != stage);
        self
    }

    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self.steps.iter().map(|step| step.stage).collect();
        stages.dedup();
        stages
    }

    /// Run every step in order. Never returns early: the report says what
    /// happened, [`PipelineReport::into_result`] turns it into an error.
    pub async fn run(&self, runner: &dyn CommandRunner) -> PipelineReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline", run_id = %run_id);

        async move {
            let started_at = Utc::now();
            info!("Starting pipeline with {} steps", self.steps.len());

            let mut records = Vec::with_capacity(self.steps.len());
            let mut halted = false;

            for step in &self.steps {
                let started = Instant::now();
                let outcome = if halted {
                    StepOutcome::Skipped
                } else {
                    info!("[{}] {}", step.stage, step.description);
                    match execute(&step.action, runner).await {
                        Ok(()) => StepOutcome::Succeeded,
                        Err(e) if step.best_effort => {
                            warn!("[{}] {} failed, continuing: {}", step.stage, step.description, e);
                            StepOutcome::Tolerated {
                                error: e.to_string(),
                            }
                        }
                        Err(e) => {
                            error!("[{}] {} failed: {}", step.stage, step.description, e);
                            halted = true;
                            StepOutcome::Failed {
                                error: e.to_string(),
                            }
                        }
                    }
                };

                records.push(StepRecord {
                    stage: step.stage,
                    description: step.description.clone(),
                    action: step.action.describe(),
                    best_effort: step.best_effort,
                    outcome,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }

            let report = PipelineReport {
                run_id,
                started_at,
                finished_at: Utc::now(),
                steps: records,
            };
            if report.succeeded() {
                info!("Pipeline finished");
            } else {
                error!("Pipeline stopped");
            }
            report
        }
        .instrument(span)
        .await
    }
}

async fn execute(action: &StepAction, runner: &dyn CommandRunner) -> PipelineResult<()> {
    if runner.is_dry_run() && !matches!(action, StepAction::Command(_)) {
        info!("[dry-run] {}", action.describe());
        return Ok(());
    }

    match action {
        StepAction::Command(command) => {
            runner.run(command).await?;
        }
        StepAction::Checkout(spec) => {
            let spec = spec.clone();
            tokio::task::spawn_blocking(move || checkout(&spec))
                .await
                .map_err(|e| PipelineError::Task(e.to_string()))??;
        }
        StepAction::CheckSources(images) => {
            for image in images {
                image.check_sources()?;
            }
        }
        StepAction::WriteFile { path, contents } => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, contents).await?;
        }
        StepAction::Verify {
            url,
            attempts,
            min_distinct,
            timeout,
        } => {
            verify_rotation(url, *attempts, *timeout)
                .await?
                .require(*min_distinct)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::DryRunRunner;

    fn config() -> DeployConfig {
        let mut config = DeployConfig::default().with_secrets("pg-secret", "jwt-secret");
        config.database.test_password = Some("throwaway".to_string());
        config
    }

    fn descriptions(pipeline: &Pipeline, stage: Stage) -> Vec<&str> {
        pipeline
            .steps()
            .iter()
            .filter(|step| step.stage == stage)
            .map(|step| step.description.as_str())
            .collect()
    }

    #[test]
    fn test_stage_order() {
        let pipeline = Pipeline::plan(&config(), ContainerRuntime::Docker).unwrap();
        assert_eq!(
            pipeline.stages(),
            vec![
                Stage::Checkout,
                Stage::CheckSources,
                Stage::Clean,
                Stage::BuildTestImage,
                Stage::RunTests,
                Stage::BuildProductionImage,
                Stage::ReplaceProduction,
                Stage::RebuildProxy,
                Stage::Verify,
            ]
        );
    }

    #[test]
    fn test_only_cleanup_is_best_effort() {
        let pipeline = Pipeline::plan(&config(), ContainerRuntime::Docker).unwrap();
        for step in pipeline.steps() {
            let cleanup = step.description.starts_with("Remove")
                || step.description.starts_with("Create network");
            assert_eq!(step.best_effort, cleanup, "{}", step.description);
        }
    }

    #[test]
    fn test_plan_contents() {
        let pipeline = Pipeline::plan(&config(), ContainerRuntime::Docker).unwrap();

        assert_eq!(
            descriptions(&pipeline, Stage::Clean),
            vec![
                "Remove socialmedia-tests",
                "Remove socialmedia-test-db",
                "Remove network socialmedia-test-net"
            ]
        );
        assert_eq!(
            descriptions(&pipeline, Stage::ReplaceProduction),
            vec![
                "Remove socialmedia-nginx",
                "Remove socialmedia-app-2",
                "Remove socialmedia-app-1",
                "Remove socialmedia-db",
                "Remove network socialmedia-net",
                "Create network socialmedia-net",
                "Start socialmedia-db",
                "Start socialmedia-app-1",
                "Start socialmedia-app-2",
            ]
        );
        assert_eq!(
            descriptions(&pipeline, Stage::RebuildProxy),
            vec![
                "Render nginx configuration",
                "Build socialmedia-nginx:latest",
                "Remove socialmedia-nginx",
                "Start socialmedia-nginx",
            ]
        );
    }

    #[test]
    fn test_rendered_conf_targets_replicas() {
        let pipeline = Pipeline::plan(&config(), ContainerRuntime::Docker).unwrap();
        let write = pipeline
            .steps()
            .iter()
            .find_map(|step| match &step.action {
                StepAction::WriteFile { path, contents } => Some((path, contents)),
                _ => None,
            })
            .unwrap();

        assert!(write.0.ends_with("nginx/default.conf"));
        assert!(write.1.contains("server socialmedia-app-1:8000;"));
        assert!(write.1.contains("server socialmedia-app-2:8000;"));
    }

    #[test]
    fn test_secrets_masked_in_descriptions() {
        let pipeline = Pipeline::plan(&config(), ContainerRuntime::Docker).unwrap();
        for step in pipeline.steps() {
            let described = step.action.describe();
            assert!(!described.contains("pg-secret"), "{}", described);
            assert!(!described.contains("jwt-secret"), "{}", described);
            assert!(!described.contains("throwaway"), "{}", described);
        }
    }

    #[test]
    fn test_deploy_skips_tests() {
        let pipeline = Pipeline::deploy(&config(), ContainerRuntime::Docker).unwrap();
        assert_eq!(
            pipeline.stages(),
            vec![
                Stage::CheckSources,
                Stage::BuildProductionImage,
                Stage::ReplaceProduction,
                Stage::RebuildProxy,
                Stage::Verify,
            ]
        );
    }

    #[test]
    fn test_sources_checked_before_any_build() {
        let pipeline = Pipeline::plan(&config(), ContainerRuntime::Docker).unwrap();
        let step = &pipeline.steps()[1];
        assert_eq!(step.stage, Stage::CheckSources);
        assert!(!step.best_effort);

        let StepAction::CheckSources(images) = &step.action else {
            panic!("expected CheckSources, got {:?}", step.action);
        };
        let tags: Vec<&str> = images.iter().map(|image| image.tag.as_str()).collect();
        assert_eq!(
            tags,
            vec![
                "socialmedia-test:latest",
                "socialmedia-app:latest",
                "socialmedia-nginx:latest"
            ]
        );
        assert!(step.action.describe().ends_with("Dockerfile.nginx"));
    }

    #[tokio::test]
    async fn test_missing_dockerfile_fails() {
        let repo = tempfile::TempDir::new().unwrap();
        std::fs::write(repo.path().join("Dockerfile"), "FROM python:3.12").unwrap();
        let config = config().with_repo_path(repo.path());
        let images = Images::for_config(&config);
        let action = StepAction::CheckSources(vec![images.app, images.proxy]);

        let result = execute(&action, &crate::container::CliRunner::new()).await;
        assert!(matches!(
            result,
            Err(PipelineError::Image(ImageBuilderError::DockerfileNotFound(path)))
                if path.ends_with("Dockerfile.nginx")
        ));

        // dry runs never look at the tree
        assert!(execute(&action, &DryRunRunner::new()).await.is_ok());
    }

    #[test]
    fn test_verify_disabled() {
        let mut config = config();
        config.verify.enabled = false;
        let pipeline = Pipeline::plan(&config, ContainerRuntime::Docker).unwrap();
        assert!(!pipeline.stages().contains(&Stage::Verify));
    }

    #[test]
    fn test_teardown_is_all_best_effort() {
        let pipeline = Pipeline::teardown(&config(), ContainerRuntime::Podman).unwrap();
        assert!(pipeline.steps().iter().all(|step| step.best_effort));
        assert_eq!(pipeline.steps().len(), 8);
        assert!(pipeline.steps().iter().all(|step| match &step.action {
            StepAction::Command(command) => {
                command.program == "podman" && !command.args.contains(&"volume".to_string())
            }
            _ => false,
        }));
    }

    #[tokio::test]
    async fn test_dry_run_records_commands_only() {
        let config = config();
        let pipeline = Pipeline::plan(&config, ContainerRuntime::Docker).unwrap();
        let runner = DryRunRunner::new();

        let report = pipeline.run(&runner).await;

        assert!(report.succeeded());
        assert!(report.steps.iter().all(|s| s.outcome == StepOutcome::Succeeded));
        let commands = pipeline
            .steps()
            .iter()
            .filter(|step| matches!(step.action, StepAction::Command(_)))
            .count();
        assert_eq!(runner.recorded().len(), commands);
    }

    #[test]
    fn test_preflight() {
        assert!(preflight(&config()).is_ok());
        assert!(matches!(
            preflight(&DeployConfig::default()),
            Err(PipelineError::Config(_))
        ));
        assert!(preflight(&config().with_project("Social Media")).is_err());
    }

    #[test]
    fn test_report_into_result() {
        let now = Utc::now();
        let report = PipelineReport {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            steps: vec![StepRecord {
                stage: Stage::RunTests,
                description: "Run tests".to_string(),
                action: "docker run".to_string(),
                best_effort: false,
                outcome: StepOutcome::Failed {
                    error: "exit status 1".to_string(),
                },
                duration_ms: 3,
            }],
        };

        assert!(report.ran(Stage::RunTests));
        assert!(!report.ran(Stage::ReplaceProduction));
        assert!(matches!(
            report.into_result(),
            Err(PipelineError::StepFailed {
                stage: Stage::RunTests,
                ..
            })
        ));
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::BuildTestImage.to_string(), "build-test-image");
        assert_eq!(Stage::CheckSources.to_string(), "check-sources");
        assert_eq!(
            serde_json::to_string(&Stage::RebuildProxy).unwrap(),
            "\"rebuild-proxy\""
        );
    }
}
