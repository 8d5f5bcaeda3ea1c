use async_trait::async_trait;
use axum::routing::get;
use axum::{Json, Router};
use deploy::container::ContainerResult;
use deploy::{
    CommandLine, CommandOutput, CommandRunner, ContainerError, ContainerRuntime, DeployConfig,
    Pipeline, PipelineError, Stage, StepOutcome,
};
use serde_json::{json, Value};
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Records every command; fails those matching a predicate
struct RecordingRunner {
    commands: Mutex<Vec<CommandLine>>,
    fails: Box<dyn Fn(&CommandLine) -> bool + Send + Sync>,
}

impl RecordingRunner {
    fn new() -> Self {
        Self::failing(|_| false)
    }

    fn failing(fails: impl Fn(&CommandLine) -> bool + Send + Sync + 'static) -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            fails: Box::new(fails),
        }
    }

    fn rendered(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.args.join(" "))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &CommandLine) -> ContainerResult<CommandOutput> {
        self.commands.lock().unwrap().push(command.clone());
        if (self.fails)(command) {
            return Err(ContainerError::CommandFailed {
                command: command.redacted(),
                status: "exit status: 1".to_string(),
                stderr: "simulated failure".to_string(),
                stdout: String::new(),
            });
        }
        Ok(CommandOutput::default())
    }
}

fn is_run_of(command: &CommandLine, name: &str) -> bool {
    command.args.first().map(String::as_str) == Some("run")
        && command.args.iter().any(|arg| arg == name)
}

/// A working copy with the three Dockerfiles the images build from
fn repo() -> TempDir {
    let repo = TempDir::new().unwrap();
    for name in ["Dockerfile", "Dockerfile.test", "Dockerfile.nginx"] {
        std::fs::write(repo.path().join(name), "FROM scratch\n").unwrap();
    }
    repo
}

fn config(repo: &TempDir) -> DeployConfig {
    let mut config = DeployConfig::default()
        .with_secrets("pg-secret", "jwt-secret")
        .with_repo_path(repo.path());
    config.database.test_password = Some("throwaway".to_string());
    config.verify.enabled = false;
    config
}

fn plan(config: &DeployConfig) -> Pipeline {
    Pipeline::plan(config, ContainerRuntime::Docker)
        .unwrap()
        .without_stage(Stage::Checkout)
}

#[tokio::test]
async fn test_failing_tests_leave_production_alone() {
    let repo = repo();
    let config = config(&repo);
    let runner = RecordingRunner::failing(|c| is_run_of(c, "socialmedia-tests"));

    let report = plan(&config).run(&runner).await;

    assert!(!report.succeeded());
    assert_eq!(report.failed_step().unwrap().stage, Stage::RunTests);
    assert!(!report.ran(Stage::BuildProductionImage));
    assert!(!report.ran(Stage::ReplaceProduction));
    assert!(!report.ran(Stage::RebuildProxy));

    let after_failure: Vec<_> = report
        .steps
        .iter()
        .skip_while(|s| s.stage != Stage::RunTests)
        .skip(1)
        .collect();
    assert!(!after_failure.is_empty());
    assert!(after_failure.iter().all(|s| s.outcome == StepOutcome::Skipped));

    // nothing in production was removed or started
    let commands = runner.rendered();
    assert!(!commands.iter().any(|c| c.contains("socialmedia-app-1")));
    assert!(!commands
        .iter()
        .any(|c| c.split(' ').any(|arg| arg == "socialmedia-net")));
    assert!(!repo.path().join("nginx/default.conf").exists());

    assert!(matches!(
        report.into_result(),
        Err(PipelineError::StepFailed {
            stage: Stage::RunTests,
            ..
        })
    ));
}

#[tokio::test]
async fn test_cleanup_failures_are_tolerated() {
    let repo = repo();
    let config = config(&repo);
    let runner = RecordingRunner::failing(|c| {
        let verb = c.args.first().map(String::as_str);
        verb == Some("rm") || c.args.get(1).map(String::as_str) == Some("rm")
    });

    let report = plan(&config).run(&runner).await;

    assert!(report.succeeded(), "{:?}", report.failed_step());
    let tolerated = report
        .steps
        .iter()
        .filter(|s| matches!(s.outcome, StepOutcome::Tolerated { .. }))
        .count();
    // test leftovers, production containers, both networks, proxy again
    assert_eq!(tolerated, 3 + 5 + 1);
    assert!(report.ran(Stage::RebuildProxy));
}

#[tokio::test]
async fn test_failed_image_build_stops_before_replacement() {
    let repo = repo();
    let config = config(&repo);
    let runner = RecordingRunner::failing(|c| {
        c.args.first().map(String::as_str) == Some("build")
            && c.args.iter().any(|a| a == "socialmedia-app:latest")
    });

    let report = plan(&config).run(&runner).await;

    assert_eq!(
        report.failed_step().unwrap().stage,
        Stage::BuildProductionImage
    );
    assert!(report.ran(Stage::RunTests));
    assert!(!report.ran(Stage::ReplaceProduction));
    assert!(!runner
        .rendered()
        .iter()
        .any(|c| c == "rm -f socialmedia-app-1"));
}

#[tokio::test]
async fn test_replica_start_failure_is_not_rolled_back() {
    let repo = repo();
    let config = config(&repo);
    let runner = RecordingRunner::failing(|c| is_run_of(c, "socialmedia-app-2"));

    let report = plan(&config).run(&runner).await;

    assert_eq!(report.failed_step().unwrap().description, "Start socialmedia-app-2");
    // app-1 is left running; no removal happens afterwards
    let commands = runner.rendered();
    let last = commands.last().unwrap();
    assert!(last.starts_with("run"));
    assert!(last.contains("socialmedia-app-2"));
    assert!(!report.ran(Stage::RebuildProxy));
}

#[tokio::test]
async fn test_successful_run_renders_proxy_conf() {
    let repo = repo();
    let config = config(&repo);
    let runner = RecordingRunner::new();

    let report = plan(&config).run(&runner).await;

    assert!(report.succeeded());
    assert!(report.finished_at >= report.started_at);

    let conf = std::fs::read_to_string(repo.path().join("nginx/default.conf")).unwrap();
    assert!(conf.contains("server socialmedia-app-1:8000;"));
    assert!(conf.contains("server socialmedia-app-2:8000;"));

    let commands = runner.rendered();
    let position = |needle: &str| commands.iter().position(|c| c.contains(needle)).unwrap();
    assert!(position("socialmedia-tests") < position("build -t socialmedia-app:latest"));
    assert!(position("run -d --name socialmedia-db") < position("run -d --name socialmedia-app-1"));
    assert!(position("build -t socialmedia-nginx:latest") < position("run -d --name socialmedia-nginx"));
}

#[tokio::test]
async fn test_missing_dockerfile_stops_before_any_command() {
    let repo = repo();
    std::fs::remove_file(repo.path().join("Dockerfile.test")).unwrap();
    let config = config(&repo);
    let runner = RecordingRunner::new();

    let report = plan(&config).run(&runner).await;

    let failed = report.failed_step().unwrap();
    assert_eq!(failed.stage, Stage::CheckSources);
    match &failed.outcome {
        StepOutcome::Failed { error } => assert!(error.contains("Dockerfile.test"), "{}", error),
        other => panic!("expected a failure, got {:?}", other),
    }
    assert!(!report.ran(Stage::Clean));
    assert!(runner.rendered().is_empty());

    // deploy only needs the application and proxy Dockerfiles
    let deploy = Pipeline::deploy(&config, ContainerRuntime::Docker).unwrap();
    let report = deploy.run(&RecordingRunner::new()).await;
    assert!(report.succeeded(), "{:?}", report.failed_step());
}

#[tokio::test]
async fn test_report_as_json() {
    let repo = repo();
    let config = config(&repo);
    let runner = RecordingRunner::failing(|c| is_run_of(c, "socialmedia-tests"));

    let report = plan(&config).run(&runner).await;
    let value: Value = serde_json::to_value(&report).unwrap();

    assert_eq!(value["run_id"], json!(report.run_id.to_string()));
    let steps = value["steps"].as_array().unwrap();
    assert_eq!(steps[0]["stage"], "check-sources");
    assert_eq!(steps[0]["best_effort"], false);
    assert_eq!(steps[1]["stage"], "clean");
    assert_eq!(steps[1]["best_effort"], true);

    let failed = steps
        .iter()
        .find(|s| s["outcome"]["status"] == "failed")
        .unwrap();
    assert_eq!(failed["stage"], "run-tests");
    assert!(failed["outcome"]["error"]
        .as_str()
        .unwrap()
        .contains("simulated failure"));
    assert_eq!(steps.last().unwrap()["outcome"]["status"], "skipped");

    // secrets never reach the report
    let text = value.to_string();
    assert!(!text.contains("pg-secret"));
    assert!(!text.contains("throwaway"));
}

async fn rotating_backend() -> String {
    let counter = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route(
        "/instance",
        get(move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Json(json!({ "instance": format!("replica-{}", n % 2) }))
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", address)
}

#[tokio::test]
async fn test_verify_stage_checks_rotation() {
    let repo = repo();
    let mut config = config(&repo);
    config.verify.enabled = true;
    config.verify.url = Some(rotating_backend().await);
    config.verify.attempts = 4;

    let report = plan(&config).run(&RecordingRunner::new()).await;
    assert!(report.succeeded(), "{:?}", report.failed_step());
    assert!(report.ran(Stage::Verify));

    // three replicas configured, only two answer
    let repo = self::repo();
    let mut config = config.with_repo_path(repo.path()).with_replicas(3);
    config.verify.attempts = 6;

    let report = plan(&config).run(&RecordingRunner::new()).await;
    let failed = report.failed_step().unwrap();
    assert_eq!(failed.stage, Stage::Verify);
}

#[tokio::test]
#[serial]
async fn test_load_overlays_environment() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("deploy.toml");
    std::fs::write(
        &path,
        r#"
        project = "social"

        [app]
        replicas = 3

        [verify]
        attempts = 9
        "#,
    )
    .unwrap();

    std::env::set_var("SECRET_KEY", "from-env");
    std::env::set_var("POSTGRES_PASSWORD", "pg-from-env");
    std::env::set_var("ACCESS_TOKEN_EXPIRE_MINUTES", "15");

    let config = DeployConfig::load(Some(&path));

    std::env::remove_var("SECRET_KEY");
    std::env::remove_var("POSTGRES_PASSWORD");
    std::env::remove_var("ACCESS_TOKEN_EXPIRE_MINUTES");

    let config = config.unwrap();
    assert_eq!(config.project, "social");
    assert_eq!(config.app.replicas, 3);
    assert_eq!(config.app.secret_key, "from-env");
    assert_eq!(config.database.password, "pg-from-env");
    assert_eq!(config.app.access_token_expire_minutes, 15);
    assert_eq!(config.test_password().len(), 24);
    assert_ne!(config.test_password(), "pg-from-env");
    assert!(config.validate().is_ok());
}

#[tokio::test]
#[serial]
async fn test_load_rejects_bad_environment() {
    std::env::set_var("ACCESS_TOKEN_EXPIRE_MINUTES", "soon");
    let result = DeployConfig::load(None);
    std::env::remove_var("ACCESS_TOKEN_EXPIRE_MINUTES");

    assert!(result.is_err());
}
