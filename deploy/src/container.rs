use async_trait::async_trait;
use image_builder::ImageSpec;
use regex::Regex;
use std::process::{Command, Stdio};
use std::sync::{Mutex, OnceLock};
use thiserror::Error;
use tracing::{debug, info};

/// Container runtime types supported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    /// Podman container runtime
    Podman,
    /// Docker container runtime
    Docker,
    /// No container runtime available
    None,
}

impl ContainerRuntime {
    /// Get the command name for this runtime
    pub fn command(&self) -> &'static str {
        match self {
            ContainerRuntime::Podman => "podman",
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::None => "",
        }
    }

    fn invocation<I, S>(&self, args: I) -> CommandLine
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandLine::new(self.command(), args)
    }

    /// `run` for a container spec
    pub fn run_container(&self, spec: &ContainerSpec) -> CommandLine {
        self.invocation(spec.run_args())
    }

    /// `rm -f`; succeeds for running containers too
    pub fn remove_container(&self, name: &str) -> CommandLine {
        self.invocation(["rm", "-f", name])
    }

    pub fn create_network(&self, name: &str) -> CommandLine {
        self.invocation(["network", "create", name])
    }

    pub fn remove_network(&self, name: &str) -> CommandLine {
        self.invocation(["network", "rm", name])
    }

    pub fn build_image(&self, spec: &ImageSpec) -> CommandLine {
        self.invocation(spec.build_args())
    }
}

impl std::str::FromStr for ContainerRuntime {
    type Err = ContainerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "docker" => Ok(ContainerRuntime::Docker),
            "podman" => Ok(ContainerRuntime::Podman),
            _ => Err(ContainerError::UnknownRuntime(value.to_string())),
        }
    }
}

/// Container operation errors
#[derive(Error, Debug)]
pub enum ContainerError {
    /// No container runtime is available
    #[error("No container runtime available. Please install Docker or Podman.")]
    NoRuntimeAvailable,

    #[error("Unknown container runtime '{0}'")]
    UnknownRuntime(String),

    /// Command exited unsuccessfully; `stdout` keeps only the last lines
    #[error("Command failed ({status}): {command}: {stderr}\n{stdout}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
        stdout: String,
    },

    #[error("Invalid container, network or volume name '{0}'")]
    InvalidName(String),

    #[error("Duplicate name '{0}' in topology")]
    DuplicateName(String),

    #[error("Cannot build database URL: {0}")]
    DatabaseUrl(#[from] url::ParseError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ContainerResult<T> = Result<T, ContainerError>;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("name pattern is valid")
    })
}

/// Container, network and volume names share the runtime's naming rule
pub fn is_valid_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

/// Detect available container runtime in order of preference
pub fn detect_runtime() -> ContainerRuntime {
    for runtime in [ContainerRuntime::Docker, ContainerRuntime::Podman] {
        if Command::new(runtime.command())
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
        {
            return runtime;
        }
    }

    ContainerRuntime::None
}

/// The configured runtime, or the detected one. A dry run never needs a
/// working runtime and falls back to Docker.
pub fn resolve_runtime(configured: Option<&str>, dry_run: bool) -> ContainerResult<ContainerRuntime> {
    if let Some(name) = configured {
        return name.parse();
    }

    match detect_runtime() {
        ContainerRuntime::None if dry_run => Ok(ContainerRuntime::Docker),
        ContainerRuntime::None => Err(ContainerError::NoRuntimeAvailable),
        runtime => Ok(runtime),
    }
}

/// Environment keys whose values never appear in logs
fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_uppercase();
    ["PASSWORD", "SECRET", "TOKEN", "DATABASE_URL"]
        .iter()
        .any(|marker| key.contains(marker))
}

/// A program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Display form with secret `-e KEY=VALUE` values masked
    pub fn redacted(&self) -> String {
        let mut parts = vec![self.program.clone()];
        let mut after_env_flag = false;

        for arg in &self.args {
            let shown = match arg.split_once('=') {
                Some((key, _)) if after_env_flag && is_sensitive_key(key) => {
                    format!("{}=***", key)
                }
                _ => arg.clone(),
            };
            after_env_flag = arg == "-e" || arg == "--env";
            parts.push(quote(&shown));
        }

        parts.join(" ")
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.redacted())
    }
}

fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@*%+,".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes runtime commands. Implementations decide whether anything
/// actually runs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandLine) -> ContainerResult<CommandOutput>;

    /// True when commands are only recorded; other side effects should be skipped too
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Lines of stdout kept when a command fails; test runners report there
const FAILURE_STDOUT_LINES: usize = 40;

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Runs commands as child processes
#[derive(Debug, Default)]
pub struct CliRunner;

impl CliRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for CliRunner {
    async fn run(&self, command: &CommandLine) -> ContainerResult<CommandOutput> {
        debug!("Running: {}", command);

        let output = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: command.redacted(),
                status: output.status.to_string(),
                stderr,
                stdout: tail(&stdout, FAILURE_STDOUT_LINES),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

/// Records commands instead of running them
#[derive(Debug, Default)]
pub struct DryRunRunner {
    recorded: Mutex<Vec<CommandLine>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<CommandLine> {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, command: &CommandLine) -> ContainerResult<CommandOutput> {
        info!("[dry-run] {}", command);
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.clone());
        Ok(CommandOutput::default())
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

/// Published port, `host:container`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// Named volume mounted into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume: String,
    pub target: String,
}

/// Configuration for one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: Option<String>,
    pub ports: Vec<PortMapping>,
    /// Environment variables, in the order they are passed
    pub env: Vec<(String, String)>,
    pub volumes: Vec<VolumeMount>,
    /// Run in the background (`-d`); otherwise the command waits for exit
    pub detach: bool,
    /// Remove the container when it exits (`--rm`)
    pub remove_on_exit: bool,
    pub restart: Option<String>,
    /// Overrides the image's default command
    pub command: Vec<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            network: None,
            ports: Vec::new(),
            env: Vec::new(),
            volumes: Vec::new(),
            detach: true,
            remove_on_exit: false,
            restart: None,
            command: Vec::new(),
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_port(mut self, host: u16, container: u16) -> Self {
        self.ports.push(PortMapping { host, container });
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_volume(mut self, volume: impl Into<String>, target: impl Into<String>) -> Self {
        self.volumes.push(VolumeMount {
            volume: volume.into(),
            target: target.into(),
        });
        self
    }

    pub fn with_restart(mut self, policy: impl Into<String>) -> Self {
        self.restart = Some(policy.into());
        self
    }

    /// Run in the foreground and remove on exit; the exit code becomes the result
    pub fn foreground(mut self) -> Self {
        self.detach = false;
        self.remove_on_exit = true;
        self
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Arguments for `<runtime> run ...`
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string()];

        if self.detach {
            args.push("-d".to_string());
        }
        if self.remove_on_exit {
            args.push("--rm".to_string());
        }

        args.push("--name".to_string());
        args.push(self.name.clone());

        if let Some(network) = &self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        if let Some(restart) = &self.restart {
            args.push("--restart".to_string());
            args.push(restart.clone());
        }

        for port in &self.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", port.host, port.container));
        }

        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for volume in &self.volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", volume.volume, volume.target));
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_runtime_command() {
        assert_eq!(ContainerRuntime::Podman.command(), "podman");
        assert_eq!(ContainerRuntime::Docker.command(), "docker");
        assert_eq!(ContainerRuntime::None.command(), "");
    }

    #[test]
    fn test_runtime_from_str() {
        assert_eq!("docker".parse::<ContainerRuntime>().unwrap(), ContainerRuntime::Docker);
        assert_eq!("podman".parse::<ContainerRuntime>().unwrap(), ContainerRuntime::Podman);
        assert!(matches!(
            "lxc".parse::<ContainerRuntime>(),
            Err(ContainerError::UnknownRuntime(_))
        ));
    }

    #[test]
    fn test_resolve_configured_runtime() {
        assert_eq!(
            resolve_runtime(Some("podman"), false).unwrap(),
            ContainerRuntime::Podman
        );
    }

    #[test]
    fn test_resolve_runtime_dry_run_never_fails() {
        let runtime = resolve_runtime(None, true).unwrap();
        assert_ne!(runtime, ContainerRuntime::None);
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("socialmedia-app-1"));
        assert!(is_valid_name("pg_prod_data"));
        assert!(!is_valid_name("-app"));
        assert!(!is_valid_name("app 1"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn test_run_args() {
        let spec = ContainerSpec::new("socialmedia-db", "postgres:16")
            .with_network("socialmedia-net")
            .with_restart("unless-stopped")
            .with_port(5432, 5432)
            .with_env("POSTGRES_USER", "postgres")
            .with_volume("pg_prod_data", "/var/lib/postgresql/data");

        assert_eq!(
            spec.run_args(),
            vec![
                "run",
                "-d",
                "--name",
                "socialmedia-db",
                "--network",
                "socialmedia-net",
                "--restart",
                "unless-stopped",
                "-p",
                "5432:5432",
                "-e",
                "POSTGRES_USER=postgres",
                "-v",
                "pg_prod_data:/var/lib/postgresql/data",
                "postgres:16",
            ]
        );
    }

    #[test]
    fn test_foreground_run_args() {
        let spec = ContainerSpec::new("socialmedia-tests", "socialmedia-test:latest").foreground();
        let args = spec.run_args();
        assert_eq!(&args[..4], &["run", "--rm", "--name", "socialmedia-tests"]);
        assert!(!args.contains(&"-d".to_string()));
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let command = ContainerRuntime::Docker.run_container(
            &ContainerSpec::new("app", "app:latest")
                .with_env("SECRET_KEY", "hunter2")
                .with_env("SQLALCHEMY_DATABASE_URL", "postgresql://u:pw@db:5432/x")
                .with_env("ALGORITHM", "HS256"),
        );

        let shown = command.redacted();
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("u:pw"));
        assert!(shown.contains("SECRET_KEY=***"));
        assert!(shown.contains("ALGORITHM=HS256"));
        assert!(shown.starts_with("docker run -d --name app"));
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain-arg"), "plain-arg");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_container_error_display() {
        let error = ContainerError::NoRuntimeAvailable;
        assert!(error.to_string().contains("No container runtime available"));

        let error = ContainerError::CommandFailed {
            command: "docker network create net".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "network with name net already exists".to_string(),
            stdout: String::new(),
        };
        assert!(error.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_dry_run_records() {
        let runner = DryRunRunner::new();
        let command = ContainerRuntime::Docker.remove_container("socialmedia-app-1");
        runner.run(&command).await.unwrap();

        assert!(runner.is_dry_run());
        assert_eq!(runner.recorded(), vec![command]);
    }

    #[tokio::test]
    async fn test_cli_runner_reports_failure() {
        let runner = CliRunner::new();
        let result = runner
            .run(&CommandLine::new("sh", ["-c", "echo boom >&2; exit 3"]))
            .await;

        match result {
            Err(ContainerError::CommandFailed { stderr, .. }) => assert_eq!(stderr, "boom"),
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cli_runner_captures_stdout() {
        let runner = CliRunner::new();
        let output = runner
            .run(&CommandLine::new("sh", ["-c", "echo ready"]))
            .await
            .unwrap();
        assert_eq!(output.stdout, "ready");
    }

    #[tokio::test]
    async fn test_failure_keeps_test_output() {
        // pytest reports failing tests on stdout and exits non-zero
        let runner = CliRunner::new();
        let result = runner
            .run(&CommandLine::new(
                "sh",
                ["-c", "x=test_; echo collected 3 items; echo FAILED ${x}login; exit 1"],
            ))
            .await;

        let error = result.unwrap_err();
        assert!(error.to_string().contains("FAILED test_login"));
        match error {
            ContainerError::CommandFailed { stdout, stderr, .. } => {
                assert!(stderr.is_empty());
                assert!(stdout.ends_with("FAILED test_login"));
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let text: Vec<String> = (1..=50).map(|n| format!("line {}", n)).collect();
        let kept = tail(&text.join("\n"), FAILURE_STDOUT_LINES);
        assert!(kept.starts_with("line 11\n"));
        assert!(kept.ends_with("line 50"));
        assert_eq!(tail("", 5), "");
    }
}
