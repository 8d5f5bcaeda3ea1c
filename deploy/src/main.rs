use balancer::{render_nginx_conf, ProxyConfig};
use clap::{Parser, Subcommand};
use deploy::{
    preflight, resolve_runtime, verify_rotation, CliRunner, CommandRunner, DeployConfig,
    DryRunRunner, Pipeline, PipelineReport, Stage, StepOutcome, Topology,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "deployctl")]
#[command(about = "Test and deploy the replicated application behind its proxy")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full CI pipeline: checkout, test, deploy
    Pipeline {
        /// Print the commands instead of running them
        #[arg(long)]
        dry_run: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        /// Build from the working copy as it is
        #[arg(long)]
        skip_checkout: bool,
    },
    /// Build and replace production without running the tests
    Deploy {
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove every container and network (volumes are kept)
    Teardown {
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the built-in round-robin proxy
    Proxy {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<SocketAddr>,
        /// Upstream replica (`host:port`), repeatable
        #[arg(short, long = "upstream")]
        upstreams: Vec<String>,
    },
    /// Print the nginx configuration for the production proxy
    NginxConf,
    /// Check that requests rotate across the replicas
    Verify {
        /// Base URL of the proxy
        #[arg(short, long)]
        url: Option<String>,
        /// Number of requests
        #[arg(short, long)]
        attempts: Option<usize>,
    },
    /// Print the pipeline's steps without running them
    Plan,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries reports and rendered files only
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = DeployConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Pipeline {
            dry_run,
            json,
            skip_checkout,
        } => {
            let runtime = resolve_runtime(config.runtime.as_deref(), dry_run)?;
            let mut pipeline = Pipeline::plan(&config, runtime)?;
            if skip_checkout {
                pipeline = pipeline.without_stage(Stage::Checkout);
            }
            run_pipeline(&config, &pipeline, dry_run, json).await?;
        }
        Commands::Deploy { dry_run } => {
            let runtime = resolve_runtime(config.runtime.as_deref(), dry_run)?;
            let pipeline = Pipeline::deploy(&config, runtime)?;
            run_pipeline(&config, &pipeline, dry_run, false).await?;
        }
        Commands::Teardown { dry_run } => {
            let runtime = resolve_runtime(config.runtime.as_deref(), dry_run)?;
            let pipeline = Pipeline::teardown(&config, runtime)?;
            let report = execute(&pipeline, dry_run).await;
            print_report(&report);
        }
        Commands::Proxy { listen, upstreams } => {
            run_proxy(&config, listen, upstreams).await?;
        }
        Commands::NginxConf => {
            let topology = Topology::production(&config)?;
            print!("{}", render_nginx_conf(&topology.proxy_config(&config)));
        }
        Commands::Verify { url, attempts } => {
            let url = url.unwrap_or_else(|| config.verify_url());
            let attempts = attempts.unwrap_or(config.verify.attempts);
            let report = verify_rotation(&url, attempts, config.verify_timeout()).await?;

            for (i, instance) in report.responses.iter().enumerate() {
                println!("  {:>3}  {}", i + 1, instance);
            }
            println!("{} distinct instance(s)", report.instances.len());
            report.require(config.min_distinct())?;
        }
        Commands::Plan => {
            let runtime = resolve_runtime(config.runtime.as_deref(), true)?;
            let pipeline = Pipeline::plan(&config, runtime)?;
            for (i, step) in pipeline.steps().iter().enumerate() {
                let marker = if step.best_effort { " (best effort)" } else { "" };
                println!("{:>3}. [{}] {}{}", i + 1, step.stage, step.description, marker);
                println!("       {}", step.action.describe());
            }
        }
    }

    Ok(())
}

async fn execute(pipeline: &Pipeline, dry_run: bool) -> PipelineReport {
    let runner: Box<dyn CommandRunner> = if dry_run {
        Box::new(DryRunRunner::new())
    } else {
        Box::new(CliRunner::new())
    };
    pipeline.run(runner.as_ref()).await
}

async fn run_pipeline(
    config: &DeployConfig,
    pipeline: &Pipeline,
    dry_run: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    match preflight(config) {
        Ok(()) => {}
        Err(e) if dry_run => warn!("Configuration would be rejected: {}", e),
        Err(e) => return Err(e.into()),
    }

    let report = execute(pipeline, dry_run).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    report.into_result()?;
    Ok(())
}

fn print_report(report: &PipelineReport) {
    println!("Run {}", report.run_id);
    for step in &report.steps {
        let status = match &step.outcome {
            StepOutcome::Succeeded => "ok".to_string(),
            StepOutcome::Tolerated { error } => format!("ignored: {}", error),
            StepOutcome::Failed { error } => format!("FAILED: {}", error),
            StepOutcome::Skipped => "skipped".to_string(),
        };
        println!("  [{}] {}: {}", step.stage, step.description, status);
    }

    let elapsed = report.finished_at - report.started_at;
    if report.succeeded() {
        println!("Succeeded in {}s", elapsed.num_seconds());
    } else {
        println!("Failed after {}s", elapsed.num_seconds());
    }
}

async fn run_proxy(
    config: &DeployConfig,
    listen: Option<SocketAddr>,
    upstreams: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut proxy = if upstreams.is_empty() {
        Topology::production(config)?.proxy_config(config)
    } else {
        ProxyConfig::default().with_upstreams(upstreams)
    };
    if let Some(listen) = listen {
        proxy = proxy.with_listen(listen);
    }
    proxy.validate()?;

    info!(
        "Proxying {} to {}",
        proxy.listen,
        proxy.upstreams.join(", ")
    );
    balancer::serve(proxy).await?;
    Ok(())
}
