mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shipyard_api_client::{Client, EventListener};
use shipyard_content_hash::IgnoreRuleSet;
use shipyard_deploy::{DeployRequest, DeployStateTracker, Deployer, PipelineEvent};
use shipyard_protocol::DeployMetadata;
use shipyard_transfer::ArchiveReader;

use config::CliConfig;

#[derive(Debug, Parser)]
#[command(name = "shipyard", version, about = "Package and deploy source trees")]
struct Cli {
    /// Config file path.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Platform API base URL.
    #[arg(long, global = true, env = "SHIPYARD_SERVER")]
    server: Option<String>,

    /// API token.
    #[arg(long, global = true, env = "SHIPYARD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Source root. Repeat to overlay; later roots override earlier ones.
    #[arg(long = "root", global = true)]
    roots: Vec<PathBuf>,

    /// Ignore pattern. Repeatable.
    #[arg(long = "ignore", global = true)]
    ignore: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the content checksum of the source tree.
    Checksum,
    /// Write the source tree as a tar.gz archive.
    Package {
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Upload if needed, submit and wait for the deploy to finish.
    Deploy(DeployArgs),
    /// Show the state of a deploy task.
    Status { task_id: String },
}

#[derive(Debug, Args)]
struct DeployArgs {
    deployment_id: String,

    #[arg(long)]
    image: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Secret name to expose. Repeatable.
    #[arg(long = "secret")]
    secrets: Vec<String>,

    /// Seconds to wait for the deploy to settle.
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,shipyard=debug")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let cfg = CliConfig::load(cli.config.as_deref())?;

    let roots = if !cli.roots.is_empty() {
        cli.roots.clone()
    } else if !cfg.roots.is_empty() {
        cfg.roots.clone()
    } else {
        vec![PathBuf::from(".")]
    };
    let patterns = if cli.ignore.is_empty() {
        &cfg.ignore
    } else {
        &cli.ignore
    };
    let ignore = IgnoreRuleSet::new(patterns)?;

    match cli.command {
        Command::Checksum => {
            let checksum = Deployer::compute_checksum(&roots, &ignore).await?;
            println!("{checksum}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Package { output } => {
            let written = tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
                let mut reader = ArchiveReader::open(roots, ignore)?;
                let mut file = std::fs::File::create(&output)
                    .with_context(|| format!("creating {}", output.display()))?;
                Ok(std::io::copy(&mut reader, &mut file)?)
            })
            .await??;
            info!(bytes = written, "archive written");
            Ok(ExitCode::SUCCESS)
        }
        Command::Deploy(args) => {
            let client = connect(&cli.server, &cli.token, &cfg)?;
            deploy(client, &cfg, roots, ignore, args).await
        }
        Command::Status { task_id } => {
            let client = connect(&cli.server, &cli.token, &cfg)?;
            let event = client.get_task(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&event)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn connect(
    server: &Option<String>,
    token: &Option<String>,
    cfg: &CliConfig,
) -> anyhow::Result<Client> {
    let server = server
        .as_deref()
        .or(cfg.server_url.as_deref())
        .context("no server configured; pass --server or set server_url")?;
    let token = token.as_deref().or(cfg.token.as_deref());
    Ok(Client::new(server, token)?)
}

async fn deploy(
    client: Client,
    cfg: &CliConfig,
    roots: Vec<PathBuf>,
    ignore: IgnoreRuleSet,
    args: DeployArgs,
) -> anyhow::Result<ExitCode> {
    let tracker = DeployStateTracker::new();
    let client = Arc::new(client);
    let mut deployer = Deployer::new(
        client.clone(),
        client,
        tracker.clone(),
        cfg.deployer_config(),
    );
    let cancel = deployer.cancel_token();

    let listener = cfg.events_url.as_ref().map(|url| {
        EventListener::new(url.clone(), tracker)
            .with_token(cfg.token.clone())
            .spawn(cancel.child_token())
    });

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling deploy");
            ctrl_c.cancel();
        }
    });

    let printer = deployer.take_events().map(|mut events| {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                print_event(&event);
            }
        })
    });

    let request = DeployRequest {
        deployment_id: args.deployment_id,
        roots,
        ignore,
        metadata: DeployMetadata {
            image: args.image,
            port: args.port,
            secrets: (!args.secrets.is_empty()).then_some(args.secrets),
            env: None,
        },
        timeout: args.timeout.map(Duration::from_secs),
    };
    let result = deployer.deploy(request).await;

    if let Some(listener) = listener {
        listener.abort();
        let _ = listener.await;
    }
    drop(deployer);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let report = result?;
    if report.outcome.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::Hashing { deployment_id } => println!("[{deployment_id}] hashing"),
        PipelineEvent::Hashed { checksum, .. } => println!("  checksum {checksum}"),
        PipelineEvent::UploadSkipped { .. } => println!("  asset already uploaded"),
        PipelineEvent::Uploading { .. } => println!("  uploading asset"),
        PipelineEvent::Uploaded { .. } => println!("  asset uploaded"),
        PipelineEvent::Submitted { task_id, .. } => println!("  submitted task {task_id}"),
        PipelineEvent::Deploy(ev) => {
            let detail = ev
                .message
                .as_deref()
                .or(ev.step.as_deref())
                .unwrap_or_default();
            println!("  {:?} {detail}", ev.status);
        }
        PipelineEvent::Finished {
            success: true,
            deployment_id,
            ..
        } => println!("[{deployment_id}] deployed"),
        PipelineEvent::Finished {
            deployment_id,
            error,
            ..
        } => println!(
            "[{deployment_id}] failed: {}",
            error.as_deref().unwrap_or("unknown error")
        ),
    }
}
