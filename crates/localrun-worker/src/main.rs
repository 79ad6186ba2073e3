// Entry point for `localrun`: run one workflow job locally, in a container or
// on the host.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use localrun_common::{init_subscriber, Config, LogFormat};
use localrun_sdk::ExecContext;
use tokio_util::sync::CancellationToken;

use localrun_worker::container::DockerDriver;
use localrun_worker::model::{Run, Workflow};
use localrun_worker::run_context::{JobScope, RunContext};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "localrun", about = "Run a workflow job locally")]
struct Args {
    /// Workflow file to load.
    #[arg(long, short = 'W')]
    workflow: PathBuf,

    /// Job id within the workflow.
    #[arg(long, short = 'j')]
    job: String,

    /// JSON or YAML configuration file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Platform mapping `label=image`. May be repeated.
    #[arg(short = 'P', value_name = "LABEL=IMAGE")]
    platforms: Vec<String>,

    /// JSON file with the triggering event payload.
    #[arg(long, short = 'e')]
    event: Option<PathBuf>,

    /// Repository directory. Defaults to the current directory.
    #[arg(long, short = 'C')]
    workdir: Option<PathBuf>,

    /// Bind-mount the working directory instead of copying it.
    #[arg(long)]
    bind: bool,

    /// Keep containers between runs.
    #[arg(long, short = 'r')]
    reuse: bool,

    /// Remove the job container when the job finishes.
    #[arg(long)]
    rm: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,

    /// Enable debug logging.
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    init_subscriber(
        if args.json { LogFormat::Json } else { LogFormat::Text },
        args.verbose,
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = match runtime.block_on(run(args)) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{:#}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match args.config {
        Some(ref path) => Config::load(path)?,
        None => Config::default(),
    };

    let workdir = match args.workdir {
        Some(ref dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to resolve the current directory")?,
    };
    config.workdir = workdir
        .canonicalize()
        .with_context(|| format!("Invalid workdir '{}'", workdir.display()))?;

    for mapping in &args.platforms {
        let Some((label, image)) = mapping.split_once('=') else {
            bail!("invalid platform '{}': expected LABEL=IMAGE", mapping);
        };
        config.add_platform(label.trim(), image.trim());
    }
    if let Some(ref event) = args.event {
        config.event_path = Some(event.clone());
    }

    config.bind_workdir |= args.bind;
    config.reuse_containers |= args.reuse;
    config.auto_remove |= args.rm;
    config.allocate_terminal = std::io::stdout().is_terminal();
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let event_json = match config.event_path {
        Some(ref path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event '{}'", path.display()))?,
        None => "{}".to_string(),
    };

    let workflow = Workflow::load(&args.workflow)?;
    let run = Run::new(workflow, &args.job)?;

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("Received interrupt, cancelling job");
        handler_token.cancel();
    })
    .context("Failed to install the interrupt handler")?;

    let scope = JobScope::new(Arc::new(config), Arc::new(run), Arc::new(DockerDriver::new()))
        .with_event_json(event_json)
        .with_cancel_token(cancel.clone());
    let mut rc = RunContext::new(Arc::new(scope));
    tracing::info!("Running job {}", rc);

    let executor = rc.executor();
    let result = executor.run(&mut rc, &ExecContext::new(cancel)).await;

    let mut outputs: Vec<_> = rc.job_outputs().iter().collect();
    outputs.sort();
    for (name, value) in outputs {
        tracing::info!("Job output {}={}", name, value);
    }

    match result {
        Ok(()) => {
            tracing::info!("Job succeeded");
            Ok(())
        }
        Err(e) => Err(e.context(format!("Job {} failed", rc))),
    }
}
