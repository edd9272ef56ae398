//! Transform engine binary
//!
//! Run with: cargo run --bin transform-engine -- run --tool base64-encode --input hello
//!
//! The hidden `worker` subcommand serves one isolated job over stdin/stdout.

use std::io::{self, BufReader};
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

use transform_engine::config::WORKER_SUBCOMMAND;
use transform_engine::{
    CATALOG, Dispatcher, EngineConfig, ExecutionResult, InputPayload, OptionValue, Options,
    RoutingPolicy, ToolId, TransformRequest, WorkerConfig, serve_worker, validation,
};

#[derive(Debug, Parser)]
#[command(name = "transform-engine", version, about = "Run developer transforms in a sandbox")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a catalog tool or a script against an input
    Run(RunArgs),
    /// Smoke-test a script against a sample input
    Test(TestArgs),
    /// List catalog tools
    Tools,
    /// Serve one isolated job over stdin/stdout
    #[command(name = WORKER_SUBCOMMAND, hide = true)]
    Worker(WorkerArgs),
}

#[derive(Debug, Args)]
struct WorkerArgs {
    /// Tag shown in process listings; not interpreted
    #[arg(long)]
    label: Option<String>,
}

#[derive(Debug, Args)]
struct ScriptSource {
    /// Script body
    #[arg(long, conflicts_with = "code_file")]
    code: Option<String>,
    /// File holding the script body
    #[arg(long)]
    code_file: Option<PathBuf>,
}

impl ScriptSource {
    fn load(&self) -> anyhow::Result<Option<String>> {
        match (&self.code, &self.code_file) {
            (Some(code), _) => Ok(Some(code.clone())),
            (None, Some(path)) => std::fs::read_to_string(path)
                .map(Some)
                .with_context(|| format!("failed to read {}", path.display())),
            (None, None) => Ok(None),
        }
    }
}

#[derive(Debug, Args)]
struct InputArgs {
    /// Input text (left side when --right is given)
    #[arg(long)]
    input: Option<String>,
    /// Right side of a two-text input
    #[arg(long, requires = "input")]
    right: Option<String>,
    /// Option as name=value; repeatable
    #[arg(long = "option", value_name = "NAME=VALUE")]
    options: Vec<String>,
}

impl InputArgs {
    fn payload(&self) -> InputPayload {
        match (&self.input, &self.right) {
            (Some(left), Some(right)) => InputPayload::DualText {
                left: left.clone(),
                right: right.clone(),
            },
            (Some(text), None) => InputPayload::Text(text.clone()),
            _ => InputPayload::Empty,
        }
    }

    fn options(&self) -> anyhow::Result<Options> {
        self.options
            .iter()
            .map(|pair| {
                let (name, value) = pair
                    .split_once('=')
                    .with_context(|| format!("option '{}' is not NAME=VALUE", pair))?;
                Ok((name.to_string(), OptionValue::parse_loose(value)))
            })
            .collect()
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Catalog tool slug
    #[arg(long, conflicts_with_all = ["code", "code_file"])]
    tool: Option<String>,
    #[command(flatten)]
    script: ScriptSource,
    #[command(flatten)]
    input: InputArgs,
    /// Deadline in milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,
    /// Run everything in this process instead of a worker
    #[arg(long)]
    in_process: bool,
}

#[derive(Debug, Args)]
struct TestArgs {
    #[command(flatten)]
    script: ScriptSource,
    #[command(flatten)]
    input: InputArgs,
}

fn init_logging() {
    // Logs go to stderr; a worker's stdout carries only the protocol
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Worker(args) => {
            debug!(label = ?args.label, "worker started");
            let stdin = io::stdin();
            serve_worker(BufReader::new(stdin.lock()), io::stdout().lock())
                .context("worker failed")?;
            Ok(())
        }
        Command::Tools => {
            for entry in CATALOG.iter() {
                let mode = if entry.runs_isolated() { "isolated" } else { "in-process" };
                println!("{:<16} {:<10} {}", entry.slug, mode, entry.description);
            }
            Ok(())
        }
        Command::Run(args) => runtime()?.block_on(run(args)),
        Command::Test(args) => runtime()?.block_on(test(args)),
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env()?;
    if args.in_process {
        config = config.with_policy(RoutingPolicy::InProcess);
    }
    if config.worker.program.is_none() {
        let exe = std::env::current_exe().context("cannot locate worker executable")?;
        config = config.with_worker(WorkerConfig::program(exe));
    }

    let mut request = match (&args.tool, args.script.load()?) {
        (Some(slug), _) => TransformRequest::tool(slug.parse::<ToolId>()?),
        (None, Some(code)) => TransformRequest::code(code),
        (None, None) => bail!("one of --tool, --code or --code-file is required"),
    };
    request.input = args.input.payload();
    request.options = args.input.options()?;
    request.deadline_ms = args.deadline_ms;

    let dispatcher = Dispatcher::new(config);
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let outcome = dispatcher.execute(request, Some(&cancel)).await;
    ctrl_c.abort();

    match outcome {
        Ok(result) => print_result(&result),
        Err(_) => {
            info!("cancelled");
            Ok(())
        }
    }
}

async fn test(args: TestArgs) -> anyhow::Result<()> {
    let Some(code) = args.script.load()? else {
        bail!("one of --code or --code-file is required");
    };
    let outcome = validation::test(&code, &args.input.payload(), &args.input.options()?).await;
    debug!(elapsed_ms = outcome.elapsed_ms, success = outcome.success, "validation finished");
    println!("{}", serde_json::to_string_pretty(&outcome.summary())?);
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_result(result: &ExecutionResult) -> anyhow::Result<()> {
    match result {
        ExecutionResult::Text(text) => println!("{}", text),
        ExecutionResult::Structured(_) => {
            println!("{}", serde_json::to_string_pretty(&result.to_raw())?)
        }
        ExecutionResult::Failure(failure) => {
            eprintln!("{}: {}", failure.kind, failure.user_message());
            std::process::exit(1);
        }
    }
    Ok(())
}
