mod config;
mod fixture;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use weft_core::{ChatModel, ErrorKind, Tool, WeftError};
use weft_graph::{Checkpointer, GraphEngine, MessageState};
use weft_models::{ReplayChatModel, RetryChatModel, RetryPolicy};
use weft_sqlite::SqliteCheckpointer;
use weft_tools::ToolRegistry;

use crate::config::CliConfig;
use crate::fixture::FixtureTool;

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "weft - run and inspect agent threads", long_about = None)]
struct Cli {
    /// Config file [default: ./weft.toml when present]
    #[arg(long, global = true, env = "WEFT_CONFIG")]
    config: Option<PathBuf>,

    /// Checkpoint database, overriding `[checkpoint] path`
    #[arg(long, global = true, env = "WEFT_DB")]
    db: Option<PathBuf>,

    /// Model script (JSON array of assistant messages), overriding `script`
    #[arg(long, global = true)]
    script: Option<PathBuf>,

    /// Log at debug level regardless of RUST_LOG
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new turn on a thread and print the reply
    Run {
        #[arg(long)]
        thread: String,
        message: String,
    },
    /// Continue an interrupted thread from its last checkpoint
    Resume {
        #[arg(long)]
        thread: String,
    },
    /// Print a thread's transcript as JSON lines
    History {
        #[arg(long)]
        thread: String,
    },
    /// Print the graph topology
    Graph {
        /// ASCII instead of Mermaid
        #[arg(long)]
        ascii: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<WeftError>().map(WeftError::kind) {
        Some(ErrorKind::ModelInvocation) => 2,
        Some(ErrorKind::ToolInvocation) => 3,
        Some(ErrorKind::StepBudgetExceeded) => 4,
        Some(ErrorKind::Storage) => 5,
        Some(ErrorKind::Cancelled) => 6,
        Some(ErrorKind::Internal) | None => 1,
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let Cli {
        config,
        db,
        script,
        command,
        ..
    } = cli;
    let open = || -> Result<GraphEngine> {
        let mut config = CliConfig::load(config.as_deref())?;
        if let Some(ref db) = db {
            config.checkpoint.path = db.clone();
        }
        if let Some(ref script) = script {
            config.script = Some(script.clone());
        }
        build_engine(&config)
    };

    match command {
        Commands::Run { thread, message } => {
            let cancel = cancel_on_ctrl_c();
            let state = open()?
                .run_with_cancel(&thread, message, &cancel)
                .await?;
            print_reply(&state);
        }
        Commands::Resume { thread } => {
            let cancel = cancel_on_ctrl_c();
            let state = open()?.resume_with_cancel(&thread, &cancel).await?;
            print_reply(&state);
        }
        Commands::History { thread } => {
            let state = open()?
                .get_state(&thread)
                .await?
                .ok_or_else(|| WeftError::Graph(format!("no checkpoint for thread '{thread}'")))?;
            for message in &state.messages {
                println!("{}", serde_json::to_string(message)?);
            }
        }
        Commands::Graph { ascii } => {
            let drawing = if ascii {
                weft_graph::draw_ascii()
            } else {
                weft_graph::draw_mermaid()
            };
            println!("{drawing}");
        }
    }
    Ok(())
}

fn print_reply(state: &MessageState) {
    if let Some(reply) = state.last_message() {
        println!("{}", reply.content());
    }
}

fn build_engine(config: &CliConfig) -> Result<GraphEngine> {
    let checkpointer = SqliteCheckpointer::new(&config.checkpoint.path).with_context(|| {
        format!(
            "failed to open checkpoint database at {}",
            config.checkpoint.path.display()
        )
    })?;
    assemble(config, Arc::new(checkpointer))
}

fn assemble(config: &CliConfig, checkpointer: Arc<dyn Checkpointer>) -> Result<GraphEngine> {
    // Positional replay: a resumed thread continues the script where it stopped.
    let script = match config.script {
        Some(ref path) => ReplayChatModel::from_json_file(path)?,
        None => ReplayChatModel::new(vec![]),
    };
    let model: Arc<dyn ChatModel> = match config.retry {
        Some(ref retry) => Arc::new(RetryChatModel::new(
            Arc::new(script),
            RetryPolicy::from(retry),
        )),
        None => Arc::new(script),
    };

    let tools = config
        .tools
        .iter()
        .cloned()
        .map(|def| Arc::new(FixtureTool::new(def)) as Arc<dyn Tool>);
    let registry = ToolRegistry::new(tools)?;

    tracing::debug!(
        tools = registry.len(),
        db = %config.checkpoint.path.display(),
        retry = config.retry.is_some(),
        "engine configured"
    );

    Ok(GraphEngine::builder()
        .model(model)
        .tools(registry)
        .checkpointer(checkpointer)
        .config(config.engine.clone())
        .build()?)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling run");
            trigger.cancel();
        }
    });
    token
}
