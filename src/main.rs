//! `agentloom` — a minimal CLI harness around the agent-society runtime.
//!
//! Grounded on the teacher's `sa_gateway` binary: a clap-derived `Cli`,
//! an `init_tracing()` that respects `RUST_LOG`, and config
//! load-then-validate-then-bail-on-error before anything starts. There is
//! no HTTP server here — spec.md §1 puts the HTTP/UI layer out of scope,
//! so this binary exercises the core directly instead of through axum
//! (see DESIGN.md).

mod config;
mod demo;
mod runtime;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use demo::{EchoTools, ScriptedLlm};
use runtime::Runtime;

#[derive(Debug, Parser)]
#[command(name = "agentloom", version, about = "Cooperative runtime for a society of LLM-driven agents")]
struct Cli {
    /// Path to a TOML config file (missing/unparseable falls back to defaults).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler against the scripted demo backend and submit one
    /// requirement to `root`, printing every reply the `user` endpoint
    /// receives until the agent falls idle (spec §8 seed scenarios).
    Demo {
        /// Text handed to root as a fresh task.
        #[arg(default_value = "remember that the launch date is Friday")]
        message: String,
        /// How long to let the scheduler run before shutting down.
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Interactive REPL: each line becomes a fresh requirement to root,
    /// replies addressed to `user` are printed as they arrive.
    Chat,
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Parse the config file (or defaults) and report any issues.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,agentloom=debug")),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);

    match cli.command.unwrap_or(Command::Demo {
        message: "remember that the launch date is Friday".into(),
        timeout_ms: 2000,
    }) {
        Command::Version => {
            println!("agentloom {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Config(ConfigCommand::Validate) => {
            let cfg = config::load_or_default(&config_path);
            if config::log_and_check(&cfg) {
                println!("config OK");
                Ok(())
            } else {
                anyhow::bail!("config validation failed")
            }
        }
        Command::Config(ConfigCommand::Show) => {
            let cfg = config::load_or_default(&config_path);
            println!("{}", toml::to_string_pretty(&cfg)?);
            Ok(())
        }
        Command::Demo { message, timeout_ms } => run_demo(&config_path, &message, timeout_ms).await,
        Command::Chat => run_chat(&config_path).await,
    }
}

/// Interactive REPL against the scripted demo backend. Grounded on the
/// teacher's `chat` command: a `rustyline` editor with persistent
/// history under the user's home directory, one requirement submitted
/// per line, replies drained from the `user` endpoint after each line.
async fn run_chat(config_path: &PathBuf) -> anyhow::Result<()> {
    let cfg = config::load_or_default(config_path);
    if !config::log_and_check(&cfg) {
        anyhow::bail!("config validation failed, refusing to start");
    }

    let llm: Arc<dyn loom_scheduler::LlmDispatcher> = Arc::new(ScriptedLlm::new());
    let tools: Arc<dyn loom_scheduler::ToolExecutor> = Arc::new(EchoTools::new());
    let rt = Runtime::build(cfg, llm, tools);

    let scheduler = rt.scheduler.clone();
    let run_handle = tokio::spawn(scheduler.clone().run());

    let history_path = dirs::home_dir()
        .unwrap_or_default()
        .join(".agentloom")
        .join("chat_history.txt");
    if let Some(parent) = history_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let mut rl = rustyline::DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    eprintln!("agentloom interactive chat — type a message, Ctrl+D to exit");

    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                rl.add_history_entry(&line).ok();
                let task_id = rt.submit_requirement(trimmed);
                tracing::debug!(%task_id, "submitted chat line");

                tokio::time::sleep(Duration::from_millis(300)).await;
                while let Some(msg) = rt.receive_for_user() {
                    println!("{}: {}", msg.from, msg.payload);
                }
            }
            Err(rustyline::error::ReadlineError::Eof) | Err(rustyline::error::ReadlineError::Interrupted) => break,
            Err(e) => {
                tracing::error!(error = %e, "readline error");
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    scheduler.request_shutdown();
    let _ = run_handle.await;
    Ok(())
}

/// Wires a full `Runtime` around the scripted demo backend, submits one
/// requirement to `root`, runs the scheduler for `timeout_ms`, then
/// prints whatever the `user` endpoint received.
async fn run_demo(config_path: &PathBuf, message: &str, timeout_ms: u64) -> anyhow::Result<()> {
    let cfg = config::load_or_default(config_path);
    if !config::log_and_check(&cfg) {
        anyhow::bail!("config validation failed, refusing to start");
    }

    let llm: Arc<dyn loom_scheduler::LlmDispatcher> = Arc::new(ScriptedLlm::new());
    let tools: Arc<dyn loom_scheduler::ToolExecutor> = Arc::new(EchoTools::new());
    let rt = Runtime::build(cfg, llm, tools);

    // Spawn a role and an agent under root purely as scenery, so `list_roles`/
    // `list_agents` have something to show — the scripted backend has no
    // delegation logic, so the requirement below goes straight to root and
    // root's reply lands on `user`, where the well-known endpoint (it never
    // runs turns) lets the turn settle instead of ping-ponging forever.
    let role = rt.org.create_role(
        "demo-worker",
        "Acknowledge every message and remember notes when asked.",
        None,
        None,
        None,
        None,
    )?;
    let agent = rt.org.create_agent(&role.role_id, loom_domain::org::ROOT_AGENT_ID, None)?;
    tracing::info!(role_id = %role.role_id, agent_id = %agent.agent_id, "seeded a demo role and agent");

    let task_id = rt.submit_requirement(message);
    tracing::info!(%task_id, "submitted requirement to root");

    let scheduler = rt.scheduler.clone();
    let run_handle = tokio::spawn(scheduler.clone().run());

    tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
    scheduler.request_shutdown();
    let _ = run_handle.await;

    let mut any = false;
    while let Some(msg) = rt.receive_for_user() {
        any = true;
        println!("{} -> user: {}", msg.from, msg.payload);
    }
    if !any {
        println!("(no replies reached the user endpoint in {timeout_ms}ms)");
    }

    Ok(())
}
