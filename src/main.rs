use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};

use fanout::cli::{Cli, Commands};
use fanout::config::{self, AppConfig};
use fanout::orchestration::recursion::SESSION_VAR;
use fanout::orchestration::{ChildSpawner, RecursionContext, SpawnerConfig};
use fanout::session::journal::{now_iso, LogEntry};
use fanout::session::SessionJournal;
use fanout::tools::{define_tools, tool_descriptions, DelegationTools};
use fanout::turn::{self, SessionRequest, SESSION_DIR_VAR};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout carries results (a child's answer, tool responses); logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli)?;
    let context = RecursionContext::from_env(config.max_depth);
    tracing::info!(
        depth = context.current_depth,
        max_depth = context.max_depth,
        state_dir = %config.state_dir.display(),
        "Config loaded"
    );

    match cli.command {
        Some(Commands::Serve) => {
            serve(&config, context).await?;
            // The pending stdin read cannot be cancelled; do not wait on it at
            // runtime shutdown.
            std::process::exit(0);
        }
        Some(Commands::Status) => {
            let tools = build_tools(&config, context);
            println!("{}", serde_json::to_string_pretty(&tools.queue().status())?);
            Ok(())
        }
        Some(Commands::Tools { markdown: true }) => {
            println!("{}", tool_descriptions());
            Ok(())
        }
        Some(Commands::Tools { markdown: false }) => {
            println!("{}", serde_json::to_string_pretty(&define_tools())?);
            Ok(())
        }
        None => {
            let Some(message) = cli.message.as_deref() else {
                anyhow::bail!("Nothing to do: pass -m <message> or a subcommand (see --help)");
            };
            let agent = cli.agent.clone().unwrap_or_else(|| config.default_agent.clone());
            let request = SessionRequest {
                new_session: cli.new_session,
                resume: cli.resume.clone(),
                inherited_id: std::env::var(SESSION_VAR).ok(),
            };
            let session = turn::resolve_session(&config, &agent, &request)?;
            let code = turn::run_turn(&config, &context, &session, message).await?;
            std::process::exit(code);
        }
    }
}

fn build_tools(config: &AppConfig, context: RecursionContext) -> DelegationTools {
    let spawner = Arc::new(ChildSpawner::new(SpawnerConfig::from(config), context));
    let author = std::env::var(SESSION_VAR).unwrap_or_else(|_| "user".to_string());
    DelegationTools::new(config, spawner, author)
}

/// One line of input to `fanout serve`.
#[derive(Debug, Deserialize)]
struct ToolRequest {
    #[serde(default)]
    id: Value,
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Line-delimited JSON tool server over stdin/stdout.
async fn serve(config: &AppConfig, context: RecursionContext) -> anyhow::Result<()> {
    let tools = build_tools(config, context);

    // SIGINT or SIGTERM kills every in-flight child and ends the server.
    // Handlers are installed before the ready line so no early signal is lost.
    let shutdown = tools.shutdown_token();
    let mut interrupt = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => tracing::warn!("Interrupted, cancelling in-flight children"),
            _ = terminate.recv() => tracing::warn!("Terminated, cancelling in-flight children"),
        }
        trigger.cancel();
    });

    // Tool calls are journaled into the calling turn's session, when known.
    let mut journal = match std::env::var_os(SESSION_DIR_VAR) {
        Some(dir) => match SessionJournal::open_at(&std::path::Path::new(&dir).join("history.jsonl")) {
            Ok(j) => Some(j),
            Err(e) => {
                tracing::warn!("Tool calls will not be journaled: {:#}", e);
                None
            }
        },
        None => None,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    tracing::info!("Tool server ready");

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!("Tool server shutting down");
                break;
            }
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else {
            tracing::info!("Tool server input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ToolRequest>(&line) {
            Ok(req) => {
                let call_id = req.id.to_string();
                if let Some(j) = journal.as_mut() {
                    j.record(&LogEntry::ToolCall {
                        timestamp: now_iso(),
                        call_id: call_id.clone(),
                        fn_name: req.name.clone(),
                        fn_arguments: req.arguments.clone(),
                    });
                }
                let output = tools.dispatch(&req.name, &req.arguments).await;
                if let Some(j) = journal.as_mut() {
                    j.record(&LogEntry::ToolResult {
                        timestamp: now_iso(),
                        call_id,
                        fn_name: req.name.clone(),
                        result: output.clone(),
                    });
                }
                json!({"id": req.id, "output": output})
            }
            Err(e) => json!({
                "id": Value::Null,
                "output": json!({"error": format!("Malformed request: {}", e)}).to_string(),
            }),
        };

        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }

    Ok(())
}
