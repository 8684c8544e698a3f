use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line surface. The top-level flags form the child invocation
/// contract: `fanout --agent <kind> --new-session -m "<task>"`.
#[derive(Parser, Debug)]
#[command(name = "fanout", version, about = "Depth-limited delegation core for agent processes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Agent profile this process runs as
    #[arg(long, global = true)]
    pub agent: Option<String>,

    /// Start a fresh session (adopts a parent-allocated session id if present)
    #[arg(long)]
    pub new_session: bool,

    /// Resume an existing session by id
    #[arg(long, conflicts_with = "new_session")]
    pub resume: Option<String>,

    /// One-shot message to run as a single agent turn
    #[arg(short = 'm', long)]
    pub message: Option<String>,

    /// Path to config file (overrides ./fanout.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Per-task timeout in seconds for delegated children
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Root directory for session state and shared files
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the delegation tools as line-delimited JSON over stdin/stdout
    Serve,
    /// Print the scheduler status for this process
    Status,
    /// Print the tool schemas exposed to the language model
    Tools {
        /// Print markdown descriptions for a system prompt instead of JSON schemas
        #[arg(long)]
        markdown: bool,
    },
}
