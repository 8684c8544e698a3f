use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// The TOML file structure for fanout.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub general: Option<GeneralConfig>,
    pub limits: Option<LimitsConfig>,
    pub spawn: Option<SpawnConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub default_agent: Option<String>,
    pub state_dir: Option<String>,
    /// Command that runs one LLM turn; the message is appended as the last argument.
    pub agent_command: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    pub task_timeout_secs: Option<u64>,
    pub max_parallel: Option<usize>,
    pub max_depth: Option<u32>,
    pub max_output_chars: Option<usize>,
    pub max_queued: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SpawnConfig {
    /// Executable started for each child. Defaults to the running binary.
    pub program: Option<String>,
    /// Arguments placed before the `--agent ... -m <task>` arguments.
    pub program_args: Option<Vec<String>>,
    pub keep_child_sessions: Option<bool>,
}

impl ConfigFile {
    /// Flatten the sectioned file layout into a mergeable partial config.
    pub fn to_partial(self) -> PartialConfig {
        let general = self.general;
        let limits = self.limits;
        let spawn = self.spawn;

        let (default_agent, state_dir, agent_command) = match general {
            Some(g) => (g.default_agent, g.state_dir.map(PathBuf::from), g.agent_command),
            None => (None, None, None),
        };

        let mut partial = PartialConfig {
            default_agent,
            state_dir,
            agent_command,
            ..Default::default()
        };

        if let Some(l) = limits {
            partial.task_timeout_secs = l.task_timeout_secs;
            partial.max_parallel = l.max_parallel;
            partial.max_depth = l.max_depth;
            partial.max_output_chars = l.max_output_chars;
            partial.max_queued = l.max_queued;
        }

        if let Some(s) = spawn {
            partial.program = s.program.map(PathBuf::from);
            partial.program_args = s.program_args;
            partial.keep_child_sessions = s.keep_child_sessions;
        }

        partial
    }
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub default_agent: String,
    pub state_dir: PathBuf,
    pub agent_command: Vec<String>,
    pub task_timeout_secs: u64,
    pub max_parallel: usize,
    pub max_depth: u32,
    pub max_output_chars: usize,
    pub max_queued: usize,
    pub program: PathBuf,
    pub program_args: Vec<String>,
    pub keep_child_sessions: bool,
}

impl AppConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub default_agent: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub agent_command: Option<Vec<String>>,
    pub task_timeout_secs: Option<u64>,
    pub max_parallel: Option<usize>,
    pub max_depth: Option<u32>,
    pub max_output_chars: Option<usize>,
    pub max_queued: Option<usize>,
    pub program: Option<PathBuf>,
    pub program_args: Option<Vec<String>>,
    pub keep_child_sessions: Option<bool>,
}
