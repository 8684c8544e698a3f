use super::schema::{AppConfig, PartialConfig};
use crate::error::ConfigError;
use std::path::PathBuf;

pub const DEFAULT_AGENT: &str = "general";
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_PARALLEL: usize = 5;
pub const DEFAULT_MAX_DEPTH: u32 = 3;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 50_000;
pub const DEFAULT_MAX_QUEUED: usize = 10;

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    /// For list values (agent_command, program_args): REPLACE semantics.
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            default_agent: self.default_agent.or(fallback.default_agent),
            state_dir: self.state_dir.or(fallback.state_dir),
            agent_command: self.agent_command.or(fallback.agent_command),
            task_timeout_secs: self.task_timeout_secs.or(fallback.task_timeout_secs),
            max_parallel: self.max_parallel.or(fallback.max_parallel),
            max_depth: self.max_depth.or(fallback.max_depth),
            max_output_chars: self.max_output_chars.or(fallback.max_output_chars),
            max_queued: self.max_queued.or(fallback.max_queued),
            program: self.program.or(fallback.program),
            program_args: self.program_args.or(fallback.program_args),
            keep_child_sessions: self.keep_child_sessions.or(fallback.keep_child_sessions),
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults and
    /// rejecting limits that would make the scheduler unusable.
    pub fn finalize(self) -> Result<AppConfig, ConfigError> {
        let config = AppConfig {
            default_agent: self
                .default_agent
                .unwrap_or_else(|| DEFAULT_AGENT.to_string()),
            state_dir: self.state_dir.unwrap_or_else(default_state_dir),
            agent_command: self.agent_command.unwrap_or_default(),
            task_timeout_secs: self.task_timeout_secs.unwrap_or(DEFAULT_TASK_TIMEOUT_SECS),
            max_parallel: self.max_parallel.unwrap_or(DEFAULT_MAX_PARALLEL),
            max_depth: self.max_depth.unwrap_or(DEFAULT_MAX_DEPTH),
            max_output_chars: self.max_output_chars.unwrap_or(DEFAULT_MAX_OUTPUT_CHARS),
            max_queued: self.max_queued.unwrap_or(DEFAULT_MAX_QUEUED),
            program: self.program.unwrap_or_else(default_program),
            program_args: self.program_args.unwrap_or_default(),
            keep_child_sessions: self.keep_child_sessions.unwrap_or(false),
        };

        require_positive("task_timeout_secs", config.task_timeout_secs as usize)?;
        require_positive("max_parallel", config.max_parallel)?;
        require_positive("max_output_chars", config.max_output_chars)?;
        require_positive("max_queued", config.max_queued)?;
        if config.default_agent.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "default_agent",
                message: "must not be empty".to_string(),
            });
        }

        Ok(config)
    }
}

fn require_positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            message: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

/// Linux: ~/.local/share/fanout, macOS: ~/Library/Application Support/fanout.
fn default_state_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "fanout")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".fanout"))
}

/// Children run the same program as the parent unless configured otherwise.
fn default_program() -> PathBuf {
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("fanout"))
}
