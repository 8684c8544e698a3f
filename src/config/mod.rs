pub mod merge;
pub mod schema;

pub use schema::*;

use crate::cli::Cli;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Name of the project-local config file looked up in the current directory.
const LOCAL_CONFIG_FILE: &str = "fanout.toml";

/// Load configuration by merging global, local, environment, and CLI sources.
/// Precedence: CLI > environment > local config > global config > defaults.
///
/// Missing config files are handled gracefully (defaults apply). An explicit
/// `--config` path that cannot be read or parsed is an error.
pub fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    // Layer 1: Global config (~/.config/fanout/fanout.toml or platform equivalent)
    let global = load_global_config();

    // Layer 2: Local config (--config or ./fanout.toml)
    let local = match &cli.config {
        Some(path) => load_toml_file(path)?
            .with_context(|| format!("Config file not found: {}", path.display()))?,
        None => load_toml_file(Path::new(LOCAL_CONFIG_FILE))
            .unwrap_or_else(|e| {
                tracing::warn!("Ignoring local config: {:#}", e);
                None
            })
            .unwrap_or_default(),
    };

    // Layer 3: Environment (FANOUT_* variables)
    let env = env_partial(std::env::vars());

    // Layer 4: CLI args
    let cli_partial = cli_to_partial(cli);

    let config = cli_partial
        .with_fallback(env)
        .with_fallback(local)
        .with_fallback(global)
        .finalize()?;

    Ok(config)
}

/// Load global config from the platform-specific config directory.
/// Returns empty PartialConfig if the file is missing or broken.
fn load_global_config() -> PartialConfig {
    match global_config_path() {
        Some(p) => match load_toml_file(&p) {
            Ok(partial) => partial.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Ignoring global config: {:#}", e);
                PartialConfig::default()
            }
        },
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    }
}

/// Load and parse a TOML config file into a PartialConfig.
/// Returns `Ok(None)` when the file does not exist.
pub fn load_toml_file(path: &Path) -> anyhow::Result<Option<PartialConfig>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let config_file = toml::from_str::<ConfigFile>(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            tracing::info!("Loaded config from {}", path.display());
            Ok(Some(config_file.to_partial()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Ok(None)
        }
        Err(e) => {
            Err(e).with_context(|| format!("Failed to read config at {}", path.display()))
        }
    }
}

/// Resolve the platform-specific global config path.
/// Linux: ~/.config/fanout/fanout.toml
/// macOS: ~/Library/Application Support/fanout/fanout.toml
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "fanout")
        .map(|dirs| dirs.config_dir().join(LOCAL_CONFIG_FILE))
}

/// Build the environment layer from `FANOUT_*` variables.
///
/// Takes the variables as an iterator so callers (and tests) can supply
/// something other than the real process environment.
pub fn env_partial<I, K, V>(vars: I) -> PartialConfig
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut partial = PartialConfig::default();
    for (key, value) in vars {
        let value = value.as_ref().trim();
        match key.as_ref() {
            "FANOUT_TASK_TIMEOUT_SECS" => partial.task_timeout_secs = parse_var(key.as_ref(), value),
            "FANOUT_MAX_PARALLEL" => partial.max_parallel = parse_var(key.as_ref(), value),
            "FANOUT_MAX_DEPTH" => partial.max_depth = parse_var(key.as_ref(), value),
            "FANOUT_MAX_OUTPUT_CHARS" => partial.max_output_chars = parse_var(key.as_ref(), value),
            "FANOUT_MAX_QUEUED" => partial.max_queued = parse_var(key.as_ref(), value),
            "FANOUT_STATE_DIR" if !value.is_empty() => {
                partial.state_dir = Some(PathBuf::from(value))
            }
            "FANOUT_DEFAULT_AGENT" if !value.is_empty() => {
                partial.default_agent = Some(value.to_string())
            }
            _ => {}
        }
    }
    partial
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value, "Ignoring unparseable environment value");
            None
        }
    }
}

/// Convert CLI arguments to a PartialConfig for merging.
fn cli_to_partial(cli: &Cli) -> PartialConfig {
    PartialConfig {
        task_timeout_secs: cli.timeout,
        state_dir: cli.state_dir.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn env_layer_reads_known_variables() {
        let partial = env_partial([
            ("FANOUT_MAX_DEPTH", "1"),
            ("FANOUT_MAX_PARALLEL", "2"),
            ("FANOUT_STATE_DIR", "/tmp/fanout-state"),
            ("HOME", "/root"),
        ]);
        assert_eq!(partial.max_depth, Some(1));
        assert_eq!(partial.max_parallel, Some(2));
        assert_eq!(partial.state_dir, Some(PathBuf::from("/tmp/fanout-state")));
        assert_eq!(partial.max_queued, None);
    }

    #[test]
    fn env_layer_ignores_garbage() {
        let partial = env_partial([("FANOUT_MAX_QUEUED", "lots")]);
        assert_eq!(partial.max_queued, None);
    }

    #[test]
    fn toml_file_parses_all_sections() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fanout.toml");
        std::fs::write(
            &path,
            r#"
[general]
default_agent = "researcher"
agent_command = ["runner", "--print"]

[limits]
max_queued = 3
max_output_chars = 1000

[spawn]
program = "/bin/sh"
program_args = ["child.sh"]
keep_child_sessions = true
"#,
        )
        .unwrap();

        let partial = load_toml_file(&path).unwrap().unwrap();
        let config = partial.finalize().unwrap();
        assert_eq!(config.default_agent, "researcher");
        assert_eq!(config.agent_command, vec!["runner", "--print"]);
        assert_eq!(config.max_queued, 3);
        assert_eq!(config.max_output_chars, 1000);
        assert_eq!(config.program, PathBuf::from("/bin/sh"));
        assert_eq!(config.program_args, vec!["child.sh"]);
        assert!(config.keep_child_sessions);
    }

    #[test]
    fn missing_toml_file_is_none() {
        let tmp = TempDir::new().unwrap();
        let result = load_toml_file(&tmp.path().join("absent.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fanout.toml");
        std::fs::write(&path, "[limits\nmax_queued = ").unwrap();
        assert!(load_toml_file(&path).is_err());
    }
}
