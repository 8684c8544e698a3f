//! Delegation depth carried across the process boundary.
//!
//! A child learns its depth only from the environment its parent started it
//! with. The parent computes the child's context with [`RecursionContext::child`]
//! and serializes it with [`RecursionContext::to_env`]; the child never writes
//! these values back.

use serde::Serialize;

use crate::error::DelegationError;

/// Number of delegation hops above this process. Absent means depth 0.
pub const DEPTH_VAR: &str = "FANOUT_DEPTH";
/// Comma-separated identifiers of the ancestor tasks, outermost first.
pub const ANCESTRY_VAR: &str = "FANOUT_ANCESTRY";
/// Session id the parent allocated for this child.
pub const SESSION_VAR: &str = "FANOUT_SESSION_ID";
/// The parent's depth ceiling, read back by the child's config loader.
pub const MAX_DEPTH_VAR: &str = "FANOUT_MAX_DEPTH";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecursionContext {
    pub current_depth: u32,
    pub max_depth: u32,
    pub ancestry: Vec<String>,
}

impl RecursionContext {
    /// Context of a process started directly by a user.
    pub fn root(max_depth: u32) -> Self {
        Self {
            current_depth: 0,
            max_depth,
            ancestry: Vec::new(),
        }
    }

    /// Read the context this process was started with.
    pub fn from_env(max_depth: u32) -> Self {
        Self::from_vars(std::env::vars(), max_depth)
    }

    /// Build a context from arbitrary key/value pairs.
    ///
    /// An unparseable depth is treated as the ceiling so a corrupted
    /// environment can never unlock further delegation.
    pub fn from_vars<I, K, V>(vars: I, max_depth: u32) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut ctx = Self::root(max_depth);
        for (key, value) in vars {
            let value = value.as_ref().trim();
            match key.as_ref() {
                DEPTH_VAR if !value.is_empty() => {
                    ctx.current_depth = value.parse().unwrap_or_else(|_| {
                        tracing::warn!(value, "Malformed {DEPTH_VAR}, refusing further delegation");
                        max_depth
                    });
                }
                ANCESTRY_VAR => {
                    ctx.ancestry = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                }
                _ => {}
            }
        }
        ctx
    }

    pub fn can_spawn(&self) -> bool {
        self.current_depth < self.max_depth
    }

    pub fn check_spawn(&self) -> Result<(), DelegationError> {
        if self.can_spawn() {
            Ok(())
        } else {
            Err(DelegationError::DepthExceeded {
                depth: self.current_depth,
                max: self.max_depth,
            })
        }
    }

    /// Context handed to a child spawned for the task identified by `task_ref`.
    pub fn child(&self, task_ref: &str) -> Result<Self, DelegationError> {
        self.check_spawn()?;
        let mut ancestry = self.ancestry.clone();
        ancestry.push(task_ref.to_string());
        Ok(Self {
            current_depth: self.current_depth + 1,
            max_depth: self.max_depth,
            ancestry,
        })
    }

    /// Environment variables that encode this context for a child process.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (DEPTH_VAR, self.current_depth.to_string()),
            (ANCESTRY_VAR, self.ancestry.join(",")),
            (MAX_DEPTH_VAR, self.max_depth.to_string()),
        ]
    }
}
