//! Delegation tool schemas and dispatch.
//!
//! These are the operations a language model can call to hand work to child
//! agents. Every tool returns a `String`: plain text for `delegate` and
//! `notes_read`, JSON for everything else. Failures are never `Err`; they come
//! back as readable text (`{"error": "..."}` for JSON tools) so the calling
//! agent can reason about them within its own turn.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::orchestration::{ChildResult, ChildSpawner, TaskQueue, TaskSpec};
use crate::session::SharedNotes;

/// A tool as presented to the model: name, description and JSON schema.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: Value,
}

fn task_item_schema(with_priority: bool) -> Value {
    let mut properties = json!({
        "task": {"type": "string", "description": "What the child agent should do"},
        "agent": {"type": "string", "description": "Agent profile to run (defaults to the configured default)"},
        "context": {"type": "string", "description": "Initial working notes for the child"},
        "working_directory": {"type": "string", "description": "Directory the child starts in"}
    });
    if with_priority {
        properties["priority"] = json!({
            "type": "integer",
            "description": "Higher runs first; ties run in the order scheduled"
        });
    }
    json!({
        "oneOf": [
            {"type": "string"},
            {"type": "object", "properties": properties, "required": ["task"]}
        ]
    })
}

/// Define the delegation tool schemas.
pub fn define_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "delegate",
            description: "Run one task in a new, isolated child agent and wait for its answer. \
                          Returns the child's output text, or an error description.",
            schema: json!({
                "type": "object",
                "properties": {
                    "task": {"type": "string", "description": "What the child agent should do"},
                    "agent": {"type": "string", "description": "Agent profile to run"},
                    "context": {"type": "string", "description": "Initial working notes for the child"},
                    "working_directory": {"type": "string", "description": "Directory the child starts in"}
                },
                "required": ["task"]
            }),
        },
        ToolDefinition {
            name: "run_parallel",
            description: "Run several independent tasks in child agents at the same time. \
                          Returns a JSON array in input order with task, agent, success, output, error.",
            schema: json!({
                "type": "object",
                "properties": {
                    "tasks": {"type": "array", "items": task_item_schema(false)}
                },
                "required": ["tasks"]
            }),
        },
        ToolDefinition {
            name: "schedule",
            description: "Add tasks to the queue without running them. \
                          Returns queued count, task_ids and pending count, or a capacity error.",
            schema: json!({
                "type": "object",
                "properties": {
                    "tasks": {"type": "array", "items": task_item_schema(true)}
                },
                "required": ["tasks"]
            }),
        },
        ToolDefinition {
            name: "execute_scheduled",
            description: "Run every queued task, highest priority first, and wait for all of them. \
                          Returns a JSON array of results in dispatch order.",
            schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "queue_status",
            description: "Report pending tasks, limits, current delegation depth and whether \
                          this agent may still delegate.",
            schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "task_result",
            description: "Look up a scheduled task by id: its status and, once finished, its result.",
            schema: json!({
                "type": "object",
                "properties": {"task_id": {"type": "integer"}},
                "required": ["task_id"]
            }),
        },
        ToolDefinition {
            name: "clear_queue",
            description: "Cancel every task that has not started yet and forget finished tasks. \
                          Returns the number cancelled and forgotten.",
            schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "notes_read",
            description: "Read the notes shared by all agents.",
            schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "notes_append",
            description: "Append an entry to the notes shared by all agents.",
            schema: json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        },
    ]
}

/// Return a human-readable description of the delegation tools, for
/// embedding in a system prompt.
pub fn tool_descriptions() -> String {
    "\
### delegate
Run one task in an isolated child agent and wait for the answer.
- **task** (string, required), **agent**, **context**, **working_directory** (optional)
- Returns: the child's output text, or an `Error:` line explaining the failure

### run_parallel
Run independent tasks concurrently (bounded by max_parallel).
- **tasks** (array, required): strings or objects with the same fields as `delegate`
- Returns: JSON array in input order with task, agent, success, output, error

### schedule
Queue tasks for a later `execute_scheduled`.
- **tasks** (array, required): as for `run_parallel`, plus optional integer **priority**
- Returns: JSON with queued, task_ids, pending; or an error when the queue is full

### execute_scheduled
Run all queued tasks, highest priority first (ties in scheduling order).
- Returns: JSON array of results in dispatch order

### queue_status
- Returns: pending_count, max_queued, max_parallel, current_depth, max_depth, can_spawn

### task_result
- **task_id** (integer, required)
- Returns: the task record with status and result

### clear_queue
Cancel pending tasks and drop finished task records.
- Returns: JSON with cancelled and forgotten counts

### notes_read / notes_append
Shared notes visible to every agent. `notes_append` takes **text** (string, required)."
        .to_string()
}

/// One task in a tool argument list: a bare string or a full object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TaskItem {
    Text(String),
    Full(TaskArgs),
}

#[derive(Debug, Deserialize)]
struct TaskArgs {
    task: String,
    agent: Option<String>,
    priority: Option<i64>,
    context: Option<String>,
    working_directory: Option<PathBuf>,
}

/// Row of a `run_parallel` / `execute_scheduled` response.
#[derive(Debug, Serialize)]
struct ResultEntry<'a> {
    task: &'a str,
    agent: &'a str,
    success: bool,
    output: &'a str,
    error: Option<&'a str>,
}

impl<'a> From<&'a ChildResult> for ResultEntry<'a> {
    fn from(r: &'a ChildResult) -> Self {
        Self {
            task: &r.originating_task,
            agent: &r.agent_kind,
            success: r.success,
            output: &r.output,
            error: r.error_message.as_deref(),
        }
    }
}

/// The delegation tool surface of one agent process.
///
/// Owns the process's single [`TaskQueue`], so `schedule` and
/// `execute_scheduled` compose across calls.
pub struct DelegationTools {
    spawner: Arc<ChildSpawner>,
    queue: TaskQueue,
    notes: SharedNotes,
    default_agent: String,
    timeout: Duration,
    /// Attribution for shared notes (normally the session id).
    author: String,
}

impl DelegationTools {
    pub fn new(config: &AppConfig, spawner: Arc<ChildSpawner>, author: impl Into<String>) -> Self {
        Self {
            queue: TaskQueue::new(Arc::clone(&spawner), config.max_queued),
            spawner,
            notes: SharedNotes::new(&config.state_dir),
            default_agent: config.default_agent.clone(),
            timeout: config.task_timeout(),
            author: author.into(),
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Token that, once cancelled, kills every child this surface started.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.spawner.shutdown_token()
    }

    /// Route a tool call by name.
    pub async fn dispatch(&self, name: &str, args: &Value) -> String {
        tracing::info!(tool = name, "Dispatching delegation tool");
        match name {
            "delegate" => self.dispatch_delegate(args).await,
            "run_parallel" => self.dispatch_run_parallel(args).await,
            "schedule" => self.dispatch_schedule(args),
            "execute_scheduled" => self.execute_scheduled().await,
            "queue_status" => self.queue_status(),
            "task_result" => self.dispatch_task_result(args),
            "clear_queue" => self.clear_queue(),
            "notes_read" => self.notes_read().await,
            "notes_append" => self.dispatch_notes_append(args).await,
            unknown => json!({"error": format!("Unknown tool: {}", unknown)}).to_string(),
        }
    }

    /// Run one task and return its output, or descriptive error text.
    pub async fn delegate(&self, spec: TaskSpec) -> String {
        let result = self.spawner.spawn(&spec, self.timeout).await;
        if result.success {
            return result.output;
        }

        let mut text = format!(
            "Error: delegation to agent `{}` failed: {}",
            result.agent_kind,
            result.error_message.as_deref().unwrap_or("unknown error")
        );
        if !result.output.is_empty() {
            text.push_str("\nPartial output:\n");
            text.push_str(&result.output);
        }
        text
    }

    pub async fn run_parallel(&self, specs: Vec<TaskSpec>) -> String {
        let results = self.spawner.run_parallel(&specs, self.timeout).await;
        render_results(&results)
    }

    pub fn schedule(&self, specs: Vec<TaskSpec>) -> String {
        match self.queue.enqueue_batch(specs) {
            Ok(ids) => json!({
                "queued": ids.len(),
                "task_ids": ids,
                "pending": self.queue.status().pending_count,
            })
            .to_string(),
            Err(e) => json!({
                "error": e.to_string(),
                "queued": e.enqueued.len(),
                "task_ids": &e.enqueued,
                "pending": self.queue.status().pending_count,
            })
            .to_string(),
        }
    }

    pub async fn execute_scheduled(&self) -> String {
        let results = self.queue.drain_and_execute(self.timeout).await;
        render_results(&results)
    }

    /// Cancel pending tasks, then drop the records of every finished task.
    pub fn clear_queue(&self) -> String {
        let cancelled = self.queue.clear();
        let forgotten = self.queue.forget_finished();
        json!({"cancelled": cancelled, "forgotten": forgotten}).to_string()
    }

    pub fn queue_status(&self) -> String {
        serde_json::to_string(&self.queue.status())
            .unwrap_or_else(|e| json!({"error": format!("Failed to serialize status: {}", e)}).to_string())
    }

    async fn dispatch_delegate(&self, args: &Value) -> String {
        match self.parse_item(args.clone()) {
            Ok(spec) => self.delegate(spec).await,
            Err(e) => format!("Error: delegate: {e}"),
        }
    }

    async fn dispatch_run_parallel(&self, args: &Value) -> String {
        match self.parse_task_list(args) {
            Ok(specs) => self.run_parallel(specs).await,
            Err(e) => json!({"error": format!("run_parallel: {}", e)}).to_string(),
        }
    }

    fn dispatch_schedule(&self, args: &Value) -> String {
        match self.parse_task_list(args) {
            Ok(specs) => self.schedule(specs),
            Err(e) => json!({"error": format!("schedule: {}", e)}).to_string(),
        }
    }

    fn dispatch_task_result(&self, args: &Value) -> String {
        let Some(id) = args.get("task_id").and_then(Value::as_u64) else {
            return json!({"error": "task_result: missing or invalid 'task_id' argument"}).to_string();
        };
        match self.queue.get(id) {
            Ok(task) => serde_json::to_string(&task)
                .unwrap_or_else(|e| json!({"error": format!("Failed to serialize task: {}", e)}).to_string()),
            Err(e) => json!({"error": format!("task_result: {}", e)}).to_string(),
        }
    }

    async fn notes_read(&self) -> String {
        let notes = self.notes.clone();
        match tokio::task::spawn_blocking(move || notes.read()).await {
            Ok(Ok(text)) if text.trim().is_empty() => "(no shared notes yet)".to_string(),
            Ok(Ok(text)) => text,
            Ok(Err(e)) => json!({"error": format!("notes_read: {}", e)}).to_string(),
            Err(e) => json!({"error": format!("notes_read: {}", e)}).to_string(),
        }
    }

    async fn dispatch_notes_append(&self, args: &Value) -> String {
        let Some(text) = args.get("text").and_then(Value::as_str) else {
            return json!({"error": "notes_append: missing or invalid 'text' argument"}).to_string();
        };
        let notes = self.notes.clone();
        let author = self.author.clone();
        let text = text.to_string();
        let appended = text.len();
        match tokio::task::spawn_blocking(move || notes.append(&author, &text)).await {
            Ok(Ok(total)) => json!({"appended_bytes": appended, "total_bytes": total}).to_string(),
            Ok(Err(e)) => json!({"error": format!("notes_append: {}", e)}).to_string(),
            Err(e) => json!({"error": format!("notes_append: {}", e)}).to_string(),
        }
    }

    fn parse_task_list(&self, args: &Value) -> Result<Vec<TaskSpec>, String> {
        let items = args
            .get("tasks")
            .and_then(Value::as_array)
            .ok_or_else(|| "missing or invalid 'tasks' argument".to_string())?;
        if items.is_empty() {
            return Err("'tasks' must not be empty".to_string());
        }
        items.iter().cloned().map(|item| self.parse_item(item)).collect()
    }

    fn parse_item(&self, value: Value) -> Result<TaskSpec, String> {
        let item: TaskItem = serde_json::from_value(value)
            .map_err(|_| "each task needs a non-empty 'task' string".to_string())?;
        let args = match item {
            TaskItem::Text(task) => TaskArgs {
                task,
                agent: None,
                priority: None,
                context: None,
                working_directory: None,
            },
            TaskItem::Full(args) => args,
        };
        if args.task.trim().is_empty() {
            return Err("each task needs a non-empty 'task' string".to_string());
        }

        Ok(TaskSpec {
            description: args.task,
            agent_kind: args
                .agent
                .filter(|a| !a.trim().is_empty())
                .unwrap_or_else(|| self.default_agent.clone()),
            priority: args.priority.unwrap_or(0),
            working_directory: args.working_directory,
            initial_context: args.context.filter(|c| !c.is_empty()),
        })
    }
}

fn render_results(results: &[ChildResult]) -> String {
    let entries: Vec<ResultEntry<'_>> = results.iter().map(ResultEntry::from).collect();
    serde_json::to_string(&entries)
        .unwrap_or_else(|e| json!({"error": format!("Failed to serialize results: {}", e)}).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartialConfig;
    use crate::orchestration::{RecursionContext, SpawnerConfig};
    use tempfile::TempDir;

    /// Tools whose process sits at `depth` of `max_depth`; no child is ever
    /// started at the ceiling.
    fn make_tools(tmp: &TempDir, depth: u32, max_depth: u32, max_queued: usize) -> DelegationTools {
        let config = PartialConfig {
            state_dir: Some(tmp.path().to_path_buf()),
            program: Some(PathBuf::from("/bin/true")),
            max_queued: Some(max_queued),
            max_depth: Some(max_depth),
            ..Default::default()
        }
        .finalize()
        .unwrap();
        let context = RecursionContext {
            current_depth: depth,
            max_depth,
            ancestry: vec![],
        };
        let spawner = Arc::new(ChildSpawner::new(SpawnerConfig::from(&config), context));
        DelegationTools::new(&config, spawner, "test-session")
    }

    #[test]
    fn define_tools_has_expected_names() {
        let names: Vec<&str> = define_tools().iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                "delegate",
                "run_parallel",
                "schedule",
                "execute_scheduled",
                "queue_status",
                "task_result",
                "clear_queue",
                "notes_read",
                "notes_append"
            ]
        );
    }

    #[test]
    fn tool_descriptions_cover_every_tool() {
        let desc = tool_descriptions();
        for tool in define_tools() {
            assert!(desc.contains(tool.name), "missing description for {}", tool.name);
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let tmp = TempDir::new().unwrap();
        let tools = make_tools(&tmp, 0, 3, 10);
        let result = tools.dispatch("summon", &json!({})).await;
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("Unknown tool: summon"));
    }

    #[tokio::test]
    async fn delegate_missing_task_is_error_text() {
        let tmp = TempDir::new().unwrap();
        let tools = make_tools(&tmp, 0, 3, 10);
        let result = tools.dispatch("delegate", &json!({"agent": "general"})).await;
        assert!(result.starts_with("Error: delegate:"));
    }

    #[tokio::test]
    async fn delegate_at_depth_limit_explains_itself() {
        let tmp = TempDir::new().unwrap();
        let tools = make_tools(&tmp, 2, 2, 10);
        let result = tools.dispatch("delegate", &json!({"task": "dig deeper"})).await;
        assert!(result.starts_with("Error: delegation to agent `general` failed"));
        assert!(result.contains("depth"));
        // Nothing was created for the rejected child.
        assert!(!tmp.path().join("sessions").exists());
    }

    #[tokio::test]
    async fn schedule_reports_ids_and_capacity() {
        let tmp = TempDir::new().unwrap();
        let tools = make_tools(&tmp, 0, 3, 2);

        let ok = tools
            .dispatch("schedule", &json!({"tasks": ["a", {"task": "b", "priority": 4}]}))
            .await;
        let parsed: Value = serde_json::from_str(&ok).unwrap();
        assert_eq!(parsed["queued"], 2);
        assert_eq!(parsed["task_ids"], json!([1, 2]));
        assert_eq!(parsed["pending"], 2);

        let full = tools.dispatch("schedule", &json!({"tasks": ["c"]})).await;
        let parsed: Value = serde_json::from_str(&full).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("full"));
        assert_eq!(parsed["queued"], 0);
        assert_eq!(parsed["pending"], 2);
    }

    #[tokio::test]
    async fn schedule_rejects_empty_list() {
        let tmp = TempDir::new().unwrap();
        let tools = make_tools(&tmp, 0, 3, 2);
        let result = tools.dispatch("schedule", &json!({"tasks": []})).await;
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("must not be empty"));
    }

    #[tokio::test]
    async fn status_task_result_and_clear() {
        let tmp = TempDir::new().unwrap();
        let tools = make_tools(&tmp, 1, 3, 5);
        tools.dispatch("schedule", &json!({"tasks": ["a", "b"]})).await;

        let status: Value =
            serde_json::from_str(&tools.dispatch("queue_status", &json!({})).await).unwrap();
        assert_eq!(status["pending_count"], 2);
        assert_eq!(status["current_depth"], 1);
        assert_eq!(status["can_spawn"], true);

        let task: Value =
            serde_json::from_str(&tools.dispatch("task_result", &json!({"task_id": 2})).await)
                .unwrap();
        assert_eq!(task["description"], "b");
        assert_eq!(task["agent_kind"], "general");
        assert_eq!(task["status"], "pending");

        let cleared: Value =
            serde_json::from_str(&tools.dispatch("clear_queue", &json!({})).await).unwrap();
        assert_eq!(cleared["cancelled"], 2);
        assert_eq!(cleared["forgotten"], 2);

        let missing: Value =
            serde_json::from_str(&tools.dispatch("task_result", &json!({"task_id": 99})).await)
                .unwrap();
        assert!(missing["error"].as_str().unwrap().contains("unknown task id 99"));
    }

    #[tokio::test]
    async fn shared_notes_round_trip() {
        let tmp = TempDir::new().unwrap();
        let tools = make_tools(&tmp, 0, 3, 5);
        assert_eq!(tools.dispatch("notes_read", &json!({})).await, "(no shared notes yet)");

        let appended: Value = serde_json::from_str(
            &tools
                .dispatch("notes_append", &json!({"text": "API lives in src/api"}))
                .await,
        )
        .unwrap();
        assert_eq!(appended["appended_bytes"], 20);

        let notes = tools.dispatch("notes_read", &json!({})).await;
        assert!(notes.contains("API lives in src/api"));
        assert!(notes.contains("test-session"));
    }
}
