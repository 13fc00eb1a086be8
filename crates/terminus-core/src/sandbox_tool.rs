//! The `exec` tool: the model's only way to run commands.
//!
//! The SDK calls tool handlers on its own tasks, where the session's
//! environment cannot be borrowed. A handler holds an [`ExecClient`] and
//! sends each call as an [`ExecRequest`]; the agent's run loop answers it
//! with [`serve`], which runs the command through [`Environment::exec`].

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::environment::{Environment, ExecOutput};

/// Name of the in-process tool server.
pub(crate) const SERVER_NAME: &str = "sandbox";

/// Name of the tool within [`SERVER_NAME`].
pub(crate) const TOOL_NAME: &str = "exec";

pub(crate) const TOOL_DESCRIPTION: &str =
    "Run a shell command inside the task sandbox and return its exit code, stdout and stderr.";

/// Tool calls are answered one at a time.
const REQUEST_CHANNEL_SIZE: usize = 8;

/// Name the model sees the tool under.
pub(crate) fn qualified_tool_name() -> String {
    format!("mcp__{SERVER_NAME}__{TOOL_NAME}")
}

/// JSON schema of the tool arguments.
pub(crate) fn input_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "command": {
                "type": "string",
                "description": "Shell command, run with `sh -c` in the sandbox working directory"
            }
        },
        "required": ["command"]
    })
}

/// Tool result text, and whether the call itself failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ToolReply {
    pub text: String,
    pub is_error: bool,
}

impl ToolReply {
    fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// One pending tool call.
#[derive(Debug)]
pub(crate) struct ExecRequest {
    command: String,
    reply: oneshot::Sender<ToolReply>,
}

/// Handler side of the tool bridge.
#[derive(Debug, Clone)]
pub(crate) struct ExecClient {
    tx: mpsc::Sender<ExecRequest>,
}

pub(crate) fn exec_channel() -> (ExecClient, mpsc::Receiver<ExecRequest>) {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
    (ExecClient { tx }, rx)
}

impl ExecClient {
    /// Handle one tool call with the arguments the model supplied.
    pub(crate) async fn call(&self, args: &Value) -> ToolReply {
        let Some(command) = args
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
        else {
            return ToolReply::error("missing required string argument `command`");
        };

        let (reply, rx) = oneshot::channel();
        let request = ExecRequest {
            command: command.to_owned(),
            reply,
        };
        if self.tx.send(request).await.is_err() {
            return ToolReply::error("the sandbox session has ended");
        }
        rx.await
            .unwrap_or_else(|_| ToolReply::error("the sandbox session has ended"))
    }
}

/// Run one tool call inside the sandbox and answer it.
///
/// A command that exits non-zero is a normal result for the model; only a
/// failure to reach the sandbox is reported as a tool error.
pub(crate) async fn serve(env: &dyn Environment, request: ExecRequest) {
    debug!(command = %request.command, "sandbox exec");
    let reply = match env.exec(&request.command).await {
        Ok(output) => ToolReply {
            text: format_output(&output),
            is_error: false,
        },
        Err(err) => ToolReply::error(format!("sandbox error: {err}")),
    };
    let _ = request.reply.send(reply);
}

fn format_output(output: &ExecOutput) -> String {
    let code = output
        .exit_code
        .map_or_else(|| "none (killed by signal)".to_owned(), |c| c.to_string());
    format!(
        "exit code: {code}\nstdout:\n{}\nstderr:\n{}",
        output.stdout.trim_end(),
        output.stderr.trim_end()
    )
}
