use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::call::hangup::CallControl;
use crate::call::transfer::transfer_call;
use crate::context::SharedContext;
use crate::session::ToolSpec;

pub const TRANSFER_TOOL: &str = "transfer_call";
pub const HANGUP_TOOL: &str = "hangUp";

const HANGUP_REPLY: &str = "Disconnecting now.";
const UNKNOWN_TOOL_REPLY: &str = "Unknown tool.";

/// Tools advertised to the language model when the session starts.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: TRANSFER_TOOL.to_string(),
            description: "Transfer the caller to a pre-configured destination.".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        },
        ToolSpec {
            name: HANGUP_TOOL.to_string(),
            description: "Disconnect the call and shut down the session immediately.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string", "default": "Call completed"},
                    "strict": {"type": "boolean", "default": false}
                }
            }),
        },
    ]
}

#[derive(Debug, Deserialize, PartialEq)]
struct HangUpArgs {
    #[serde(default = "default_reason")]
    reason: String,
    #[serde(default)]
    strict: bool,
}

impl Default for HangUpArgs {
    fn default() -> Self {
        Self {
            reason: default_reason(),
            strict: false,
        }
    }
}

fn default_reason() -> String {
    "Call completed".to_string()
}

/// Tool arguments arrive either as an object or as its JSON text.
fn parse_args<T: DeserializeOwned + Default>(arguments: &Value) -> T {
    let parsed = match arguments {
        Value::String(raw) => serde_json::from_str(raw),
        other => serde_json::from_value(other.clone()),
    };
    parsed.unwrap_or_default()
}

/// Run a tool and return the text handed back to the model.
pub async fn run_tool(
    name: &str,
    arguments: &Value,
    ctx: &SharedContext,
    control: &CallControl,
) -> String {
    match name {
        TRANSFER_TOOL => transfer_call(ctx, control).await.message().to_string(),
        HANGUP_TOOL => {
            let args: HangUpArgs = parse_args(arguments);
            control.hangup(&args.reason, args.strict).await;
            HANGUP_REPLY.to_string()
        }
        other => {
            tracing::warn!(tool = other, "Model called an unknown tool");
            UNKNOWN_TOOL_REPLY.to_string()
        }
    }
}

/// Run a tool call and send its output back to the session.
pub async fn handle_tool_call(
    call_id: String,
    name: String,
    arguments: Value,
    ctx: SharedContext,
    control: CallControl,
) {
    tracing::info!(tool = %name, %call_id, "Tool called");
    let output = run_tool(&name, &arguments, &ctx, &control).await;
    if let Err(e) = control.session.send_tool_result(&call_id, &output).await {
        tracing::debug!(tool = %name, "Tool result not delivered: {e}");
    }
}
