//! Runner template rendering using minijinja.
//!
//! A runner file is a template rendered against the values visible to the
//! executor running it:
//!
//! ```yaml
//! kind: OneExecute
//! request:
//!   target_id: api
//!   endpoint: /users/{{ Values.user_id }}
//!   headers:
//!     X-Worker: "{{ SlaveValues.SlaveID }}"
//! output:
//!   enabled: true
//!   ids: [run_{{ Dynamic.LoopCount }}]
//! ```

use minijinja::{Environment, Value};
use serde::Serialize;
use serde_json::Map;

use crate::error::RuntimeError;

/// Values available to a runner template.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RenderContext {
  pub slave_values: Map<String, serde_json::Value>,
  pub values: Map<String, serde_json::Value>,
  pub thread_values: Map<String, serde_json::Value>,
  pub dynamic: Dynamic,
}

/// Per-invocation counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dynamic {
  pub output_root: String,
  pub loop_count: usize,
  pub call_count: usize,
  /// Set only while rendering one iteration of a request loop.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub request_loop_count: Option<u64>,
}

/// Render `template` against `context`. `file` names the template in errors.
pub fn render(file: &str, template: &str, context: &RenderContext) -> Result<String, RuntimeError> {
  let env = Environment::new();
  env
    .render_str(template, Value::from_serialize(context))
    .map_err(|e| RuntimeError::Render {
      file: file.to_string(),
      message: e.to_string(),
    })
}
