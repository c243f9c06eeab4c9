//! Tool handler adapters.

use std::fmt;

use anyhow::Result;
use serde_json::Value;

use crate::core::action_space::Tool;
use crate::io::process::{ProcessLimits, run_json_command};

/// In-process tool backed by a closure.
pub struct FnTool<F> {
    name: String,
    f: F,
}

impl<F> FnTool<F>
where
    F: Fn(&Value) -> Result<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> fmt::Debug for FnTool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool").field("name", &self.name).finish()
    }
}

impl<F> Tool for FnTool<F>
where
    F: Fn(&Value) -> Result<Value> + Send + Sync,
{
    fn invoke(&self, input: &Value) -> Result<Value> {
        (self.f)(input)
    }
}

/// Tool that runs an external command, JSON in on stdin and JSON out on stdout.
#[derive(Debug, Clone)]
pub struct CommandTool {
    argv: Vec<String>,
    limits: ProcessLimits,
}

impl CommandTool {
    pub fn new(argv: Vec<String>, limits: ProcessLimits) -> Self {
        Self { argv, limits }
    }
}

impl Tool for CommandTool {
    fn invoke(&self, input: &Value) -> Result<Value> {
        run_json_command(&self.argv, input, self.limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fn_tool_calls_its_closure() {
        let tool = FnTool::new("double", |input: &Value| {
            let n = input["n"].as_i64().unwrap_or_default();
            Ok(json!({"n": n * 2}))
        });
        assert_eq!(tool.invoke(&json!({"n": 21})).expect("invoke"), json!({"n": 42}));
    }

    #[cfg(unix)]
    #[test]
    fn command_tool_round_trips_json() {
        let tool = CommandTool::new(
            vec!["cat".to_string()],
            ProcessLimits {
                timeout: std::time::Duration::from_secs(5),
                output_limit_bytes: 1_000,
            },
        );
        assert_eq!(
            tool.invoke(&json!({"doc": "x"})).expect("invoke"),
            json!({"doc": "x"})
        );
    }
}
