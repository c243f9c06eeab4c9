//! Generative decision providers.
//!
//! A provider turns a rendered prompt into a raw JSON candidate. Its answer
//! is untrusted: the engine validates every candidate before acting on it.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};

use crate::core::action_space::ActionSpec;
use crate::core::types::{MemoryRecord, Mode, TaskId};
use crate::io::process::{ProcessLimits, run_json_command};

/// Everything a provider may use to propose the next step.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalRequest {
    pub agent: String,
    pub task_id: TaskId,
    pub goal: String,
    pub input: Value,
    pub actions: Vec<ActionSpec>,
    pub mode: Mode,
    /// Recent records, with only the current value of each learned fact.
    pub memory: Vec<MemoryRecord>,
    /// Rejection messages from earlier proposals for this decision.
    pub rejections: Vec<String>,
    /// 1-based proposal attempt within one decision.
    pub attempt: u32,
    pub strict: bool,
    pub dry_run: bool,
    pub prompt: String,
}

pub trait DecisionProvider: Send + Sync {
    fn propose(&self, request: &ProposalRequest) -> Result<Value>;
}

/// Provider backed by an external command.
///
/// The command receives `{"prompt": ..., "request": ...}` on stdin and must
/// print one candidate JSON object on stdout.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    argv: Vec<String>,
    limits: ProcessLimits,
}

impl CommandProvider {
    pub fn new(argv: Vec<String>, limits: ProcessLimits) -> Self {
        Self { argv, limits }
    }
}

impl DecisionProvider for CommandProvider {
    fn propose(&self, request: &ProposalRequest) -> Result<Value> {
        let payload = json!({"prompt": request.prompt, "request": request});
        run_json_command(&self.argv, &payload, self.limits)
            .with_context(|| format!("propose next step for {}", request.task_id))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, core_kind};
    use std::time::Duration;

    fn request() -> ProposalRequest {
        ProposalRequest {
            agent: "summarizer".to_string(),
            task_id: TaskId::from("root"),
            goal: "summarize".to_string(),
            input: json!({}),
            actions: Vec::new(),
            mode: Mode::Learn,
            memory: Vec::new(),
            rejections: Vec::new(),
            attempt: 1,
            strict: false,
            dry_run: false,
            prompt: "choose".to_string(),
        }
    }

    fn provider(script: &str) -> CommandProvider {
        CommandProvider::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ProcessLimits {
                timeout: Duration::from_secs(5),
                output_limit_bytes: 10_000,
            },
        )
    }

    #[test]
    fn command_provider_returns_stdout_json() {
        let candidate = provider(r#"cat >/dev/null; echo '{"decision":"cannot-complete","reason":"none"}'"#)
            .propose(&request())
            .expect("propose");
        assert_eq!(candidate["decision"], "cannot-complete");
    }

    #[test]
    fn command_provider_failures_keep_their_kind() {
        let err = provider("exit 1").propose(&request()).expect_err("fails");
        assert_eq!(core_kind(&err), Some(ErrorKind::ExternalFailure));
    }
}
