//! Decision prompt rendering.
//!
//! The template marks each section as required or droppable; when the
//! rendered prompt exceeds the byte budget, droppable sections go first.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::core::action_space::{ActionSpec, ActionSpecKind};
use crate::core::types::MemoryRecord;

const DECISION_TEMPLATE: &str = include_str!("prompts/decision.md");

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker pattern is valid")
});

/// Everything the decision prompt shows the provider.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub agent: &'a str,
    pub task_id: &'a str,
    pub goal: &'a str,
    pub input: &'a Value,
    pub actions: &'a [ActionSpec],
    pub memory: &'a [MemoryRecord],
    pub rejections: &'a [String],
    pub schema: &'a Value,
    pub strict: bool,
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
struct ActionView {
    name: String,
    version: String,
    kind: &'static str,
    description: String,
    input_schema: Option<String>,
}

impl ActionView {
    fn from_spec(spec: &ActionSpec) -> Self {
        let input_schema = match &spec.kind {
            ActionSpecKind::Tool { input_schema, .. } => Some(input_schema.to_string()),
            ActionSpecKind::Delegate { .. } => None,
        };
        Self {
            name: spec.name.clone(),
            version: spec.version.clone(),
            kind: spec.kind().as_str(),
            description: spec.description.clone(),
            input_schema,
        }
    }
}

#[derive(Debug, Serialize)]
struct MemoryView {
    seq: u64,
    kind: &'static str,
    source: String,
    payload: String,
}

/// Render the decision prompt, trimmed to `budget_bytes`.
pub fn render_decision_prompt(inputs: &PromptInputs<'_>, budget_bytes: usize) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("decision", DECISION_TEMPLATE)
        .context("load decision template")?;

    let actions: Vec<ActionView> = inputs.actions.iter().map(ActionView::from_spec).collect();
    let memory: Vec<MemoryView> = inputs
        .memory
        .iter()
        .map(|record| MemoryView {
            seq: record.seq,
            kind: record.kind.as_str(),
            source: record.source.to_string(),
            payload: record.payload.to_string(),
        })
        .collect();
    let input = match inputs.input {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(serde_json::to_string_pretty(other).context("render task input")?),
    };

    let rendered = env
        .get_template("decision")
        .context("get decision template")?
        .render(context! {
            agent => inputs.agent,
            task_id => inputs.task_id,
            goal => inputs.goal.trim(),
            input => input,
            actions => actions,
            memory => memory,
            rejections => inputs.rejections,
            schema => serde_json::to_string_pretty(inputs.schema).context("render schema")?,
            strict => inputs.strict,
            dry_run => inputs.dry_run,
        })
        .context("render decision template")?;

    let mut sections = parse_sections(&rendered);
    drop_to_budget(&mut sections, budget_bytes);
    Ok(sections
        .iter()
        .map(|section| section.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n"))
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (idx, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(flag)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() {
            sections.push(Section {
                key: key.as_str().to_string(),
                required: flag.as_str() == "required",
                content,
            });
        }
    }
    sections
}

/// Drop order: memory first (largest and oldest context), then task input.
fn drop_to_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |sections: &[Section]| sections.iter().map(|s| s.content.len()).sum::<usize>();
    for key in ["memory", "input"] {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MemoryKind, TaskId};
    use chrono::Utc;
    use serde_json::json;

    fn spec() -> ActionSpec {
        ActionSpec {
            name: "fetch-document".to_string(),
            version: "1".to_string(),
            description: "download a document".to_string(),
            kind: ActionSpecKind::Tool {
                input_schema: json!({"type": "object"}),
                output_schema: json!({"type": "object"}),
                requires_approval: false,
            },
        }
    }

    fn record(seq: u64) -> MemoryRecord {
        MemoryRecord {
            seq,
            lineage: TaskId::from("root"),
            source: TaskId::from("root"),
            kind: MemoryKind::AttemptResult,
            payload: json!({"status": "failure", "detail": "x".repeat(200)}),
            recorded_at: Utc::now(),
        }
    }

    fn render(memory: &[MemoryRecord], rejections: &[String], budget: usize) -> String {
        let actions = [spec()];
        render_decision_prompt(
            &PromptInputs {
                agent: "summarizer",
                task_id: "root",
                goal: "summarize document X",
                input: &json!({"doc": "X"}),
                actions: &actions,
                memory,
                rejections,
                schema: &json!({"type": "object"}),
                strict: !rejections.is_empty(),
                dry_run: false,
            },
            budget,
        )
        .expect("render")
    }

    #[test]
    fn sections_render_in_order() {
        let content = render(&[record(1)], &["bad action".to_string()], 100_000);
        let contract = content.find("### Decision Contract").expect("contract");
        let task = content.find("### Task\n").expect("task");
        let actions = content.find("### Available Actions").expect("actions");
        let memory = content.find("### Memory").expect("memory");
        let rejected = content.find("### Rejected Proposals").expect("rejections");
        assert!(contract < task && task < actions && actions < memory && memory < rejected);
        assert!(content.contains("`fetch-document@1` (tool): download a document"));
        assert!(content.contains("previous answer was rejected"));
    }

    #[test]
    fn budget_drops_memory_before_required_sections() {
        let memory: Vec<_> = (1..=20).map(record).collect();
        let content = render(&memory, &[], 2_000);
        assert!(!content.contains("### Memory"));
        assert!(content.contains("### Available Actions"));
        assert!(!content.contains("### Rejected Proposals"));
    }
}
