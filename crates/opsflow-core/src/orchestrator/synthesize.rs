//! Deterministic response templates.
//!
//! Tool outputs are redacted before any field is read, and the finished text is masked once
//! more, so a sensitive value can only reach the user if it survives both passes.

use serde_json::Value;

use super::thread::Thread;
use crate::security::PayloadRedactor;
use crate::shared::{Intent, Tool, ToolOutput};

pub const GENERAL_SYSTEM_PROMPT: &str = "You are an operations assistant for a workload automation system. \
Answer briefly and factually using only the context provided. Never include credentials, connection strings or raw payloads.";

const LOG_LINES: usize = 5;

fn text<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

fn names(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    other => text(other, "job")
                        .or_else(|| text(other, "name"))
                        .map(str::to_string),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn status_line(job: &str, status: &Value) -> String {
    let state = text(status, "status").unwrap_or("UNKNOWN").to_ascii_uppercase();
    let mut line = format!("Job {} is {}", job, state);
    if let Some(rc) = status.get("return_code").and_then(Value::as_i64) {
        line.push_str(&format!(" (return code {})", rc));
    }
    if let Some(ws) = text(status, "workstation") {
        line.push_str(&format!(" on workstation {}", ws));
    }
    line.push('.');
    if let Some(last) = text(status, "last_run").or_else(|| text(status, "end_time")) {
        line.push_str(&format!(" Last run: {}.", last));
    }
    line
}

fn render_output(intent: Intent, output: &ToolOutput, result: &Value) -> Option<String> {
    match &output.tool {
        Tool::JobStatus { job } if intent == Intent::Status => Some(status_line(job, result)),
        Tool::Troubleshoot { job } => {
            let status = result.get("status").cloned().unwrap_or(Value::Null);
            let mut out = status_line(job, &status);
            let log = result
                .get("log")
                .and_then(|l| text(l, "content").or_else(|| l.as_str()))
                .map(|l| {
                    l.lines()
                        .rev()
                        .take(LOG_LINES)
                        .collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect::<Vec<_>>()
                        .join("\n")
                });
            if let Some(log) = log.filter(|l| !l.is_empty()) {
                out.push_str(&format!("\nRecent log:\n{}", log));
            }
            let deps = names(result.get("dependencies").unwrap_or(&Value::Null));
            if deps.is_empty() {
                out.push_str("\nNo upstream dependencies are recorded.");
            } else {
                out.push_str(&format!("\nUpstream dependencies to check: {}.", deps.join(", ")));
            }
            Some(out)
        }
        Tool::DependencyChain { job } => {
            let deps = result.get("dependencies").cloned().unwrap_or(Value::Null);
            let entries: Vec<String> = deps
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|e| {
                            let name = text(e, "job")?;
                            let depth = e.get("depth").and_then(Value::as_u64).unwrap_or(1);
                            Some(format!("{} (depth {})", name, depth))
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(if entries.is_empty() {
                format!("No upstream dependencies were found for job {}.", job)
            } else {
                format!("Job {} depends on: {}.", job, entries.join(", "))
            })
        }
        Tool::Impact { job } => {
            let direct = names(result.get("direct").unwrap_or(&Value::Null));
            let transitive = names(result.get("transitive").unwrap_or(&Value::Null));
            if transitive.is_empty() {
                return Some(format!("No jobs depend on job {}.", job));
            }
            let mut out = format!(
                "{} job(s) depend directly on {}: {}. {} job(s) are affected downstream in total.",
                direct.len(),
                job,
                direct.join(", "),
                transitive.len()
            );
            if result.get("critical").and_then(Value::as_bool).unwrap_or(false) {
                out.push_str(&format!(" Job {} is critical.", job));
            }
            Some(out)
        }
        Tool::CriticalJobs { .. } => {
            let ranked: Vec<String> = result
                .get("jobs")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .enumerate()
                        .filter_map(|(i, e)| {
                            let name = text(e, "job")?;
                            let fan_out = e.get("fan_out").and_then(Value::as_u64).unwrap_or(0);
                            Some(format!("{}. {} ({} dependents)", i + 1, name, fan_out))
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(if ranked.is_empty() {
                "No job has downstream dependents.".to_string()
            } else {
                format!("Most critical jobs by downstream fan-out:\n{}", ranked.join("\n"))
            })
        }
        Tool::CommonDependencies { jobs } => {
            let common = names(result.get("common").unwrap_or(&Value::Null));
            Some(if common.is_empty() {
                format!("Jobs {} share no upstream dependencies.", jobs.join(", "))
            } else {
                format!("Common dependencies of {}: {}.", jobs.join(", "), common.join(", "))
            })
        }
        Tool::Workstations { job } => {
            let list = names(result.get("workstations").unwrap_or(result));
            Some(match (job, list.is_empty()) {
                (Some(job), true) => format!("No workstation is recorded for job {}.", job),
                (Some(job), false) => format!("Job {} runs on {}.", job, list.join(", ")),
                (None, true) => "No workstations are defined.".to_string(),
                (None, false) => format!("Workstations: {}.", list.join(", ")),
            })
        }
        Tool::JobAction { job, action } => {
            let request = text(result, "request_id").unwrap_or(&output.call_id);
            Some(format!(
                "{} of job {} was submitted (request {}).",
                action.label(),
                job,
                request
            ))
        }
        Tool::JobStatus { .. } => None,
    }
}

/// Templated answer for the thread's latest tool output, or `None` when no template fits.
pub fn render(thread: &Thread, redactor: &PayloadRedactor) -> Option<String> {
    let intent = thread.intent.unwrap_or(Intent::General);
    if intent == Intent::General {
        return None;
    }
    let output = thread.tool_outputs.last()?;
    let result = redactor.redact_value(&output.result);
    render_output(intent, output, &result).map(|t| redactor.mask_text(&t))
}

/// Redacted tool context for a model-written answer.
pub fn model_context(thread: &Thread, redactor: &PayloadRedactor) -> String {
    let outputs: Vec<Value> = thread
        .tool_outputs
        .iter()
        .map(|o| redactor.redact_value(&o.result))
        .collect();
    let question = thread.last_user_message().unwrap_or_default();
    if outputs.is_empty() {
        redactor.mask_text(question)
    } else {
        redactor.mask_text(&format!(
            "{}\n\nContext:\n{}",
            question,
            Value::Array(outputs)
        ))
    }
}

/// Used when no template fits and the model is unavailable.
pub fn generic_reply() -> String {
    "I can help with job status, troubleshooting, dependency and impact questions, and job actions such as rerun or hold. \
Please name the job you are interested in."
        .to_string()
}

pub fn apology(attempts: u32, correlation_id: &str) -> String {
    format!(
        "Sorry, I could not complete that request after {} attempt(s). Reference: {}.",
        attempts, correlation_id
    )
}

pub fn approval_message(action: &str, job: &str, item_id: &str) -> String {
    format!(
        "{} of job {} targets production and needs approval. Audit item {} is pending review.",
        action, job, item_id
    )
}

pub fn cancelled_message(reason: &str) -> String {
    format!("Request cancelled: {}. No further actions were taken.", reason)
}
