//! Schema and semantic checks on tool results.

use serde_json::Value;

use crate::shared::Tool;

/// Status values the workload system reports.
pub const KNOWN_STATUSES: &[&str] = &[
    "SUCC", "ABEND", "EXEC", "READY", "HOLD", "WAIT", "CANCELLED", "FAIL", "SCHED", "INTRO",
    "PEND", "ERROR", "DONE", "BLOCKED", "SUPPRESS",
];

fn check_status(result: &Value) -> Result<(), String> {
    let status = result
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| "status field missing".to_string())?;
    let upper = status.trim().to_ascii_uppercase();
    if !KNOWN_STATUSES.contains(&upper.as_str()) {
        return Err(format!("unknown job status {:?}", status));
    }
    match result.get("return_code") {
        None | Some(Value::Null) => Ok(()),
        Some(rc) => match rc.as_i64() {
            Some(n) if n >= 0 => Ok(()),
            Some(n) => Err(format!("negative return code {}", n)),
            None => Err("return_code is not an integer".to_string()),
        },
    }
}

/// `Err(reason)` sends the thread back to its handler with `reason` in the error context.
pub fn check(tool: &Tool, result: &Value) -> Result<(), String> {
    match tool {
        Tool::JobStatus { .. } => check_status(result),
        Tool::Troubleshoot { .. } => {
            let status = result
                .get("status")
                .ok_or_else(|| "troubleshoot result lacks a status".to_string())?;
            check_status(status)
        }
        Tool::JobAction { .. } => {
            if !result.is_object() {
                return Err("action response is not an object".to_string());
            }
            match result.get("accepted").and_then(Value::as_bool) {
                Some(false) => Err("action was not accepted by the workload system".to_string()),
                _ => Ok(()),
            }
        }
        Tool::Workstations { job: None } => {
            let list = result.get("workstations").unwrap_or(result);
            if list.is_array() {
                Ok(())
            } else {
                Err("workstation list is not an array".to_string())
            }
        }
        Tool::DependencyChain { .. }
        | Tool::Impact { .. }
        | Tool::CriticalJobs { .. }
        | Tool::CommonDependencies { .. }
        | Tool::Workstations { job: Some(_) } => Ok(()),
    }
}
