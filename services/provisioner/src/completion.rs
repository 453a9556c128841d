//! Workflow completion output.
//!
//! Every workflow run ends with one JSON line of the form
//! `{"error": ..., "result": ...}`. Exactly one of the two is non-null.

use std::io::Write;

use serde_json::{json, Value};

use crate::error::WorkflowError;

/// The completion document for a workflow outcome.
pub fn completion_json(outcome: &Result<String, WorkflowError>) -> Value {
    match outcome {
        Ok(message) => json!({ "error": null, "result": message }),
        Err(e) => json!({
            "error": { "reason": e.reason_code(), "message": e.to_string() },
            "result": null,
        }),
    }
}

/// Write the completion line to `out`. A workflow error is written and then
/// returned so the process exits non-zero.
pub fn write_completion<W: Write>(
    out: &mut W,
    outcome: Result<String, WorkflowError>,
) -> anyhow::Result<()> {
    writeln!(out, "{}", completion_json(&outcome))?;
    out.flush()?;
    outcome.map(|_| ()).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(outcome: Result<String, WorkflowError>) -> (Value, anyhow::Result<()>) {
        let mut out = Vec::new();
        let result = write_completion(&mut out, outcome);
        let line = String::from_utf8(out).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.lines().count(), 1);
        (serde_json::from_str::<Value>(&line).unwrap(), result)
    }

    #[test]
    fn test_success_prints_result_and_returns_ok() {
        let (doc, result) = written(Ok("i-06fc91a93c8d2534e provisioned".to_string()));

        assert!(result.is_ok());
        assert_eq!(
            doc,
            json!({ "error": null, "result": "i-06fc91a93c8d2534e provisioned" })
        );
    }

    #[test]
    fn test_failure_prints_reason_and_returns_err() {
        let (doc, result) = written(Err(WorkflowError::InvalidEvent(
            "no EC2InstanceId in event".into(),
        )));

        assert!(doc["result"].is_null());
        assert_eq!(doc["error"]["reason"], "invalid_event");
        assert!(doc["error"]["message"]
            .as_str()
            .unwrap()
            .contains("no EC2InstanceId in event"));

        let err = result.unwrap_err();
        let workflow = err.downcast_ref::<WorkflowError>().unwrap();
        assert_eq!(workflow.reason_code(), "invalid_event");
    }

    #[test]
    fn test_completion_json_has_exactly_one_side_set() {
        let ok = completion_json(&Ok("done".to_string()));
        assert!(ok["error"].is_null());
        assert_eq!(ok["result"], "done");

        let err = completion_json(&Err(WorkflowError::InvalidEvent("empty".into())));
        assert!(!err["error"].is_null());
        assert!(err["result"].is_null());
    }
}
