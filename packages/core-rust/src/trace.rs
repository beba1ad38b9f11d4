//! Distributed trace records and the collector payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Caller route recorded when the event carried no `from`.
pub const UNKNOWN_CALLER: &str = "unknown";

/// Input and output snapshot, kept only for journaled routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceJournal {
    pub input: Value,
    pub output: Value,
}

/// The timed, annotated record of one hop in a call chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Origin identifier of the process that handled the hop.
    pub origin: String,
    pub trace_id: String,
    pub trace_path: String,
    /// Route of the service that handled the hop.
    pub service: String,
    /// Caller route, or [`UNKNOWN_CALLER`].
    pub from: String,
    /// Start time in milliseconds since Unix epoch.
    pub start: u64,
    pub success: bool,
    /// Milliseconds with 3-decimal precision.
    pub exec_time: f64,
    pub status: u16,
    pub exception: Option<String>,
    pub annotations: BTreeMap<String, Value>,
    pub journal: Option<TraceJournal>,
}

impl TraceRecord {
    /// Builds the payload delivered to a trace collector.
    ///
    /// Shape: `{annotations, journal?, trace: {origin, id, path, service,
    /// start, success, exec_time, status, from, exception?}}`.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        let mut trace = BTreeMap::new();
        trace.insert("origin".to_string(), Value::from(self.origin.as_str()));
        trace.insert("id".to_string(), Value::from(self.trace_id.as_str()));
        trace.insert("path".to_string(), Value::from(self.trace_path.as_str()));
        trace.insert("service".to_string(), Value::from(self.service.as_str()));
        trace.insert(
            "start".to_string(),
            Value::Int(i64::try_from(self.start).unwrap_or(i64::MAX)),
        );
        trace.insert("success".to_string(), Value::Bool(self.success));
        trace.insert("exec_time".to_string(), Value::Float(self.exec_time));
        trace.insert("status".to_string(), Value::from(u32::from(self.status)));
        trace.insert("from".to_string(), Value::from(self.from.as_str()));
        if let Some(exception) = &self.exception {
            trace.insert("exception".to_string(), Value::from(exception.as_str()));
        }

        let mut payload = BTreeMap::new();
        payload.insert("trace".to_string(), Value::Map(trace));
        payload.insert(
            "annotations".to_string(),
            Value::Map(self.annotations.clone()),
        );
        if let Some(journal) = &self.journal {
            payload.insert(
                "journal".to_string(),
                Value::map([
                    ("input", journal.input.clone()),
                    ("output", journal.output.clone()),
                ]),
            );
        }
        Value::Map(payload)
    }
}
