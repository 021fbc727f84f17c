//! Store error classification.
//!
//! Some store rejections mean "nothing to show yet" rather than "something
//! is broken": querying a pattern before any index exists, or aggregating a
//! field whose mapping cannot be used. Those become [`EmptyState`]s, which
//! the engine turns into empty results instead of errors.

use std::sync::OnceLock;

use otq_core::OtqError;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmptyState {
    UnknownIndex { index: String },
    UnsupportedField { field: String, field_type: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Genuine,
    EmptyState(EmptyState),
}

impl Classification {
    pub fn is_empty_state(&self) -> bool {
        matches!(self, Self::EmptyState(_))
    }
}

fn unknown_index_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Unknown index \[([^\]]+)\]").ok())
        .as_ref()
}

fn unsupported_field_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Cannot use field \[([^\]]+)\] with unsupported type \[([^\]]+)\]").ok()
    })
    .as_ref()
}

/// Only store rejections can be empty states; transport failures, timeouts
/// and decode errors are always genuine.
pub fn classify(err: &OtqError) -> Classification {
    match err {
        OtqError::Backend { body, .. } => classify_body(body),
        _ => Classification::Genuine,
    }
}

/// Classify a raw error body. Structured reasons are searched first (the
/// top-level reason, its cause chain and every root cause), then the raw
/// text.
pub fn classify_body(body: &str) -> Classification {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        let error = parsed.get("error").unwrap_or(&parsed);

        if error.get("type").and_then(Value::as_str) == Some("index_not_found_exception")
            && let Some(index) = error
                .get("index")
                .or_else(|| error.get("resource.id"))
                .and_then(Value::as_str)
        {
            return Classification::EmptyState(EmptyState::UnknownIndex {
                index: index.to_string(),
            });
        }

        for reason in reasons(error) {
            if let Some(state) = match_reason(reason) {
                return Classification::EmptyState(state);
            }
        }
    }

    match match_reason(body) {
        Some(state) => Classification::EmptyState(state),
        None => Classification::Genuine,
    }
}

fn reasons(error: &Value) -> Vec<&str> {
    let mut out = Vec::new();
    let mut current = Some(error);
    while let Some(node) = current {
        if let Some(reason) = node.get("reason").and_then(Value::as_str) {
            out.push(reason);
        }
        current = node.get("caused_by");
    }
    if let Some(root_causes) = error.get("root_cause").and_then(Value::as_array) {
        out.extend(
            root_causes
                .iter()
                .filter_map(|cause| cause.get("reason").and_then(Value::as_str)),
        );
    }
    out
}

fn match_reason(reason: &str) -> Option<EmptyState> {
    if let Some(caps) = unknown_index_re().and_then(|re| re.captures(reason)) {
        return Some(EmptyState::UnknownIndex {
            index: caps[1].to_string(),
        });
    }
    unsupported_field_re()
        .and_then(|re| re.captures(reason))
        .map(|caps| EmptyState::UnsupportedField {
            field: caps[1].to_string(),
            field_type: caps[2].to_string(),
        })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn backend(body: Value) -> OtqError {
        OtqError::Backend {
            status: 400,
            body: body.to_string(),
        }
    }

    #[test]
    fn unknown_index_in_top_level_reason() {
        let err = backend(json!({
            "error": {
                "type": "verification_exception",
                "reason": "Found 1 problem\nline 1:6: Unknown index [logs-*]"
            },
            "status": 400
        }));
        assert_eq!(
            classify(&err),
            Classification::EmptyState(EmptyState::UnknownIndex {
                index: "logs-*".to_string()
            })
        );
    }

    #[test]
    fn unsupported_field_in_root_cause() {
        let err = backend(json!({
            "error": {
                "type": "search_phase_execution_exception",
                "reason": "all shards failed",
                "root_cause": [
                    {"type": "query_shard_exception", "reason": "failed to create query"},
                    {
                        "type": "illegal_argument_exception",
                        "reason":
                            "Cannot use field [metrics.latency] with unsupported type [histogram]"
                    }
                ]
            }
        }));
        assert_eq!(
            classify(&err),
            Classification::EmptyState(EmptyState::UnsupportedField {
                field: "metrics.latency".to_string(),
                field_type: "histogram".to_string()
            })
        );
    }

    #[test]
    fn index_not_found_exception_is_an_empty_state() {
        let err = backend(json!({
            "error": {
                "type": "index_not_found_exception",
                "reason": "no such index [traces-apm]",
                "index": "traces-apm"
            }
        }));
        assert!(classify(&err).is_empty_state());
    }

    #[test]
    fn raw_body_is_a_last_resort() {
        let state = classify_body("proxy said: Unknown index [metrics-otel]");
        assert_eq!(
            state,
            Classification::EmptyState(EmptyState::UnknownIndex {
                index: "metrics-otel".to_string()
            })
        );
    }

    #[test]
    fn other_failures_are_genuine() {
        let parse_error = backend(json!({
            "error": {"type": "parsing_exception", "reason": "line 1:1: mismatched input"}
        }));
        assert_eq!(classify(&parse_error), Classification::Genuine);
        assert_eq!(
            classify(&OtqError::Transport("connection refused".into())),
            Classification::Genuine
        );
        assert_eq!(
            classify(&OtqError::Timeout("10s".into())),
            Classification::Genuine
        );
    }
}
