//! Task payload descriptor, shared between job registration and every
//! dispatch sink.
//!
//! The scheduler stores payloads as opaque bytes. `TaskPayload` is the
//! encoding the bundled tooling uses: a dotted callable reference plus typed
//! positional and keyword arguments, serialized as JSON.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

/// A single typed argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Datetime(DateTime<Utc>),
}

impl ArgValue {
    /// Parse a CLI-style typed literal: `int:5`, `bool:true`,
    /// `datetime:2024-01-01T00:00:00Z`, `str:text`. Untagged input is a string.
    pub fn parse_typed(raw: &str) -> Result<Self> {
        let Some((tag, value)) = raw.split_once(':') else {
            return Ok(ArgValue::Str(raw.to_string()));
        };
        match tag {
            "str" => Ok(ArgValue::Str(value.to_string())),
            "int" => value
                .parse::<i64>()
                .map(ArgValue::Int)
                .map_err(|e| CadenceError::InvalidPayload(format!("bad int {value:?}: {e}"))),
            "bool" => value
                .parse::<bool>()
                .map(ArgValue::Bool)
                .map_err(|e| CadenceError::InvalidPayload(format!("bad bool {value:?}: {e}"))),
            "datetime" => DateTime::parse_from_rfc3339(value)
                .map(|dt| ArgValue::Datetime(dt.with_timezone(&Utc)))
                .map_err(|e| CadenceError::InvalidPayload(format!("bad datetime {value:?}: {e}"))),
            // "http://..." and friends are plain strings
            _ => Ok(ArgValue::Str(raw.to_string())),
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Str(s) => write!(f, "{s:?}"),
            ArgValue::Int(i) => write!(f, "{i}"),
            ArgValue::Bool(b) => write!(f, "{b}"),
            ArgValue::Datetime(dt) => write!(f, "{}", dt.to_rfc3339()),
        }
    }
}

/// What the worker side should run when an occurrence is enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Dotted path of the function to invoke, e.g. `reports.daily.build`.
    pub callable: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kwargs: BTreeMap<String, ArgValue>,
    /// Target queue on the worker side.
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Hard limit for one execution, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// How long the worker keeps the result; -1 keeps it forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ttl_secs: Option<i64>,
    /// Enqueue ahead of already-waiting tasks.
    #[serde(default)]
    pub at_front: bool,
}

fn default_queue() -> String {
    "default".to_string()
}

impl TaskPayload {
    pub fn new(callable: impl Into<String>) -> Self {
        Self {
            callable: callable.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            queue: default_queue(),
            timeout_secs: None,
            result_ttl_secs: None,
            at_front: false,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_arg(mut self, value: ArgValue) -> Self {
        self.args.push(value);
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: ArgValue) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Check the callable is a dotted identifier path and the queue is named.
    pub fn validate(&self) -> Result<()> {
        let well_formed = !self.callable.is_empty()
            && self.callable.split('.').all(|segment| {
                let mut chars = segment.chars();
                matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
        if !well_formed {
            return Err(CadenceError::InvalidPayload(format!(
                "callable is not a dotted path: {:?}",
                self.callable
            )));
        }
        if self.queue.trim().is_empty() {
            return Err(CadenceError::InvalidPayload("queue must not be empty".into()));
        }
        if let Some(key) = self.kwargs.keys().find(|k| k.is_empty()) {
            return Err(CadenceError::InvalidPayload(format!("empty kwarg key: {key:?}")));
        }
        if let Some(ttl) = self.result_ttl_secs {
            if ttl < -1 {
                return Err(CadenceError::InvalidPayload(format!(
                    "result TTL must be -1 or non-negative, got {ttl}"
                )));
            }
        }
        Ok(())
    }

    /// A task repeated every `period_secs` must keep its result at least
    /// until the next run, or forever (-1).
    pub fn check_result_ttl(&self, period_secs: u64) -> Result<()> {
        match self.result_ttl_secs {
            Some(ttl) if ttl != -1 && u64::try_from(ttl).map_or(true, |ttl| ttl < period_secs) => {
                Err(CadenceError::InvalidPayload(format!(
                    "result TTL of {ttl}s is shorter than the {period_secs}s interval; use -1 or at least the interval"
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Human-readable call rendering for logs: `callable(a, b, key=value)`.
    pub fn function_string(&self) -> String {
        let rendered: Vec<String> = self
            .args
            .iter()
            .map(ToString::to_string)
            .chain(self.kwargs.iter().map(|(k, v)| format!("{k}={v}")))
            .collect();
        format!("{}({})", self.callable, rendered.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn function_string_renders_args_then_kwargs() {
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let payload = TaskPayload::new("reports.daily.build")
            .with_arg(ArgValue::Str("one".into()))
            .with_arg(ArgValue::Int(1))
            .with_arg(ArgValue::Datetime(date))
            .with_arg(ArgValue::Bool(true))
            .with_kwarg("key2", ArgValue::Int(2))
            .with_kwarg("key1", ArgValue::Str("one".into()));
        assert_eq!(
            payload.function_string(),
            "reports.daily.build(\"one\", 1, 2024-01-01T12:00:00+00:00, true, key1=\"one\", key2=2)"
        );
    }

    #[test]
    fn function_string_without_arguments() {
        assert_eq!(TaskPayload::new("jobs.ping").function_string(), "jobs.ping()");
    }

    #[test]
    fn bytes_decode_back_to_same_payload() {
        let payload = TaskPayload::new("jobs.sync")
            .with_queue("high")
            .with_kwarg("dry_run", ArgValue::Bool(false));
        let decoded = TaskPayload::from_bytes(&payload.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn minimal_json_fills_defaults() {
        let decoded = TaskPayload::from_bytes(br#"{"callable":"jobs.ping"}"#).unwrap();
        assert_eq!(decoded.queue, "default");
        assert!(decoded.args.is_empty());
        assert!(!decoded.at_front);
    }

    #[test]
    fn validate_rejects_non_dotted_callable() {
        assert!(TaskPayload::new("jobs.ping").validate().is_ok());
        assert!(TaskPayload::new("").validate().is_err());
        assert!(TaskPayload::new("jobs..ping").validate().is_err());
        assert!(TaskPayload::new("I am a teapot").validate().is_err());
        assert!(TaskPayload::new("9lives.run").validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_queue() {
        let payload = TaskPayload::new("jobs.ping").with_queue(" ");
        assert!(payload.validate().is_err());
    }

    #[test]
    fn result_ttl_must_cover_the_interval() {
        let mut payload = TaskPayload::new("jobs.ping");
        assert!(payload.check_result_ttl(3_600).is_ok());

        payload.result_ttl_secs = Some(3_599);
        assert!(matches!(
            payload.check_result_ttl(3_600),
            Err(CadenceError::InvalidPayload(_))
        ));

        payload.result_ttl_secs = Some(3_600);
        assert!(payload.check_result_ttl(3_600).is_ok());

        payload.result_ttl_secs = Some(-1);
        assert!(payload.check_result_ttl(3_600).is_ok());
        assert!(payload.validate().is_ok());

        payload.result_ttl_secs = Some(-2);
        assert!(payload.validate().is_err());
    }

    #[test]
    fn parse_typed_literals() {
        assert_eq!(ArgValue::parse_typed("int:5").unwrap(), ArgValue::Int(5));
        assert_eq!(ArgValue::parse_typed("bool:true").unwrap(), ArgValue::Bool(true));
        assert_eq!(ArgValue::parse_typed("plain").unwrap(), ArgValue::Str("plain".into()));
        assert_eq!(
            ArgValue::parse_typed("http://example.com").unwrap(),
            ArgValue::Str("http://example.com".into())
        );
        assert!(ArgValue::parse_typed("int:five").is_err());
        assert!(matches!(
            ArgValue::parse_typed("datetime:2024-01-01T00:00:00Z").unwrap(),
            ArgValue::Datetime(_)
        ));
    }
}
