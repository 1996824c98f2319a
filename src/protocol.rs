use serde::{Deserialize, Serialize};

use crate::engine::{CaptureParams, SaveOptions};

pub const WORKER_MODE_ARG: &str = "worker";

#[cfg(target_family = "unix")]
pub const CMD_READ_FD_ENV: &str = "PAGEDRIVER_CMD_READ_FD";
#[cfg(target_family = "unix")]
pub const CMD_WRITE_FD_ENV: &str = "PAGEDRIVER_CMD_WRITE_FD";
#[cfg(target_family = "unix")]
pub const INTERCEPT_READ_FD_ENV: &str = "PAGEDRIVER_INTERCEPT_READ_FD";
#[cfg(target_family = "unix")]
pub const INTERCEPT_WRITE_FD_ENV: &str = "PAGEDRIVER_INTERCEPT_WRITE_FD";

/// A JSON-able result value. `run_script` results, and every non-pixel reply
/// value, round-trip through this type exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

/// The closed set of operations the controller can issue. Dispatch is a
/// `match` on this enum; the worker never resolves operation names at
/// runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Navigate {
        url: String,
    },
    Wait {
        ms: u64,
    },
    Download {
        url: String,
        filename: Option<String>,
        progress: bool,
    },
    RunScript {
        code: String,
    },
    LastScriptError,
    Capture {
        params: CaptureParams,
    },
    SaveCapture {
        path: String,
        options: SaveOptions,
    },
    Resize {
        width: i32,
        height: i32,
    },
    ContentSize,
    Scroll {
        x: i32,
        y: i32,
    },
    SetDevtools {
        enabled: bool,
    },
    SetInterceptor {
        enabled: bool,
    },
    Quit,
}

impl Command {
    /// Operation name as it appears in traces.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Navigate { .. } => "navigate",
            Command::Wait { .. } => "wait",
            Command::Download { .. } => "download",
            Command::RunScript { .. } => "run_script",
            Command::LastScriptError => "last_script_error",
            Command::Capture { .. } => "capture",
            Command::SaveCapture { .. } => "save_capture",
            Command::Resize { .. } => "resize",
            Command::ContentSize => "content_size",
            Command::Scroll { .. } => "scroll",
            Command::SetDevtools { .. } => "set_devtools",
            Command::SetInterceptor { .. } => "set_interceptor",
            Command::Quit => "quit",
        }
    }
}

/// One reply per command, in order. Pixel bytes travel in the frame's binary
/// payload segment, never inside the JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Value {
        value: Value,
    },
    Pixels {
        width: i32,
        height: i32,
        stride: i32,
        format: i32,
    },
    Err {
        error: EngineError,
    },
}

/// Portable failure descriptor. Both processes agree on this enumeration at
/// compile time; no error is ever reconstructed by name lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineError {
    /// A script raised or the page reported a javascript error.
    Script { message: String },
    /// A download was interrupted or rejected.
    Download { message: String },
    /// An operation argument the engine cannot accept.
    InvalidArgument { message: String },
    /// Any other engine-side failure, including panics caught in dispatch.
    Failure { message: String },
}

impl EngineError {
    pub fn message(&self) -> &str {
        match self {
            EngineError::Script { message }
            | EngineError::Download { message }
            | EngineError::InvalidArgument { message }
            | EngineError::Failure { message } => message,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Script { message } => write!(f, "script error: {message}"),
            EngineError::Download { message } => write!(f, "download error: {message}"),
            EngineError::InvalidArgument { message } => write!(f, "invalid argument: {message}"),
            EngineError::Failure { message } => write!(f, "engine failure: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Worker -> controller on the interceptor channel. An empty url is the
/// shutdown sentinel: the listener closes its ends and exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptQuery {
    pub url: String,
}

impl InterceptQuery {
    pub fn sentinel() -> Self {
        Self { url: String::new() }
    }

    pub fn is_sentinel(&self) -> bool {
        self.url.is_empty()
    }
}

/// Controller -> worker verdict: `true` lets the resource load, `false`
/// blocks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptVerdict {
    pub allow: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tags_are_snake_case() {
        let json = serde_json::to_string(&Command::Navigate {
            url: "http://example.test".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"op":"navigate","url":"http://example.test"}"#);

        let json = serde_json::to_string(&Command::LastScriptError).unwrap();
        assert_eq!(json, r#"{"op":"last_script_error"}"#);
    }

    #[test]
    fn value_round_trips_exactly() {
        let value = Value::List(vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(-42),
            Value::Int(i64::MAX),
            Value::Float(2.5),
            Value::Str("héllo".to_string()),
            Value::List(vec![Value::Int(1), Value::List(vec![Value::Int(2)])]),
        ]);
        let json = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn error_descriptor_keeps_kind_and_payload() {
        let error = EngineError::Download {
            message: "connection reset".to_string(),
        };
        let json = serde_json::to_string(&error).unwrap();
        let back: EngineError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, error);
        assert!(json.contains(r#""kind":"download""#));
    }

    #[test]
    fn sentinel_is_the_empty_url() {
        assert!(InterceptQuery::sentinel().is_sentinel());
        assert!(
            !InterceptQuery {
                url: "http://x/app.js".to_string()
            }
            .is_sentinel()
        );
    }
}
