//! In-band RPC outcomes.
//!
//! Every call ends in exactly one [`RpcResult`]. Application failures travel as
//! `RpcResult::Error` with an [`ErrorKind`]; they are values the caller
//! inspects, never transport faults.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broker-defined classification of an RPC-level error.
///
/// The set is open: kinds this build does not know (from a newer broker or
/// peer) decode as [`ErrorKind::Unknown`] instead of failing the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorKind {
    Unknown,
    /// No handler is registered for the requested function.
    UnknownRpc,
    Io,
    InvalidArgs,
    /// The caller cancelled the call before a result was observed.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unknown => "Unknown",
            ErrorKind::UnknownRpc => "UnknownRpc",
            ErrorKind::Io => "Io",
            ErrorKind::InvalidArgs => "InvalidArgs",
            ErrorKind::Cancelled => "Cancelled",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "UnknownRpc" => ErrorKind::UnknownRpc,
            "Io" => ErrorKind::Io,
            "InvalidArgs" => ErrorKind::InvalidArgs,
            "Cancelled" => ErrorKind::Cancelled,
            _ => ErrorKind::Unknown,
        }
    }
}

impl From<String> for ErrorKind {
    fn from(name: String) -> Self {
        ErrorKind::from_name(&name)
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An RPC-level error: a kind plus free-form JSON details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub kind: ErrorKind,
    #[serde(default)]
    pub details: Value,
}

impl RpcError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            details: Value::Null,
        }
    }

    pub fn with_details(kind: ErrorKind, details: Value) -> Self {
        Self { kind, details }
    }
}

/// Handlers usually parse their args with `serde_json::from_value`; a failure
/// there is the caller's fault.
impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::with_details(ErrorKind::InvalidArgs, Value::String(err.to_string()))
    }
}

/// Terminal outcome of one RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireResult", into = "WireResult")]
pub enum RpcResult {
    Ok(Value),
    Error(RpcError),
    /// The handler declined the call; the broker tries the next one.
    NotHandled,
}

/// Wire shape: `{"ok":..}`, `{"error":{..}}` or `{"not_handled":true}`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireResult {
    Ok(Value),
    Error(RpcError),
    NotHandled(bool),
}

impl From<WireResult> for RpcResult {
    fn from(wire: WireResult) -> Self {
        match wire {
            WireResult::Ok(value) => RpcResult::Ok(value),
            WireResult::Error(err) => RpcResult::Error(err),
            WireResult::NotHandled(_) => RpcResult::NotHandled,
        }
    }
}

impl From<RpcResult> for WireResult {
    fn from(result: RpcResult) -> Self {
        match result {
            RpcResult::Ok(value) => WireResult::Ok(value),
            RpcResult::Error(err) => WireResult::Error(err),
            RpcResult::NotHandled => WireResult::NotHandled(true),
        }
    }
}

impl RpcResult {
    pub fn ok(payload: Value) -> Self {
        RpcResult::Ok(payload)
    }

    /// Serialize `value` into an `Ok` payload.
    pub fn success<T: Serialize>(value: T) -> std::result::Result<Self, serde_json::Error> {
        Ok(RpcResult::Ok(serde_json::to_value(value)?))
    }

    pub fn error(kind: ErrorKind, details: Value) -> Self {
        RpcResult::Error(RpcError::with_details(kind, details))
    }

    pub fn not_handled() -> Self {
        RpcResult::NotHandled
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RpcResult::Ok(_))
    }

    pub fn is_err(&self) -> bool {
        matches!(self, RpcResult::Error(_))
    }

    pub fn is_not_handled(&self) -> bool {
        matches!(self, RpcResult::NotHandled)
    }

    /// Whether this is the outcome of a cancelled call.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RpcResult::Error(err) if err.kind == ErrorKind::Cancelled)
    }

    /// Return the `Ok` payload.
    ///
    /// # Panics
    ///
    /// Panics if the result is not `Ok`.
    #[track_caller]
    pub fn unwrap(self) -> Value {
        match self {
            RpcResult::Ok(value) => value,
            other => panic!("called `RpcResult::unwrap()` on a non-ok value: {:?}", other),
        }
    }

    /// Return the `Error` value.
    ///
    /// # Panics
    ///
    /// Panics if the result is not `Error`.
    #[track_caller]
    pub fn unwrap_err(self) -> RpcError {
        match self {
            RpcResult::Error(err) => err,
            other => panic!(
                "called `RpcResult::unwrap_err()` on a non-error value: {:?}",
                other
            ),
        }
    }

    pub fn into_ok(self) -> Option<Value> {
        match self {
            RpcResult::Ok(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_err(self) -> Option<RpcError> {
        match self {
            RpcResult::Error(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RpcError> for RpcResult {
    fn from(err: RpcError) -> Self {
        RpcResult::Error(err)
    }
}
