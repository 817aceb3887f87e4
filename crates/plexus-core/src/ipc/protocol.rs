//! Envelope types exchanged between participants and the broker.
//!
//! Every envelope is one JSON object tagged by `"type"` and correlated by its
//! `"context"` id.
//!
//! ```text
//! {"type":"call","context":"<id>","function":"<name>","args":{..},"depth":0}
//! {"type":"update","context":"<id>","value":<json>}
//! {"type":"result","context":"<id>","result":{"ok":<json>}}
//! {"type":"register","context":"<id>","function":"<name>","priority":100,"handler":1}
//! {"type":"cancel","context":"<id>"}
//! ```

use crate::rpc::RpcResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifies one handler registration within a connection.
pub type HandlerId = u64;

/// Generate a fresh correlation id.
pub fn new_context_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Call(Call),
    Update(Update),
    Result(Response),
    Register(Register),
    Cancel(Cancel),
}

impl Envelope {
    pub fn context(&self) -> &str {
        match self {
            Envelope::Call(call) => &call.context,
            Envelope::Update(update) => &update.context,
            Envelope::Result(response) => &response.context,
            Envelope::Register(register) => &register.context,
            Envelope::Cancel(cancel) => &cancel.context,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Call(_) => "call",
            Envelope::Update(_) => "update",
            Envelope::Result(_) => "result",
            Envelope::Register(_) => "register",
            Envelope::Cancel(_) => "cancel",
        }
    }

    pub fn result(context: impl Into<String>, result: RpcResult) -> Self {
        Envelope::Result(Response {
            context: context.into(),
            result,
        })
    }

    pub fn cancel(context: impl Into<String>) -> Self {
        Envelope::Cancel(Cancel {
            context: context.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub context: String,
    pub function: String,
    #[serde(default)]
    pub args: Value,
    /// Nesting depth: 0 for top-level calls, parent depth + 1 for nested ones.
    #[serde(default)]
    pub depth: u32,
    /// Set by the broker when routing to a callee.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<HandlerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub context: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub context: String,
    pub result: RpcResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub context: String,
    pub function: String,
    pub priority: u16,
    pub handler: HandlerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancel {
    pub context: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_envelope_shape() {
        let env = Envelope::Call(Call {
            context: "c1".into(),
            function: "math.add".into(),
            args: json!({"a": 2, "b": 3}),
            depth: 0,
            handler: None,
        });
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "call",
                "context": "c1",
                "function": "math.add",
                "args": {"a": 2, "b": 3},
                "depth": 0
            })
        );
    }

    #[test]
    fn test_call_without_depth_defaults_to_zero() {
        let env: Envelope = serde_json::from_value(json!({
            "type": "call",
            "context": "c1",
            "function": "f",
            "args": {}
        }))
        .unwrap();
        match env {
            Envelope::Call(call) => {
                assert_eq!(call.depth, 0);
                assert_eq!(call.handler, None);
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_result_envelope_shape() {
        let env = Envelope::result("c9", RpcResult::not_handled());
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({"type": "result", "context": "c9", "result": {"not_handled": true}})
        );
        assert_eq!(env.context(), "c9");
        assert_eq!(env.kind(), "result");
    }

    #[test]
    fn test_register_envelope_parses() {
        let env: Envelope = serde_json::from_value(json!({
            "type": "register",
            "context": "r1",
            "function": "buffer.open",
            "priority": 65535,
            "handler": 7
        }))
        .unwrap();
        assert_eq!(
            env,
            Envelope::Register(Register {
                context: "r1".into(),
                function: "buffer.open".into(),
                priority: u16::MAX,
                handler: 7,
            })
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let parsed = serde_json::from_value::<Envelope>(json!({"type": "ping", "context": "x"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_context_ids_are_unique() {
        assert_ne!(new_context_id(), new_context_id());
    }
}
