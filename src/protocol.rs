//! The host↔worker wire protocol.
//!
//! Messages are JSON objects tagged by `type`. Every host-originated
//! request carries a fresh UUID; worker-originated `api_call` ids are
//! worker-local strings. Errors cross the boundary as
//! `{message, name?, code?, stack?}` with `name` and `code` preserved so
//! extensions can catch `PermissionError` by name.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Serialized error, identical in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl WireError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: None,
            code: None,
            stack: None,
        }
    }
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        Self {
            message: err.to_string(),
            name: Some(err.name().to_string()),
            code: err.code().map(ToString::to_string),
            stack: match err {
                Error::Extension { stack, .. } => stack.clone(),
                _ => None,
            },
        }
    }
}

impl From<WireError> for Error {
    /// Revive a worker-side error, preserving its `name`/`code` verbatim.
    fn from(wire: WireError) -> Self {
        match wire.code.as_deref() {
            Some(crate::error::CODE_TIMEOUT) => Self::Timeout {
                message: wire.message,
            },
            Some(crate::error::CODE_WORKER_TERMINATED) => Self::WorkerTerminated {
                message: wire.message,
            },
            _ => Self::Extension {
                message: wire.message,
                name: wire.name,
                code: wire.code,
                stack: wire.stack,
            },
        }
    }
}

/// Messages sent by the host into a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostToWorker {
    Activate {
        id: String,
        context: Value,
    },
    ExecuteCommand {
        id: String,
        command: String,
        args: Vec<Value>,
    },
    InvokeCustomFunction {
        id: String,
        name: String,
        args: Vec<Value>,
    },
    InvokeDataConnector {
        id: String,
        connector: String,
        method: String,
        args: Vec<Value>,
    },
    ApiResult {
        id: String,
        result: Value,
    },
    ApiError {
        id: String,
        error: WireError,
    },
    Event {
        name: String,
        payload: Value,
    },
    PanelMessage {
        panel_id: String,
        message: Value,
    },
}

/// Messages sent by a worker to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerToHost {
    ActivateResult {
        id: String,
    },
    ActivateError {
        id: String,
        error: WireError,
    },
    CommandResult {
        id: String,
        result: Value,
    },
    CommandError {
        id: String,
        error: WireError,
    },
    CustomFunctionResult {
        id: String,
        result: Value,
    },
    CustomFunctionError {
        id: String,
        error: WireError,
    },
    DataConnectorResult {
        id: String,
        result: Value,
    },
    DataConnectorError {
        id: String,
        error: WireError,
    },
    ApiCall {
        id: String,
        namespace: String,
        method: String,
        args: Vec<Value>,
    },
    Log {
        level: String,
        message: String,
    },
    Audit {
        event: Value,
    },
}

impl WorkerToHost {
    /// The pending-request id this message fulfils, if it is a reply.
    #[must_use]
    pub fn reply_id(&self) -> Option<&str> {
        match self {
            Self::ActivateResult { id }
            | Self::ActivateError { id, .. }
            | Self::CommandResult { id, .. }
            | Self::CommandError { id, .. }
            | Self::CustomFunctionResult { id, .. }
            | Self::CustomFunctionError { id, .. }
            | Self::DataConnectorResult { id, .. }
            | Self::DataConnectorError { id, .. } => Some(id),
            Self::ApiCall { .. } | Self::Log { .. } | Self::Audit { .. } => None,
        }
    }

    /// Reply payload: `Ok(result)` or the revived error.
    #[must_use]
    pub fn reply_outcome(self) -> Option<Result<Value, WireError>> {
        match self {
            Self::ActivateResult { .. } => Some(Ok(Value::Null)),
            Self::CommandResult { result, .. }
            | Self::CustomFunctionResult { result, .. }
            | Self::DataConnectorResult { result, .. } => Some(Ok(result)),
            Self::ActivateError { error, .. }
            | Self::CommandError { error, .. }
            | Self::CustomFunctionError { error, .. }
            | Self::DataConnectorError { error, .. } => Some(Err(error)),
            Self::ApiCall { .. } | Self::Log { .. } | Self::Audit { .. } => None,
        }
    }
}

/// Fresh request id for host-originated messages.
#[must_use]
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn message_types_use_snake_case_tags() {
        let msg = HostToWorker::ExecuteCommand {
            id: "r1".to_string(),
            command: "t.x.a".to_string(),
            args: vec![json!(1)],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "execute_command");

        let reply = WorkerToHost::CustomFunctionResult {
            id: "r2".to_string(),
            result: json!(42),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["type"], "custom_function_result");
    }

    #[test]
    fn wire_error_round_trips_name_and_code() {
        let err = Error::permission("Permission denied: network (blocked.example)");
        let wire = WireError::from(&err);
        assert_eq!(wire.name.as_deref(), Some("PermissionError"));

        let revived = Error::from(wire);
        assert_eq!(revived.name(), "PermissionError");
        assert_eq!(
            revived.to_string(),
            "Permission denied: network (blocked.example)"
        );
    }

    #[test]
    fn timeout_code_revives_as_timeout() {
        let err = Error::timeout("command", "t.x", 100);
        let revived = Error::from(WireError::from(&err));
        assert_eq!(revived.code(), Some(crate::error::CODE_TIMEOUT));
        assert_eq!(revived.name(), "ExtensionTimeoutError");
    }

    #[test]
    fn extension_error_keeps_custom_fields() {
        let wire = WireError {
            message: "boom".to_string(),
            name: Some("MyError".to_string()),
            code: Some("E_MINE".to_string()),
            stack: Some("at boom (e.js:3)".to_string()),
        };
        let revived = Error::from(wire.clone());
        assert_eq!(revived.name(), "MyError");
        assert_eq!(revived.code(), Some("E_MINE"));
        assert_eq!(WireError::from(&revived), wire);
    }

    #[test]
    fn reply_ids_cover_all_reply_variants() {
        let reply = WorkerToHost::ActivateError {
            id: "r9".to_string(),
            error: WireError::new("nope"),
        };
        assert_eq!(reply.reply_id(), Some("r9"));
        assert!(reply.reply_outcome().unwrap().is_err());

        let call = WorkerToHost::ApiCall {
            id: "c1".to_string(),
            namespace: "cells".to_string(),
            method: "getRange".to_string(),
            args: vec![],
        };
        assert_eq!(call.reply_id(), None);
    }
}
