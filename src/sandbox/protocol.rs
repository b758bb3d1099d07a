//! Typed messages exchanged between a sandbox worker and its host.

use serde::Serialize;
use serde_json::Value;

pub type ExecId = u64;
pub type CorrelationId = u64;

/// Host to worker.
#[derive(Debug, Clone)]
pub enum HostMessage {
    /// Evaluate `func` as the body of `(msg) => { ... }`.
    Invoke {
        exec_id: ExecId,
        func: String,
        msg: Value,
    },
    /// Answer to a side-channel request.
    Reply {
        correlation: CorrelationId,
        value: Result<Value, String>,
    },
}

/// Side-channel requests the worker may issue while a body runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RpcRequest {
    ContextGet { key: String },
    ContextSet { key: String, value: Value },
    GlobalGet { key: String },
    GlobalSet { key: String, value: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
}

/// Worker to host.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxEvent {
    Result {
        exec_id: ExecId,
        value: Value,
    },
    Error {
        exec_id: ExecId,
        message: String,
        stack: Option<String>,
    },
    /// The `initialize` script failed; the context keeps running without it.
    InitError {
        message: String,
    },
    Log {
        level: LogLevel,
        text: String,
    },
    Status(Value),
    Send(Value),
    Rpc {
        correlation: CorrelationId,
        request: RpcRequest,
    },
}

impl SandboxEvent {
    /// Events subject to rate limiting. Results, errors and RPC traffic never are.
    pub fn is_throttled(&self) -> bool {
        matches!(
            self,
            SandboxEvent::Log { .. } | SandboxEvent::Status(_) | SandboxEvent::Send(_)
        )
    }
}
