use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use rhai::{AST, Dynamic, Engine, EvalAltResult, Position, Scope};
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, trace};

use super::protocol::{HostMessage, LogLevel, RpcRequest, SandboxEvent};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    pub initialize: Option<String>,
    pub denylist: Vec<String>,
    pub rpc_timeout: Duration,
}

/// Host side of one worker thread. Dropping it aborts whatever the worker
/// is running and lets the thread exit.
pub struct WorkerHandle {
    tx: Sender<HostMessage>,
    events: UnboundedReceiver<SandboxEvent>,
    abort: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn spawn(config: WorkerConfig) -> std::io::Result<Self> {
        let (tx, inbox) = mpsc::channel();
        let (events_tx, events) = unbounded_channel();
        let abort = Arc::new(AtomicBool::new(false));
        let flag = abort.clone();
        thread::Builder::new()
            .name(format!("sandbox-{}", config.name))
            .spawn(move || run(config, inbox, events_tx, flag))?;
        Ok(Self { tx, events, abort })
    }

    pub fn post(&self, message: HostMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub async fn next_event(&mut self) -> Option<SandboxEvent> {
        self.events.recv().await
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Worker end of the side channel.
struct Channel {
    events: UnboundedSender<SandboxEvent>,
    inbox: Receiver<HostMessage>,
    next: Cell<u64>,
    rpc_timeout: Duration,
}

impl Channel {
    fn emit(&self, event: SandboxEvent) {
        let _ = self.events.send(event);
    }

    /// Blocks the script until the host answers `request` or the deadline passes.
    fn call(&self, request: RpcRequest) -> Result<Value, Box<EvalAltResult>> {
        let correlation = self.next.get() + 1;
        self.next.set(correlation);
        self.events
            .send(SandboxEvent::Rpc {
                correlation,
                request,
            })
            .map_err(|_| "sandbox host is gone")?;

        let deadline = Instant::now() + self.rpc_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inbox.recv_timeout(remaining) {
                Ok(HostMessage::Reply { correlation: id, value }) if id == correlation => {
                    return value.map_err(Into::into);
                }
                Ok(other) => trace!(?other, "discarding stale host message"),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(format!("context request timed out after {:?}", self.rpc_timeout).into());
                }
                Err(RecvTimeoutError::Disconnected) => return Err("sandbox host is gone".into()),
            }
        }
    }
}

fn to_json(value: &Dynamic) -> Result<Value, Box<EvalAltResult>> {
    rhai::serde::from_dynamic::<Value>(value)
}

fn to_script(value: &Value) -> Result<Dynamic, Box<EvalAltResult>> {
    rhai::serde::to_dynamic(value)
}

fn build_engine(config: &WorkerConfig, channel: &Rc<Channel>, abort: &Arc<AtomicBool>) -> Engine {
    let mut engine = Engine::new();
    for symbol in &config.denylist {
        engine.disable_symbol(symbol.as_str());
    }

    let flag = abort.clone();
    engine.on_progress(move |_ops| {
        if flag.load(Ordering::Relaxed) {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    let ch = channel.clone();
    engine.on_print(move |text| {
        ch.emit(SandboxEvent::Log {
            level: LogLevel::Info,
            text: text.to_string(),
        })
    });
    let ch = channel.clone();
    engine.on_debug(move |text, _source, _pos| {
        ch.emit(SandboxEvent::Log {
            level: LogLevel::Info,
            text: text.to_string(),
        })
    });

    let ch = channel.clone();
    engine.register_fn("node_log", move |text: &str| {
        ch.emit(SandboxEvent::Log {
            level: LogLevel::Info,
            text: text.to_string(),
        })
    });
    let ch = channel.clone();
    engine.register_fn("node_warn", move |text: &str| {
        ch.emit(SandboxEvent::Log {
            level: LogLevel::Warn,
            text: text.to_string(),
        })
    });
    let ch = channel.clone();
    engine.register_fn("node_status", move |status: Dynamic| -> Result<(), Box<EvalAltResult>> {
        ch.emit(SandboxEvent::Status(to_json(&status)?));
        Ok(())
    });
    let ch = channel.clone();
    engine.register_fn("node_send", move |msg: Dynamic| -> Result<(), Box<EvalAltResult>> {
        ch.emit(SandboxEvent::Send(to_json(&msg)?));
        Ok(())
    });

    let ch = channel.clone();
    engine.register_fn("context_get", move |key: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        to_script(&ch.call(RpcRequest::ContextGet { key: key.to_string() })?)
    });
    let ch = channel.clone();
    engine.register_fn("context_set", move |key: &str, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
        let value = to_json(&value)?;
        ch.call(RpcRequest::ContextSet { key: key.to_string(), value })?;
        Ok(())
    });
    let ch = channel.clone();
    engine.register_fn("global_get", move |key: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        to_script(&ch.call(RpcRequest::GlobalGet { key: key.to_string() })?)
    });
    let ch = channel.clone();
    engine.register_fn("global_set", move |key: &str, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
        let value = to_json(&value)?;
        ch.call(RpcRequest::GlobalSet { key: key.to_string(), value })?;
        Ok(())
    });

    engine
}

fn stack_of(pos: Position) -> Option<String> {
    (!pos.is_none()).then(|| format!("at {pos}"))
}

enum Failure {
    Aborted,
    Script { message: String, stack: Option<String> },
}

impl From<Box<EvalAltResult>> for Failure {
    fn from(err: Box<EvalAltResult>) -> Self {
        match *err {
            EvalAltResult::ErrorTerminated(..) => Failure::Aborted,
            ref other => Failure::Script {
                message: other.to_string(),
                stack: stack_of(other.position()),
            },
        }
    }
}

fn evaluate(
    engine: &Engine,
    scope: &mut Scope<'static>,
    cache: &mut Option<(String, AST)>,
    func: String,
    msg: &Value,
) -> Result<Value, Failure> {
    let entry = match cache.take() {
        Some((source, ast)) if source == func => (source, ast),
        _ => {
            let ast = engine.compile(&func).map_err(|err| Failure::Script {
                message: err.to_string(),
                stack: stack_of(err.position()),
            })?;
            (func, ast)
        }
    };
    let (_, ast) = cache.insert(entry);
    let ast = &*ast;

    // Body locals are discarded after each run; `initialize` locals stay.
    let mark = scope.len();
    scope.push_dynamic("msg", to_script(msg)?);
    let result = engine.eval_ast_with_scope::<Dynamic>(scope, ast);
    scope.rewind(mark);
    Ok(to_json(&result?)?)
}

fn run(
    config: WorkerConfig,
    inbox: Receiver<HostMessage>,
    events: UnboundedSender<SandboxEvent>,
    abort: Arc<AtomicBool>,
) {
    let channel = Rc::new(Channel {
        events,
        inbox,
        next: Cell::new(0),
        rpc_timeout: config.rpc_timeout,
    });
    let engine = build_engine(&config, &channel, &abort);
    let mut scope = Scope::new();

    if let Some(init) = config.initialize.as_deref().filter(|s| !s.trim().is_empty()) {
        if let Err(err) = engine.run_with_scope(&mut scope, init) {
            match Failure::from(err) {
                Failure::Aborted => return,
                Failure::Script { message, .. } => channel.emit(SandboxEvent::InitError { message }),
            }
        }
    }

    let mut cache = None;
    debug!(sandbox = %config.name, "sandbox worker ready");
    while let Ok(message) = channel.inbox.recv() {
        let HostMessage::Invoke { exec_id, func, msg } = message else {
            continue;
        };
        let event = match evaluate(&engine, &mut scope, &mut cache, func, &msg) {
            Ok(value) => SandboxEvent::Result { exec_id, value },
            Err(Failure::Aborted) => break,
            Err(Failure::Script { message, stack }) => SandboxEvent::Error {
                exec_id,
                message,
                stack,
            },
        };
        if channel.events.send(event).is_err() || abort.load(Ordering::SeqCst) {
            break;
        }
    }
    debug!(sandbox = %config.name, "sandbox worker exiting");
}
