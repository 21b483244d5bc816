//! Hub-initiated remote procedure calls.
//!
//! Applications register plain functions by name. Calls arriving from the hub
//! are executed one at a time on the blocking pool, so a slow or stuck
//! handler delays only later calls, never the heartbeat or the read loop.

use adm_wire::{Envelope, RpcCall};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Error text sent for calls to unregistered functions
pub const NOT_FOUND: &str = "not found";

/// Signature of a callable function
pub type RpcFn = dyn Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync;

/// Functions the hub may call, by name
#[derive(Clone, Default)]
pub struct RpcTable {
    handlers: HashMap<String, Arc<RpcFn>>,
}

impl RpcTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous entry
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Look up a handler
    pub fn get(&self, name: &str) -> Option<Arc<RpcFn>> {
        self.handlers.get(name).cloned()
    }

    /// Number of registered functions
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no functions are registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for RpcTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Executes calls against an [`RpcTable`]
#[derive(Debug, Clone)]
pub struct RpcDispatcher {
    table: RpcTable,
}

impl RpcDispatcher {
    /// Dispatch against `table`
    pub fn new(table: RpcTable) -> Self {
        Self { table }
    }

    /// Run one call and build the result envelope.
    ///
    /// Returns `None` when the hub asked for no reply. Unknown functions are
    /// always answered.
    pub async fn handle_call(&self, call: RpcCall) -> Option<Envelope> {
        let RpcCall {
            call_id,
            method,
            args,
            want_reply,
        } = call;

        let Some(handler) = self.table.get(&method) else {
            warn!("Call {} to unknown function '{}'", call_id, method);
            return Some(Envelope::rpc_result(call_id, Err(NOT_FOUND.to_string())));
        };

        debug!("Calling '{}' (id {}) with {} args", method, call_id, args.len());
        let outcome = match tokio::task::spawn_blocking(move || handler(args)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("Function '{}' failed: {}", method, e);
                Err(e.to_string())
            }
            Err(join) if join.is_panic() => {
                warn!("Function '{}' panicked", method);
                Err("handler panicked".to_string())
            }
            Err(join) => Err(join.to_string()),
        };

        want_reply.then(|| Envelope::rpc_result(call_id, outcome))
    }
}

/// Serve calls for one connection until the channel closes
pub async fn run_worker(
    dispatcher: RpcDispatcher,
    mut rx: mpsc::Receiver<RpcCall>,
    out: mpsc::Sender<Envelope>,
) {
    while let Some(call) = rx.recv().await {
        if let Some(reply) = dispatcher.handle_call(call).await {
            if out.send(reply).await.is_err() {
                debug!("Writer gone, RPC worker exiting");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adm_wire::CallId;
    use serde_json::json;

    fn table() -> RpcTable {
        let mut table = RpcTable::new();
        table
            .register("double", |args| {
                let x = args
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| anyhow::anyhow!("expected a number"))?;
                Ok(json!(x * 2))
            })
            .register("explode", |_| panic!("boom"));
        table
    }

    fn call(id: &str, method: &str, args: Vec<Value>, want_reply: bool) -> RpcCall {
        RpcCall {
            call_id: CallId::from(id),
            method: method.into(),
            args,
            want_reply,
        }
    }

    #[tokio::test]
    async fn test_double() {
        let dispatcher = RpcDispatcher::new(table());
        let reply = dispatcher
            .handle_call(call("1", "double", vec![json!(21)], true))
            .await
            .unwrap();
        assert_eq!(reply, Envelope::rpc_result(CallId::from("1"), Ok(json!(42))));
        assert_eq!(
            reply.to_wire(),
            json!({ "cmd": "RETN", "id": "1", "res": 42 })
        );
    }

    #[tokio::test]
    async fn test_missing_function() {
        let dispatcher = RpcDispatcher::new(table());
        let reply = dispatcher
            .handle_call(call("7", "missing", vec![], false))
            .await
            .unwrap();
        assert_eq!(reply.call_id, Some(CallId::from("7")));
        assert_eq!(reply.field("error"), Some(&json!("not found")));
    }

    #[tokio::test]
    async fn test_failures_become_results() {
        let dispatcher = RpcDispatcher::new(table());

        let reply = dispatcher
            .handle_call(call("2", "double", vec![json!("x")], true))
            .await
            .unwrap();
        assert_eq!(reply.field("error"), Some(&json!("expected a number")));

        let reply = dispatcher
            .handle_call(call("3", "explode", vec![], true))
            .await
            .unwrap();
        assert_eq!(reply.field("error"), Some(&json!("handler panicked")));
    }

    #[tokio::test]
    async fn test_no_reply_requested() {
        let dispatcher = RpcDispatcher::new(table());
        assert!(dispatcher
            .handle_call(call("4", "double", vec![json!(1)], false))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_worker_preserves_ids() {
        let (tx, rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let worker = tokio::spawn(run_worker(RpcDispatcher::new(table()), rx, out_tx));

        tx.send(call("a", "double", vec![json!(2)], true)).await.unwrap();
        tx.send(call("b", "double", vec![json!(3)], true)).await.unwrap();
        drop(tx);

        let first = out_rx.recv().await.unwrap();
        let second = out_rx.recv().await.unwrap();
        assert_eq!(first.call_id, Some(CallId::from("a")));
        assert_eq!(first.field("res"), Some(&json!(4)));
        assert_eq!(second.call_id, Some(CallId::from("b")));
        assert_eq!(second.field("res"), Some(&json!(6)));
        worker.await.unwrap();
    }

    #[test]
    fn test_table_names() {
        assert_eq!(table().names(), vec!["double", "explode"]);
        assert_eq!(table().len(), 2);
    }
}
