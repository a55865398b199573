//! OS-process worker pool (spec.md Section 5, Section 9: "a pool of
//! worker processes (not threads) is required because each build forks
//! subprocesses, performs filesystem mutation, and must not share mutable
//! state with the control loop").
//!
//! Each order is executed by re-exec'ing this same binary with the
//! hidden `--execute-order` mode (see `main.rs`): the child reads one
//! order as JSON on stdin and writes one outcome as JSON on stdout. A
//! `Semaphore` sized to the host's CPU count bounds how many children run
//! concurrently.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use igor_core::{json, Order};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, ErrorKind};
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

pub const EXECUTE_ORDER_FLAG: &str = "--execute-order";

/// Result of running one order through a pool child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderOutcome {
    pub order_id: Uuid,
    pub error: Option<String>,
}

impl OrderOutcome {
    fn ok(order_id: Uuid) -> Self {
        Self {
            order_id,
            error: None,
        }
    }

    fn failed(order_id: Uuid, error: impl std::fmt::Display) -> Self {
        Self {
            order_id,
            error: Some(error.to_string()),
        }
    }
}

/// A pool of OS-process slots, sized to the host's CPU count.
pub struct Pool {
    semaphore: Arc<Semaphore>,
    worker_id: String,
}

impl Pool {
    pub fn new(worker_id: String) -> Self {
        Self::with_capacity(worker_id, num_cpus::get().max(1))
    }

    pub fn with_capacity(worker_id: String, capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            worker_id,
        }
    }

    pub fn capacity(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Submit `order` to the pool. `done` receives exactly one
    /// `OrderOutcome` when the child finishes, whether it succeeded or
    /// failed (spec.md Section 7: the error callback still reports
    /// completion, so the server does not leak the assignment).
    pub fn spawn_order(&self, order: Order, done: mpsc::UnboundedSender<OrderOutcome>) {
        let semaphore = self.semaphore.clone();
        let worker_id = self.worker_id.clone();
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("pool semaphore is never closed");
            let outcome = run_child(&order, &worker_id).await;
            done.send(outcome).ok();
        });
    }
}

async fn run_child(order: &Order, worker_id: &str) -> OrderOutcome {
    let exe = match std::env::current_exe() {
        Ok(p) => p,
        Err(e) => return OrderOutcome::failed(order.id, e),
    };

    let mut child = match Command::new(exe)
        .arg(EXECUTE_ORDER_FLAG)
        .arg(worker_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return OrderOutcome::failed(order.id, e),
    };

    let payload = match json::to_canonical_bytes(order) {
        Ok(p) => p,
        Err(e) => return OrderOutcome::failed(order.id, e),
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(&payload).await {
            if e.kind() != ErrorKind::BrokenPipe {
                return OrderOutcome::failed(order.id, e);
            }
        }
    }

    let output = match child.wait_with_output().await {
        Ok(o) => o,
        Err(e) => return OrderOutcome::failed(order.id, e),
    };

    if !output.status.success() {
        return OrderOutcome::failed(
            order.id,
            format!("worker child exited with status {}", output.status),
        );
    }

    match json::from_bytes_typed::<OrderOutcome>(&output.stdout) {
        Ok(outcome) => outcome,
        Err(e) => OrderOutcome::failed(order.id, e),
    }
}

/// Entrypoint for the hidden `--execute-order <worker-id>` mode: read one
/// order from stdin, execute it, and print the outcome to stdout.
pub fn run_execute_order_mode(worker_id: &str) -> std::io::Result<()> {
    use std::io::Read;

    let mut input = Vec::new();
    std::io::stdin().read_to_end(&mut input)?;

    let outcome = match json::from_bytes_typed::<Order>(&input) {
        Ok(order) => {
            let order_id = order.id;
            match igor_core::executor::execute_order(&order, worker_id, Path::new("/tmp")) {
                Ok(_report) => OrderOutcome::ok(order_id),
                Err(e) => OrderOutcome::failed(order_id, e),
            }
        }
        Err(e) => OrderOutcome::failed(Uuid::nil(), format!("malformed order on stdin: {e}")),
    };

    let bytes = json::to_canonical_bytes(&outcome)
        .unwrap_or_else(|_| b"{\"order_id\":null,\"error\":\"failed to encode outcome\"}\n".to_vec());
    use std::io::Write;
    std::io::stdout().write_all(&bytes)
}
