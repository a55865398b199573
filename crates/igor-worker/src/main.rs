//! igor-worker - subscribes for orders and executes builds against a
//! pool of OS processes (spec.md Section 2, Section 5).

mod pool;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use clap::Parser;
use igor_core::wire::{codec, FrameDecoder};
use igor_core::Order;
use pool::{OrderOutcome, Pool, EXECUTE_ORDER_FLAG};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

/// igor-ci build worker.
#[derive(Debug, Parser)]
struct Args {
    /// Server hostname.
    #[arg(long)]
    host: String,

    /// Server TCP port.
    #[arg(long, default_value_t = igor_core::DEFAULT_PORT)]
    port: u16,

    /// Log level (falls back to INFO on an unrecognised value).
    #[arg(long, env = "IGOR_WORKER_LOGGING")]
    logging: Option<String>,
}

fn main() {
    // The hidden re-exec mode bypasses clap entirely: `igor-worker
    // --execute-order <worker-id>` reads one order from stdin and prints
    // one outcome to stdout (pool.rs).
    let mut raw_args = std::env::args();
    raw_args.next();
    if raw_args.next().as_deref() == Some(EXECUTE_ORDER_FLAG) {
        let worker_id = raw_args.next().unwrap_or_else(|| "unknown".to_string());
        if let Err(e) = pool::run_execute_order_mode(&worker_id) {
            eprintln!("igor-worker --execute-order failed: {e}");
            std::process::exit(1);
        }
        return;
    }

    let args = Args::parse();

    let filter = args
        .logging
        .as_deref()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        if let Err(e) = run(&args).await {
            error!(error = %e, "worker error");
            std::process::exit(1);
        }
    });
}

async fn run(args: &Args) -> std::io::Result<()> {
    let worker_id = Uuid::new_v4().to_string();
    let addr = format!("{}:{}", args.host, args.port);
    info!(%addr, worker_id = %worker_id, "connecting to server");
    let stream = TcpStream::connect(&addr).await?;
    let (mut read_half, mut write_half) = stream.into_split();

    let pool = Arc::new(Pool::new(worker_id.clone()));
    let capacity = pool.capacity();

    let terminator = Arc::new(AtomicU8::new(codec::WORKER_DIRECTION_TERMINATOR));
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    let writer_terminator = terminator.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(payload) = serde_json::to_vec(&frame) else {
                continue;
            };
            let framed =
                codec::encode_frame(&payload, writer_terminator.load(Ordering::Relaxed));
            if write_half.write_all(&framed).await.is_err() {
                break;
            }
        }
    });

    // Register one unit of demand per CPU (spec.md Section 5: "the
    // worker registers one unit of demand per CPU by issuing
    // OrderAssign").
    for _ in 0..capacity {
        out_tx
            .send(serde_json::json!({"command": "OrderAssign"}))
            .ok();
    }

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<OrderOutcome>();
    let done_out_tx = out_tx.clone();
    tokio::spawn(async move {
        while let Some(outcome) = done_rx.recv().await {
            if let Some(err) = &outcome.error {
                warn!(order_id = %outcome.order_id, error = %err, "order failed");
            } else {
                info!(order_id = %outcome.order_id, "order completed");
            }
            done_out_tx
                .send(serde_json::json!({
                    "command": "OrderComplete",
                    "params": {"order_id": outcome.order_id.to_string()}
                }))
                .ok();
            done_out_tx
                .send(serde_json::json!({"command": "OrderAssign"}))
                .ok();
        }
    });

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = read_half.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let frames = decoder.feed(&buf[..n]);
        if !frames.is_empty() {
            terminator.store(decoder.terminator(), Ordering::Relaxed);
        }
        for frame in frames {
            handle_frame(&frame, &pool, &done_tx);
        }
    }

    drop(out_tx);
    writer.await.ok();
    Ok(())
}

fn handle_frame(frame: &[u8], pool: &Arc<Pool>, done_tx: &mpsc::UnboundedSender<OrderOutcome>) {
    let value: Value = match serde_json::from_slice(frame) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "malformed frame from server");
            return;
        }
    };

    let Some(order_obj) = value.get("order") else {
        if let Some(err) = value.get("error") {
            warn!(?err, "server sent an error frame");
        }
        return;
    };

    match Order::from_obj(order_obj.clone()) {
        Ok(order) => pool.spawn_order(order, done_tx.clone()),
        Err(e) => warn!(error = %e, "malformed order pushed from server"),
    }
}
