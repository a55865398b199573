//! Per-connection framed I/O and command dispatch (spec.md Section 4.3,
//! Section 5: "one handler per connection... synchronous command
//! dispatch").

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use igor_core::wire::{codec, Command, Event, ErrorKind, FrameDecoder, WireError};
use igor_core::Order;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::queue::{EventManager, OrderManager, Subscriber};

/// State shared by every connection handler.
pub struct Shared {
    pub order_mgr: Mutex<OrderManager>,
    pub event_mgr: Mutex<EventManager>,
}

impl Shared {
    pub fn new(on_assign: Option<mpsc::UnboundedSender<Order>>) -> Self {
        Self {
            order_mgr: Mutex::new(OrderManager::new(on_assign)),
            event_mgr: Mutex::new(EventManager::new()),
        }
    }
}

enum Outbound {
    Order(Order),
    Event(Event),
    Error(WireError),
}

/// Drive one connection end to end: read frames, dispatch commands,
/// write responses, until the socket closes.
pub async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) {
    let id = Uuid::new_v4();
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let terminator = Arc::new(AtomicU8::new(codec::SERVER_DIRECTION_TERMINATOR));

    let writer = tokio::spawn({
        let terminator = terminator.clone();
        async move {
            while let Some(msg) = out_rx.recv().await {
                let value = match msg {
                    Outbound::Order(order) => serde_json::json!({"order": order.to_obj()}),
                    Outbound::Event(event) => event.to_frame(),
                    Outbound::Error(err) => err.to_frame(),
                };
                let Ok(payload) = serde_json::to_vec(&value) else {
                    continue;
                };
                let framed = codec::encode_frame(&payload, terminator.load(Ordering::Relaxed));
                if write_half.write_all(&framed).await.is_err() {
                    break;
                }
            }
        }
    });

    let (order_tx, mut order_rx) = mpsc::unbounded_channel::<Order>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let fwd_tx = out_tx.clone();
    let order_forwarder = tokio::spawn(async move {
        while let Some(order) = order_rx.recv().await {
            if fwd_tx.send(Outbound::Order(order)).is_err() {
                break;
            }
        }
    });
    let fwd_tx = out_tx.clone();
    let event_forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if fwd_tx.send(Outbound::Event(event)).is_err() {
                break;
            }
        }
    });

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let frames = decoder.feed(&buf[..n]);
        if !frames.is_empty() {
            terminator.store(decoder.terminator(), Ordering::Relaxed);
        }
        for frame in frames {
            execute_frame(&frame, id, &shared, &out_tx, &order_tx, &event_tx).await;
        }
    }

    {
        let mut order_mgr = shared.order_mgr.lock().await;
        order_mgr.unsubscribe(id);
    }
    {
        let mut event_mgr = shared.event_mgr.lock().await;
        event_mgr.discard(id);
    }

    drop(out_tx);
    order_forwarder.abort();
    event_forwarder.abort();
    writer.await.ok();
    info!(connection = %id, "connection closed");
}

async fn execute_frame(
    frame: &[u8],
    id: Uuid,
    shared: &Arc<Shared>,
    out_tx: &mpsc::UnboundedSender<Outbound>,
    order_tx: &mpsc::UnboundedSender<Order>,
    event_tx: &mpsc::UnboundedSender<Event>,
) {
    let value: Value = match serde_json::from_slice(frame) {
        Ok(v) => v,
        Err(e) => {
            out_tx
                .send(Outbound::Error(WireError::client(format!(
                    "malformed JSON frame: {e}"
                ))))
                .ok();
            return;
        }
    };

    let command = match Command::parse(&value) {
        Ok(c) => c,
        Err(e) => {
            out_tx.send(Outbound::Error(e)).ok();
            return;
        }
    };

    debug!(connection = %id, command = command.name(), "dispatching command");

    if let Err(e) = execute_command(command, id, shared, order_tx, event_tx).await {
        out_tx.send(Outbound::Error(e)).ok();
    }
}

async fn execute_command(
    command: Command,
    id: Uuid,
    shared: &Arc<Shared>,
    order_tx: &mpsc::UnboundedSender<Order>,
    event_tx: &mpsc::UnboundedSender<Event>,
) -> Result<(), WireError> {
    match command {
        Command::Subscribe { events } => {
            let filter: HashSet<String> = events.into_iter().collect();
            let mut event_mgr = shared.event_mgr.lock().await;
            event_mgr.add(id, event_tx.clone(), filter);
            event_mgr.push_event(Event::Subscribe);
            Ok(())
        }
        Command::Unsubscribe => {
            let mut event_mgr = shared.event_mgr.lock().await;
            event_mgr.discard(id);
            event_mgr.push_event(Event::Unsubscribe);
            Ok(())
        }
        Command::OrderCreate { order } => {
            let order_id = order.id;
            {
                let mut order_mgr = shared.order_mgr.lock().await;
                order_mgr.add_order(order);
            }
            let event_mgr = shared.event_mgr.lock().await;
            event_mgr.push_event(Event::OrderCreated { order_id });
            Ok(())
        }
        Command::OrderAssign => {
            {
                let event_mgr = shared.event_mgr.lock().await;
                event_mgr.push_event(Event::OrderWaiting);
            }
            let mut order_mgr = shared.order_mgr.lock().await;
            order_mgr.subscribe(Subscriber {
                id,
                tx: order_tx.clone(),
            });
            Ok(())
        }
        Command::OrderComplete { order_id } => {
            let completed = {
                let mut order_mgr = shared.order_mgr.lock().await;
                order_mgr
                    .complete_order_id(order_id)
                    .map_err(|e| WireError::command(e.to_string()))?
            };
            let event_mgr = shared.event_mgr.lock().await;
            event_mgr.push_event(Event::OrderCompleted {
                order_id: completed.id,
            });
            Ok(())
        }
        Command::OrderUnassign | Command::OrderCancel => Err(WireError::new(
            ErrorKind::CommandError,
            "command is declared but not implemented",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn spawn_server() -> (std::net::SocketAddr, Arc<Shared>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::new(None));
        let accept_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(stream, accept_shared.clone()));
            }
        });
        (addr, shared)
    }

    #[tokio::test]
    async fn order_assign_then_order_create_delivers_order_over_the_wire() {
        let (addr, _shared) = spawn_server().await;

        let mut worker = TcpStream::connect(addr).await.unwrap();
        worker
            .write_all(b"{\"command\":\"OrderAssign\"}\n")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut creator = TcpStream::connect(addr).await.unwrap();
        let order = igor_core::Order::new(igor_core::NewOrder {
            id: None,
            desc: "t".into(),
            spec_uri: "u".into(),
            spec_ref: "build0".into(),
            source_uri: "u".into(),
            source_args: vec![],
            env: Default::default(),
        });
        let frame = serde_json::json!({"command": "OrderCreate", "params": {"order": order.to_obj()}});
        creator
            .write_all(format!("{}\n", frame).as_bytes())
            .await
            .unwrap();

        let mut buf = [0u8; 4096];
        let n = worker.read(&mut buf).await.unwrap();
        let received: Value = serde_json::from_slice(&buf[..n - 1]).unwrap();
        assert_eq!(received["order"]["id"], order.id.to_string());
    }
}
