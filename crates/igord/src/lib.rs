//! igor-ci server: in-memory order queue, event fan-out, and the framed
//! TCP wire protocol that order-creating clients and workers speak
//! (spec.md Section 2, Section 4).

pub mod conn;
pub mod queue;

use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use conn::Shared;
use igor_core::wire::Event;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {0}: {1}")]
    Bind(std::net::SocketAddr, std::io::Error),
}

/// Default TCP port (spec.md Section 6, "Server port").
pub const DEFAULT_PORT: u16 = igor_core::DEFAULT_PORT;

/// Run the server loop, accepting connections until the process is
/// asked to stop.
///
/// The order manager is given a single, fixed `on_assign` sink at
/// construction time that fans every assignment out as an
/// `OrderAssigned` event, independent of which connection triggered the
/// assignment (spec.md Section 9: avoids the source's per-connection
/// handler-rebinding bug, where only the most recently subscribed
/// connection ever heard about assignments).
pub async fn serve(port: u16) -> Result<(), ServerError> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind(addr, e))?;
    info!(%addr, "igord listening");

    let (assign_tx, mut assign_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::new(Some(assign_tx)));

    tokio::spawn({
        let shared = shared.clone();
        async move {
            while let Some(order) = assign_rx.recv().await {
                let Some(worker) = order.worker.clone() else {
                    continue;
                };
                let event_mgr = shared.event_mgr.lock().await;
                event_mgr.push_event(Event::OrderAssigned {
                    order_id: order.id,
                    worker,
                });
            }
        }
    });

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept connection");
                continue;
            }
        };
        info!(%peer, "accepted connection");
        tokio::spawn(conn::handle_connection(stream, shared.clone()));
    }
}
