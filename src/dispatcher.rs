// MIT License - Copyright (c) 2026 Peter Wright
// Reply dispatcher

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::debug;

use crate::event::{AcuEvent, EventSender};
use crate::reply::{Reply, TransactionId};
use crate::transport::ConnectionId;

/// A caller awaiting a correlated reply. Registered with the dispatcher
/// *before* the command is enqueued to the bus, so a fast reply can never
/// race the registration.
pub struct PendingRequest {
    pub connection_id: ConnectionId,
    pub address: u8,
    pub command_code: u8,
    pub deadline: Instant,
    pub tx: oneshot::Sender<Reply>,
}

/// Shared pending-request table. The panel registers and cancels entries;
/// the dispatcher completes them.
pub(crate) type PendingMap = Arc<Mutex<HashMap<TransactionId, PendingRequest>>>;

/// Messages the buses feed into the dispatcher.
#[derive(Debug)]
pub enum BusMessage {
    Reply(Reply),
    ConnectionStatus {
        connection_id: ConnectionId,
        address: u8,
        online: bool,
    },
}

/// The process-wide single consumer of every bus's reply sink.
///
/// Per reply the order is fixed: complete the matching pending request
/// first, then fan out the typed notification, so a listener can never
/// observe a reply before the awaiting caller has been resumed.
pub struct ReplyDispatcher {
    pending: PendingMap,
    events: EventSender,
}

impl ReplyDispatcher {
    pub(crate) fn new(pending: PendingMap, events: EventSender) -> Self {
        Self { pending, events }
    }

    /// Drain the shared sink until every sender is gone.
    pub(crate) async fn run(self, mut rx: mpsc::UnboundedReceiver<BusMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                BusMessage::Reply(reply) => self.handle_reply(reply).await,
                BusMessage::ConnectionStatus {
                    connection_id,
                    address,
                    online,
                } => {
                    let _ = self.events.send(AcuEvent::ConnectionStatusChanged {
                        connection_id,
                        address,
                        online,
                    });
                }
            }
        }
        debug!("Reply dispatcher stopped");
    }

    async fn handle_reply(&self, reply: Reply) {
        if let Some((_, transaction)) = reply.issuing_command {
            let pending = {
                let mut pending = self.pending.lock().await;
                self.prune_expired(&mut pending);
                pending.remove(&transaction)
            };
            match pending {
                Some(request) => {
                    // The caller may have timed out or been cancelled
                    // between removal and completion; that is its problem.
                    let _ = request.tx.send(reply.clone());
                }
                None => {
                    debug!(
                        "No pending request for {} (timed out or cancelled); reply discarded",
                        transaction
                    );
                }
            }
        }

        // Listener errors (no receivers, lagging receivers) never
        // propagate into the dispatch loop.
        if let Some(event) = AcuEvent::from_reply(&reply) {
            let _ = self.events.send(event);
        }
    }

    /// Drop entries whose deadline has passed; their callers have already
    /// given up, this just keeps the table from accumulating them.
    fn prune_expired(&self, pending: &mut HashMap<TransactionId, PendingRequest>) {
        let now = Instant::now();
        pending.retain(|_, request| request.deadline > now);
    }
}
