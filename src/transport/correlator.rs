//! Request/response correlation.
//!
//! One slot per transport: a request registers its opcode and waits for
//! the read loop to hand it the next inbound frame carrying that opcode.
//! A second request while one is outstanding fails fast instead of
//! queueing.

use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::codec::Frame;

use super::{Result, TransportError};

pub struct PendingRequest {
    pub opcode: u8,
    pub deadline: Instant,
    responder: oneshot::Sender<Frame>,
}

/// Guard holding at most one outstanding request per transport.
pub struct RequestSlot {
    pending: Mutex<Option<PendingRequest>>,
}

impl RequestSlot {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(None),
        }
    }

    /// Claim the slot for `opcode`. Fails with `RequestInProgress` when a
    /// request is already outstanding.
    pub async fn register(&self, opcode: u8, timeout: Duration) -> Result<oneshot::Receiver<Frame>> {
        let mut guard = self.pending.lock().await;
        if guard.is_some() {
            return Err(TransportError::RequestInProgress);
        }
        let (tx, rx) = oneshot::channel();
        *guard = Some(PendingRequest {
            opcode,
            deadline: Instant::now() + timeout,
            responder: tx,
        });
        Ok(rx)
    }

    /// Release the slot without resolving, used by the timeout and
    /// cancellation paths.
    pub async fn clear(&self) {
        *self.pending.lock().await = None;
    }

    /// Resolve the pending request if `frame` carries its opcode.
    /// Called by the read loop for every assembled frame.
    pub async fn try_complete(&self, frame: &Frame) -> bool {
        let mut guard = self.pending.lock().await;
        let matches = matches!(guard.as_ref(), Some(p) if p.opcode == frame.opcode);
        if matches {
            if let Some(pending) = guard.take() {
                if pending.deadline < Instant::now() {
                    log::debug!(
                        "Response for opcode {:#04x} arrived past its deadline",
                        frame.opcode
                    );
                }
                let _ = pending.responder.send(frame.clone());
            }
        }
        matches
    }

    /// Drop any pending request, failing its waiter. Used on teardown.
    pub async fn fail_pending(&self) {
        let mut guard = self.pending.lock().await;
        if let Some(pending) = guard.take() {
            log::debug!(
                "Dropping pending request for opcode {:#04x} on teardown",
                pending.opcode
            );
        }
    }
}

impl Default for RequestSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Await the registered response, bounded by the timeout and the caller's
/// cancellation token. All three outcomes release the slot exactly once.
pub async fn await_response(
    slot: &RequestSlot,
    rx: oneshot::Receiver<Frame>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Frame> {
    tokio::select! {
        res = rx => match res {
            Ok(frame) => Ok(frame),
            // Responder dropped: the transport tore down underneath us
            Err(_) => {
                slot.clear().await;
                Err(TransportError::NotConnected)
            }
        },
        _ = tokio::time::sleep(timeout) => {
            slot.clear().await;
            Err(TransportError::RequestTimeout)
        }
        _ = cancel.cancelled() => {
            slot.clear().await;
            Err(TransportError::Cancelled)
        }
    }
}
