use std::sync::Arc;

use comms::msg::{Event, Scope};
use log::warn;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// An outbound message queued for the connected client.
#[derive(Debug)]
pub enum OutMsg {
    Event(Event),
    Frame { update_time: f32, data: Vec<u8> },
}

/// The shared outbound queue toward the (single) connected client.
///
/// Producers never block and never fail: with no client attached, or
/// with a client that cannot drain fast enough, messages are dropped.
/// The queue is bounded so a stalled socket cannot grow server memory.
#[derive(Clone, Default)]
pub struct Outbox {
    tx: Arc<Mutex<Option<mpsc::Sender<OutMsg>>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a fresh client queue, replacing any previous one.
    ///
    /// # Returns
    /// The receiving end, owned by the connection's writer task.
    pub fn attach(&self, capacity: usize) -> mpsc::Receiver<OutMsg> {
        let (tx, rx) = mpsc::channel(capacity);
        *self.tx.lock() = Some(tx);
        rx
    }

    /// Drops the client queue; subsequent sends are discarded.
    pub fn detach(&self) {
        *self.tx.lock() = None;
    }

    pub fn is_attached(&self) -> bool {
        self.tx.lock().is_some()
    }

    fn push(&self, msg: OutMsg) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };

        if let Err(mpsc::error::TrySendError::Full(msg)) = tx.try_send(msg) {
            // frames are disposable, events matter
            if let OutMsg::Event(event) = msg {
                warn!("outbox full, dropping event: {event:?}");
            }
        }
    }

    pub fn event(&self, event: Event) {
        self.push(OutMsg::Event(event));
    }

    pub fn frame(&self, update_time: f32, data: Vec<u8>) {
        self.push(OutMsg::Frame { update_time, data });
    }

    pub fn error(&self, scope: Scope, message: impl ToString) {
        self.event(Event::Error {
            scope,
            message: message.to_string(),
        });
    }

    pub fn notice(&self, scope: Scope, message: impl ToString) {
        self.event(Event::Notice {
            scope,
            message: message.to_string(),
        });
    }
}
