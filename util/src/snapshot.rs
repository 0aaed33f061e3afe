//! Snapshot channels
//!
//! A snapshot channel carries whole values (parameter sets, plans) from a
//! non-real-time producer thread to a cyclic consumer. The consumer only looks
//! at the channel between cycles and only ever keeps the most recent value,
//! so a value is either fully visible or not visible at all.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::sync::mpsc::{channel, Receiver, SendError, Sender, TryRecvError};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Producer side of a snapshot channel. Can be cloned and moved to other
/// threads.
#[derive(Debug)]
pub struct SnapshotSender<T> {
    sender: Sender<T>
}

/// Consumer side of a snapshot channel, owned by the cyclic thread.
#[derive(Debug)]
pub struct SnapshotReceiver<T> {
    receiver: Receiver<T>,

    /// Set once the producer side has been dropped.
    disconnected: bool
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Create a new snapshot channel.
pub fn snapshot_channel<T>() -> (SnapshotSender<T>, SnapshotReceiver<T>) {
    let (sender, receiver) = channel();

    (
        SnapshotSender { sender },
        SnapshotReceiver { receiver, disconnected: false }
    )
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl<T> Clone for SnapshotSender<T> {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone() }
    }
}

impl<T> SnapshotSender<T> {
    /// Publish a new snapshot. Fails only if the consumer has been dropped.
    pub fn publish(&self, value: T) -> Result<(), SendError<T>> {
        self.sender.send(value)
    }
}

impl<T> SnapshotReceiver<T> {
    /// Drain the channel and return the most recently published snapshot, or
    /// `None` if nothing new has been published since the last call.
    ///
    /// This never blocks.
    pub fn latest(&mut self) -> Option<T> {
        let mut latest = None;

        loop {
            match self.receiver.try_recv() {
                Ok(v) => latest = Some(v),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break
                }
            }
        }

        latest
    }

    /// True if every sender has been dropped.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }
}
