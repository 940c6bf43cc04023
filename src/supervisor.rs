// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Task supervisor: a single registry of named task slots, each fed by
//! its own FIFO mailbox (C14, §5). Generalises the teacher's
//! `ClientConnection`/`Pool` pairing — one long-lived owner object
//! handing out `Arc` handles, routing inbound work by key, and a
//! cancellation token for shutdown — from "one TCP connection, routing
//! by ITT" to "one task registry, routing by task name".

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A unit of work dispatched to a task's slot.
pub type Message = Box<dyn std::any::Any + Send>;

/// One registered task slot: a mailbox plus a pending/cancelled flag
/// (§5: "cancellation via pending flags").
struct Slot {
    sender: mpsc::Sender<Message>,
    pending: AtomicBool,
    cancel: CancellationToken,
}

/// Owns every task slot in the process. One reactor, one registry
/// (§5: "a single I/O reactor drives all sockets and serial ports").
pub struct Supervisor {
    slots: DashMap<String, Arc<Slot>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { slots: DashMap::new(), shutdown: CancellationToken::new() })
    }

    /// Registers a new named task slot with a bounded FIFO mailbox of
    /// `capacity` messages, returning the receiving half for the task
    /// body to drive.
    pub fn register(&self, name: impl Into<String>, capacity: usize) -> mpsc::Receiver<Message> {
        let name = name.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let slot = Arc::new(Slot {
            sender: tx,
            pending: AtomicBool::new(false),
            cancel: self.shutdown.child_token(),
        });
        self.slots.insert(name, slot);
        rx
    }

    /// Removes a task's slot once its body has exited.
    pub fn deregister(&self, name: &str) {
        self.slots.remove(name);
    }

    /// Dispatches `message` to `name`'s mailbox in FIFO order (§5).
    /// Returns `false` if the slot doesn't exist or its mailbox is full.
    pub async fn dispatch(&self, name: &str, message: Message) -> bool {
        let Some(slot) = self.slots.get(name).map(|s| s.clone()) else {
            warn!(task = name, "dispatch to unknown task slot");
            return false;
        };
        slot.pending.store(true, Ordering::SeqCst);
        slot.sender.send(message).await.is_ok()
    }

    /// True while `name`'s mailbox holds at least one undelivered
    /// message since the last `clear_pending` (§5: "pending flags").
    pub fn is_pending(&self, name: &str) -> bool {
        self.slots.get(name).map(|s| s.pending.load(Ordering::SeqCst)).unwrap_or(false)
    }

    pub fn clear_pending(&self, name: &str) {
        if let Some(slot) = self.slots.get(name) {
            slot.pending.store(false, Ordering::SeqCst);
        }
    }

    /// Requests cancellation of one named task without tearing down
    /// the rest of the registry.
    pub fn cancel(&self, name: &str) {
        if let Some(slot) = self.slots.get(name) {
            slot.cancel.cancel();
        }
    }

    /// A cancellation token a task body can `select!` against to learn
    /// it has been asked to stop, individually or via global shutdown.
    pub fn cancellation(&self, name: &str) -> Option<CancellationToken> {
        self.slots.get(name).map(|s| s.cancel.clone())
    }

    /// Cancels every registered task (process shutdown).
    pub fn shutdown_all(&self) {
        self.shutdown.cancel();
        for entry in self.slots.iter() {
            entry.value().cancel.cancel();
        }
    }

    pub fn task_count(&self) -> usize {
        self.slots.len()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self { slots: DashMap::new(), shutdown: CancellationToken::new() }
    }
}

/// Suspends the calling task for `duration`, or returns early if its
/// slot is cancelled first (§5: "`suspend(duration)` timers").
pub async fn suspend(cancel: &CancellationToken, duration: std::time::Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {},
        _ = cancel.cancelled() => {
            debug!("suspend interrupted by cancellation");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_delivers_in_fifo_order() {
        let supervisor = Supervisor::new();
        let mut rx = supervisor.register("wmbus-scan", 8);

        supervisor.dispatch("wmbus-scan", Box::new(1u32)).await;
        supervisor.dispatch("wmbus-scan", Box::new(2u32)).await;

        let first = rx.recv().await.unwrap().downcast::<u32>().unwrap();
        let second = rx.recv().await.unwrap().downcast::<u32>().unwrap();
        assert_eq!((*first, *second), (1, 2));
    }

    #[tokio::test]
    async fn dispatch_to_unknown_slot_fails() {
        let supervisor = Supervisor::new();
        assert!(!supervisor.dispatch("missing", Box::new(0u8)).await);
    }

    #[tokio::test]
    async fn pending_flag_tracks_dispatch_and_clear() {
        let supervisor = Supervisor::new();
        let _rx = supervisor.register("push", 4);
        assert!(!supervisor.is_pending("push"));
        supervisor.dispatch("push", Box::new(())).await;
        assert!(supervisor.is_pending("push"));
        supervisor.clear_pending("push");
        assert!(!supervisor.is_pending("push"));
    }

    #[tokio::test]
    async fn cancel_one_task_does_not_cancel_others() {
        let supervisor = Supervisor::new();
        let _a = supervisor.register("a", 1);
        let _b = supervisor.register("b", 1);
        supervisor.cancel("a");
        assert!(supervisor.cancellation("a").unwrap().is_cancelled());
        assert!(!supervisor.cancellation("b").unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_all_cancels_every_registered_task() {
        let supervisor = Supervisor::new();
        let _a = supervisor.register("a", 1);
        let _b = supervisor.register("b", 1);
        supervisor.shutdown_all();
        assert!(supervisor.cancellation("a").unwrap().is_cancelled());
        assert!(supervisor.cancellation("b").unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn suspend_returns_early_on_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = std::time::Instant::now();
        suspend(&cancel, std::time::Duration::from_secs(5)).await;
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }
}
