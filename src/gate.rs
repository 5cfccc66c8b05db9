// Copyright (C) 2026 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One-shot connection readiness latch.

use std::sync::Arc;

use tokio::sync::watch;

/// A latch which transitions from unsignaled to signaled exactly once.
///
/// Clones share the same latch. Typically the signaling side holds one clone
/// and calls [`ReadinessGate::signal`] from a transport state callback, while
/// the feeder holds another and calls [`ReadinessGate::wait`].
#[derive(Clone, Debug)]
pub struct ReadinessGate(Arc<watch::Sender<bool>>);

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        ReadinessGate(Arc::new(tx))
    }

    /// Signals the gate, waking all waiters.
    ///
    /// Returns true iff this call performed the transition; later calls have
    /// no effect. Safe to call from any thread.
    pub fn signal(&self) -> bool {
        self.0.send_if_modified(|signaled| !std::mem::replace(signaled, true))
    }

    pub fn is_signaled(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until the gate is signaled. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.0.subscribe();

        // `self` keeps the sender alive, so the channel can't close.
        let _ = rx.wait_for(|&signaled| signaled).await;
    }
}
