// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Call context: a cancellation token plus an optional deadline.
//!
//! Every operation that can suspend takes a [`Context`]. Cancelling a
//! context cancels every context derived from it with [`Context::child`],
//! which is how a fan-out aborts its in-flight children.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::Error;

/// Cooperative cancellation and deadline for one call tree.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use myhome::Context;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let ctx = Context::new().with_timeout(Duration::from_millis(500));
/// let child = ctx.child();
/// ctx.cancel();
/// assert!(child.is_cancelled());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Creates a fresh context with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of this context whose deadline is `timeout` from now,
    /// or the current deadline if that is earlier.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns a copy of this context with the given deadline, keeping the
    /// current one if it is earlier.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// Derives a child context. Cancelling `self` cancels the child, not
    /// the other way around.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancels this context and all its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns whether this context has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Returns the deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the deadline, or `now + fallback` when none is set.
    #[must_use]
    pub fn deadline_or(&self, fallback: Duration) -> Instant {
        self.deadline.unwrap_or_else(|| Instant::now() + fallback)
    }

    /// Fails with [`Error::Cancelled`] if the context is already cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when cancelled.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Completes when the deadline passes. Never completes without one.
    pub async fn deadline_reached(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Milliseconds left before the deadline, zero once it has passed.
    #[must_use]
    pub fn remaining_ms(&self) -> u64 {
        self.deadline.map_or(0, |deadline| {
            u64::try_from(deadline.saturating_duration_since(Instant::now()).as_millis())
                .unwrap_or(u64::MAX)
        })
    }

    /// Sleeps for `duration`, or returns early when the context is
    /// cancelled or its deadline passes.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if the context is cancelled first
    /// - [`Error::Timeout`] if the deadline passes first
    pub async fn sleep(&self, duration: Duration) -> Result<(), Error> {
        let budget = self.remaining_ms();
        tokio::select! {
            () = self.token.cancelled() => Err(Error::Cancelled),
            () = self.deadline_reached() => Err(Error::Timeout(budget)),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_is_cancelled_with_parent() {
        let parent = Context::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancelling_child_leaves_parent() {
        let parent = Context::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
        assert!(parent.check().is_ok());
        assert!(matches!(child.check(), Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_keeps_earlier_deadline() {
        let ctx = Context::new().with_timeout(Duration::from_millis(100));
        let first = ctx.deadline().unwrap();
        let ctx = ctx.with_timeout(Duration::from_secs(10));
        assert_eq!(ctx.deadline(), Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_interrupted_by_cancel() {
        let ctx = Context::new();
        let sleeper = ctx.clone();
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(60)).await });
        tokio::task::yield_now().await;
        ctx.cancel();
        assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_stops_at_deadline() {
        let ctx = Context::new().with_timeout(Duration::from_millis(300));
        let start = Instant::now();
        let err = ctx.sleep(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(300)));
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_within_deadline_completes() {
        let ctx = Context::new().with_timeout(Duration::from_secs(1));
        ctx.sleep(Duration::from_millis(200)).await.unwrap();
        assert!((790..=800).contains(&ctx.remaining_ms()));
    }
}
