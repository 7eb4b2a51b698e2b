// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device command spacing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::context::Context;
use crate::error::{Error, Result};

type Slot = Arc<tokio::sync::Mutex<Option<Instant>>>;

/// Enforces a minimum start-to-start interval between commands sent to the
/// same device. Different devices never wait on each other.
///
/// Waiters on one device are served in arrival order.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl RateLimiter {
    /// Creates a limiter. A zero interval disables limiting.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the configured interval.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Returns the number of devices with a slot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns whether no device has been touched yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Drops the slot of a forgotten device.
    pub fn forget(&self, device_id: &str) {
        self.slots.lock().remove(device_id);
    }

    fn slot(&self, device_id: &str) -> Slot {
        Arc::clone(
            self.slots
                .lock()
                .entry(device_id.to_string())
                .or_default(),
        )
    }

    /// Blocks until a new command to `device_id` may start.
    ///
    /// A waiter that gives up leaves the slot untouched, so later waiters
    /// are spaced from the last command that actually started.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if `ctx` is cancelled while waiting
    /// - [`Error::Timeout`] if the deadline of `ctx` passes while waiting
    pub async fn wait(&self, ctx: &Context, device_id: &str) -> Result<()> {
        if self.min_interval.is_zero() {
            return ctx.check();
        }

        let slot = self.slot(device_id);
        let budget = ctx.remaining_ms();
        let mut last_started = tokio::select! {
            () = ctx.cancelled() => return Err(Error::Cancelled),
            () = ctx.deadline_reached() => return Err(Error::Timeout(budget)),
            guard = slot.lock() => guard,
        };

        if let Some(previous) = *last_started {
            let ready_at = previous + self.min_interval;
            let now = Instant::now();
            if ready_at > now {
                tracing::trace!(
                    device = %device_id,
                    wait_ms = (ready_at - now).as_millis(),
                    "Rate limiting command"
                );
                ctx.sleep(ready_at - now).await?;
            }
        }

        *last_started = Some(Instant::now());
        Ok(())
    }
}
