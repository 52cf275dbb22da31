/*
Copyright 2026 The hwqueue Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use core::time::Duration;

use crate::error::{QueueError, Result};
use crate::platform::{Clock, Mmio};

/// Outcome of a single check inside a bounded wait.
pub(crate) enum Check<T> {
    Ready(T),
    Pending,
}

/// A register condition signalling that the device has reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSignal {
    /// Register offset to read
    pub offset: u64,
    /// Bits of the register that are compared
    pub mask: u32,
    /// Masked value meaning "device is in reset"
    pub value: u32,
}

impl ResetSignal {
    pub fn in_reset<M: Mmio + ?Sized>(&self, mmio: &M) -> bool {
        mmio.read32(self.offset) & self.mask == self.value
    }
}

/// Busy-wait until `check` is ready, sleeping `interval` between attempts.
///
/// Returns [`QueueError::Timeout`] once `timeout` has elapsed, measured from
/// the first check, and [`QueueError::Reset`] as soon as `reset` matches.
/// The timeout fires no earlier than `timeout` and no later than one
/// `interval` after it.
pub(crate) fn bounded_wait<P, T>(
    platform: &P,
    timeout: Duration,
    interval: Duration,
    reset: Option<&ResetSignal>,
    mut check: impl FnMut() -> Result<Check<T>>,
) -> Result<T>
where
    P: Clock + Mmio + ?Sized,
{
    let timeout_ms = timeout.as_millis() as u64;
    let interval_ms = core::cmp::max(interval.as_millis() as u64, 1);
    let start = platform.ticks_ms();

    loop {
        if let Check::Ready(val) = check()? {
            return Ok(val);
        }

        if let Some(signal) = reset
            && signal.in_reset(platform)
        {
            return Err(QueueError::Reset);
        }

        let elapsed = platform.ticks_ms().saturating_sub(start);
        if elapsed >= timeout_ms {
            return Err(QueueError::Timeout);
        }

        platform.sleep_ms(core::cmp::min(interval_ms, timeout_ms - elapsed));
    }
}
