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

use core::fmt;

use thiserror::Error;

/// Result alias used throughout the queue engine.
pub type Result<T> = core::result::Result<T, QueueError>;

/// The error type for queue engine operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// A ring slot or the command interface is momentarily unavailable.
    /// Callers retry later; this is never fatal.
    #[error("Queue is busy")]
    Busy,

    /// A bounded wait for the device expired.
    #[error("Timed out waiting for the device")]
    Timeout,

    /// The device reset itself while an operation was in progress.
    #[error("Device reset detected")]
    Reset,

    /// Firmware reported an explicit failure status.
    #[error("Device reported failure: {0}")]
    DeviceError(DeviceStatus),

    /// No free queue numbers remain.
    #[error("Queue numbers exhausted")]
    Exhausted,

    /// A completion or response referenced an unknown slot, tag or queue.
    #[error("Corrupted completion")]
    Corrupted,

    /// The operation was cancelled because its queue was destroyed.
    #[error("Operation cancelled")]
    Cancelled,

    /// DMA memory could not be allocated.
    #[error("Out of DMA memory")]
    NoMemory,

    /// The requested transition or call is not valid in the current state.
    #[error("Invalid state")]
    InvalidState,

    /// The memory backend failed to read or write ring memory.
    #[error("Backend memory error")]
    Mem,
}

impl QueueError {
    /// Whether bring-up may recover from this error by resetting the device
    /// and trying again.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Busy
            | QueueError::Timeout
            | QueueError::Reset
            | QueueError::DeviceError(_) => true,
            QueueError::Exhausted
            | QueueError::Corrupted
            | QueueError::Cancelled
            | QueueError::NoMemory
            | QueueError::InvalidState
            | QueueError::Mem => false,
        }
    }
}

/// Stable decoding of firmware failure codes.
///
/// Each admin protocol reports failure with its own encoding; all of them are
/// folded into this taxonomy so callers can react without knowing which
/// device family they are talking to.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    #[error("command not completed")]
    Uncompleted,
    #[error("aborted")]
    Aborted,
    #[error("already exists")]
    AlreadyExists,
    #[error("cancelled")]
    Cancelled,
    #[error("data loss")]
    DataLoss,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("failed precondition")]
    FailedPrecondition,
    #[error("internal error")]
    Internal,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not found")]
    NotFound,
    #[error("out of range")]
    OutOfRange,
    #[error("permission denied")]
    PermissionDenied,
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("resource exhausted")]
    ResourceExhausted,
    #[error("unavailable")]
    Unavailable,
    #[error("unimplemented")]
    Unimplemented,
    #[error("unknown status {0:#x}")]
    Unknown(u32),
}

impl DeviceStatus {
    /// Success code written back into event-counter command slots.
    pub const EVENT_STATUS_OK: u32 = 0x0000_0001;

    /// Decode the status word of an event-counter command slot.
    /// Returns `None` on success.
    pub fn from_event_status(code: u32) -> Option<Self> {
        let status = match code {
            Self::EVENT_STATUS_OK => return None,
            0x00 => Self::Uncompleted,
            0x10 => Self::Aborted,
            0x11 => Self::AlreadyExists,
            0x12 => Self::Cancelled,
            0x13 => Self::DataLoss,
            0x14 => Self::DeadlineExceeded,
            0x15 => Self::FailedPrecondition,
            0x16 => Self::Internal,
            0x17 => Self::InvalidArgument,
            0x18 => Self::NotFound,
            0x19 => Self::OutOfRange,
            0x1a => Self::PermissionDenied,
            0x1b => Self::Unauthenticated,
            0x1c => Self::ResourceExhausted,
            0x1d => Self::Unavailable,
            0x1e => Self::Unimplemented,
            other => Self::Unknown(other),
        };
        Some(status)
    }

    /// Decode the status byte of a phase-ring admin completion.
    /// Returns `None` on success.
    pub fn from_response_status(code: u8) -> Option<Self> {
        let status = match code {
            0 => return None,
            1 => Self::ResourceExhausted,
            2 | 3 => Self::Unimplemented,
            4 | 5 => Self::InvalidArgument,
            7 => Self::Unavailable,
            other => Self::Unknown(other.into()),
        };
        Some(status)
    }

    /// Decode the status byte of a go-bit command register.
    /// Returns `None` on success.
    pub fn from_hcr_status(code: u8) -> Option<Self> {
        let status = match code {
            0x00 => return None,
            0x01 => Self::Internal,
            0x02 => Self::Unimplemented,
            0x03 | 0x20 => Self::InvalidArgument,
            0x04 | 0x09 | 0x10 => Self::FailedPrecondition,
            0x05 => Self::NotFound,
            0x06 => Self::Unavailable,
            0x08 => Self::ResourceExhausted,
            0x0a => Self::OutOfRange,
            0x21 => Self::AlreadyExists,
            other => Self::Unknown(other.into()),
        };
        Some(status)
    }

    /// Decode the syndrome of an error completion.
    pub fn from_syndrome(syndrome: u8, vendor: u8) -> Self {
        match syndrome {
            0x01 => Self::OutOfRange,
            0x02 => Self::FailedPrecondition,
            0x04 | 0x11 | 0x13 => Self::PermissionDenied,
            0x05 => Self::Cancelled,
            0x10 | 0x12 | 0x14 => Self::InvalidArgument,
            0x15 | 0x16 => Self::DeadlineExceeded,
            0x22 => Self::Aborted,
            other => Self::Unknown(u32::from(vendor) << 8 | u32::from(other)),
        }
    }
}

/// A rejected submission, handing the buffer back to the caller.
#[derive(Error)]
#[error("post rejected: {error}")]
pub struct PostError<B> {
    pub error: QueueError,
    pub buffer: B,
}

impl<B> PostError<B> {
    pub fn new(error: QueueError, buffer: B) -> Self {
        Self { error, buffer }
    }

    /// Recover the buffer that could not be posted.
    pub fn into_buffer(self) -> B {
        self.buffer
    }
}

impl<B> fmt::Debug for PostError<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<B> From<PostError<B>> for QueueError {
    fn from(err: PostError<B>) -> Self {
        err.error
    }
}

/// Logs an error then returns it from the enclosing function.
macro_rules! log_then_return {
    ($err:expr $(,)?) => {{
        let __err: $crate::error::QueueError = $err;
        log::error!("{}", __err);
        return Err(__err.into());
    }};
    ($err:expr, $($arg:tt)+) => {{
        let __err: $crate::error::QueueError = $err;
        log::error!("{}: {}", core::format_args!($($arg)+), __err);
        return Err(__err.into());
    }};
}

pub(crate) use log_then_return;
