// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The capability surface every completion source implements.

use crate::error::TaskError;
use core::fmt;
use core::task::Waker;
use std::sync::Arc;

/// The observable state of a completion source.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Pending = 0,
    Succeeded = 1,
    Faulted = 2,
    Canceled = 3,
}

/// The version a handle expects its source to be at.
///
/// Pooled sources bump their version every time they are reset, which invalidates every handle
/// that was issued for the previous use.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Token(u32);

/// A source of exactly one outcome that a [`TaskHandle`](crate::task::TaskHandle) can observe.
///
/// Every operation takes the [`Token`] the handle was issued with. Versioned implementations panic
/// with [`Misuse::StaleHandle`](crate::error::Misuse::StaleHandle) when it does not match.
pub trait TaskSource<T>: Send + Sync {
    /// Returns the current status.
    fn status(&self, token: Token) -> Status;

    /// Registers `continuation` to be woken exactly once when the source completes.
    ///
    /// If the source has already completed, `continuation` is woken before this returns.
    fn on_completed(&self, continuation: Waker, token: Token);

    /// Consumes the outcome.
    ///
    /// # Errors
    ///
    /// Returns the fault or cancellation the source completed with.
    ///
    /// # Panics
    ///
    /// Panics if the source is still pending, or if the outcome was already consumed.
    fn take_result(self: Arc<Self>, token: Token) -> Result<T, TaskError>;
}

// === impl Status ===

impl Status {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Pending,
            1 => Status::Succeeded,
            2 => Status::Faulted,
            _ => Status::Canceled,
        }
    }

    pub const fn is_completed(self) -> bool {
        !matches!(self, Status::Pending)
    }

    pub const fn is_completed_successfully(self) -> bool {
        matches!(self, Status::Succeeded)
    }

    pub const fn is_faulted(self) -> bool {
        matches!(self, Status::Faulted)
    }

    pub const fn is_canceled(self) -> bool {
        matches!(self, Status::Canceled)
    }

    pub(crate) fn of<T>(outcome: &Result<T, TaskError>) -> Self {
        match outcome {
            Ok(_) => Status::Succeeded,
            Err(TaskError::Faulted(_)) => Status::Faulted,
            Err(TaskError::Canceled(_)) => Status::Canceled,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// === impl Token ===

impl Token {
    pub(crate) const fn new(version: u32) -> Self {
        Self(version)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
