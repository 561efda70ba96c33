// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cancel::Cancellation;
use core::any::Any;
use core::error::Error;
use core::fmt;
use core::panic::Location;
use std::borrow::Cow;
use std::sync::Arc;

/// The reason a task did not produce a value.
///
/// Returned from consuming a [`TaskHandle`](crate::task::TaskHandle) so that computations can
/// propagate failures with `?`.
#[derive(Clone)]
pub enum TaskError {
    /// The operation observed a requested cancellation signal.
    Canceled(Canceled),
    /// The operation failed with an error captured at its origin.
    Faulted(Fault),
}

/// A failure captured where it was raised and re-raised verbatim when the result is consumed.
#[derive(Clone)]
pub struct Fault(Arc<FaultInner>);

struct FaultInner {
    repr: Repr,
    location: &'static Location<'static>,
}

enum Repr {
    Error(Box<dyn Error + Send + Sync + 'static>),
    Message(Cow<'static, str>),
    Panic(Option<String>),
}

/// A cancellation outcome, carrying the signal that caused it.
#[derive(Clone, Debug)]
pub struct Canceled {
    cancellation: Cancellation,
}

/// Programming errors detected at runtime.
///
/// These are never returned. The offending call panics with the message of the respective variant.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Misuse {
    /// A result was consumed while its source was still pending.
    NotCompleted,
    /// The handle's token no longer matches its source, the result was already consumed or the
    /// source has been recycled.
    StaleHandle,
    /// A second continuation was registered on a single-consumer source.
    AlreadyAwaited,
}

// === impl TaskError ===

impl TaskError {
    /// Captures `error` as a [`TaskError::Faulted`] at the caller's location.
    #[track_caller]
    pub fn fault<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::Faulted(Fault::new(error))
    }

    /// Captures a plain message as a [`TaskError::Faulted`] at the caller's location.
    #[track_caller]
    pub fn msg(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Faulted(Fault::msg(message))
    }

    pub fn canceled(cancellation: Cancellation) -> Self {
        Self::Canceled(Canceled::new(cancellation))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }

    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            Self::Faulted(fault) => Some(fault),
            Self::Canceled(_) => None,
        }
    }
}

impl From<Fault> for TaskError {
    fn from(fault: Fault) -> Self {
        Self::Faulted(fault)
    }
}

impl From<Canceled> for TaskError {
    fn from(canceled: Canceled) -> Self {
        Self::Canceled(canceled)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled(canceled) => fmt::Display::fmt(canceled, f),
            Self::Faulted(fault) => fmt::Display::fmt(fault, f),
        }
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled(canceled) => f.debug_tuple("Canceled").field(canceled).finish(),
            Self::Faulted(fault) => f.debug_tuple("Faulted").field(fault).finish(),
        }
    }
}

impl Error for TaskError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Canceled(_) => None,
            Self::Faulted(fault) => fault.source(),
        }
    }
}

// === impl Fault ===

impl Fault {
    #[track_caller]
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::with_location(Repr::Error(Box::new(error)), Location::caller())
    }

    #[track_caller]
    pub fn msg(message: impl Into<Cow<'static, str>>) -> Self {
        Self::with_location(Repr::Message(message.into()), Location::caller())
    }

    pub(crate) fn from_panic(
        payload: Box<dyn Any + Send + 'static>,
        location: &'static Location<'static>,
    ) -> Self {
        let message = payload_as_str(payload.as_ref()).map(String::from);
        Self::with_location(Repr::Panic(message), location)
    }

    fn with_location(repr: Repr, location: &'static Location<'static>) -> Self {
        Self(Arc::new(FaultInner { repr, location }))
    }

    /// Where the fault was captured.
    ///
    /// For panics inside a spawned computation this is the location the computation was spawned from.
    pub fn location(&self) -> &'static Location<'static> {
        self.0.location
    }

    /// Returns true if the fault was caused by a panic.
    pub fn is_panic(&self) -> bool {
        matches!(self.0.repr, Repr::Panic(_))
    }

    /// The panic message, if the fault was caused by a panic carrying a string payload.
    pub fn panic_message(&self) -> Option<&str> {
        match &self.0.repr {
            Repr::Panic(message) => message.as_deref(),
            _ => None,
        }
    }

    /// Attempts to downcast the captured error to a concrete type.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        match &self.0.repr {
            Repr::Error(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.repr {
            Repr::Error(error) => write!(f, "{error}")?,
            Repr::Message(message) => f.write_str(message)?,
            Repr::Panic(Some(message)) => write!(f, "panicked with message {message:?}")?,
            Repr::Panic(None) => f.write_str("panicked")?,
        }
        write!(f, " (at {})", self.0.location)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Fault");
        match &self.0.repr {
            Repr::Error(error) => s.field("error", error),
            Repr::Message(message) => s.field("message", message),
            Repr::Panic(message) => s.field("panic", message),
        };
        s.field("location", &self.0.location).finish()
    }
}

impl Error for Fault {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.0.repr {
            Repr::Error(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}

fn payload_as_str(payload: &(dyn Any + Send)) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        Some(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        Some(s.as_str())
    } else {
        None
    }
}

// === impl Canceled ===

impl Canceled {
    pub(crate) fn new(cancellation: Cancellation) -> Self {
        Self { cancellation }
    }

    /// The signal whose request caused the cancellation.
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }
}

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("operation was canceled")
    }
}

impl Error for Canceled {}

// === impl Misuse ===

impl fmt::Display for Misuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Misuse::NotCompleted => f.write_str("task result consumed while not yet completed"),
            Misuse::StaleHandle => {
                f.write_str("stale handle: token version does not match its source")
            }
            Misuse::AlreadyAwaited => {
                f.write_str("already awaited: a continuation is already registered")
            }
        }
    }
}

impl Error for Misuse {}

#[cold]
#[track_caller]
pub(crate) fn misuse(kind: Misuse) -> ! {
    panic!("{kind}")
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl Error for Boom {}

    #[test]
    fn fault_keeps_origin() {
        let line = line!() + 1;
        let err = TaskError::fault(Boom);
        let fault = err.as_fault().unwrap();

        assert_eq!(fault.location().line(), line);
        assert_eq!(fault.location().file(), file!());
        assert!(fault.downcast_ref::<Boom>().is_some());
        assert!(err.to_string().starts_with("boom (at "));
    }

    #[test]
    fn panic_payloads() {
        let fault = Fault::from_panic(Box::new("oh no"), Location::caller());
        assert!(fault.is_panic());
        assert_eq!(fault.panic_message(), Some("oh no"));

        let fault = Fault::from_panic(Box::new(String::from("formatted")), Location::caller());
        assert_eq!(fault.panic_message(), Some("formatted"));

        let fault = Fault::from_panic(Box::new(42_u32), Location::caller());
        assert_eq!(fault.panic_message(), None);
        assert!(fault.to_string().starts_with("panicked (at "));
    }

    #[test]
    fn canceled_is_distinct_from_faulted() {
        let err = TaskError::canceled(Cancellation::none());
        assert!(err.is_canceled());
        assert!(!err.is_faulted());
        assert!(err.as_fault().is_none());
        assert_eq!(err.to_string(), "operation was canceled");
    }
}
