//! Error types for the harness.
//!
//! Every fallible operation returns [`Result`]. Errors carry an [`ErrorKind`]
//! for programmatic handling, an optional message, optional diagnostic
//! [`ErrorContext`], and, for test failures, the [`CapturedFailure`] that was
//! raised by the test body.
//!
//! # Error Categories
//!
//! - **Programmer**: the harness was used incorrectly (undeclared capability
//!   state, unresolvable method, nested isolation, bad configuration)
//! - **Test**: the test body failed
//! - **Boundary**: a failure could not cross an isolation boundary, or a
//!   released boundary was used
//! - **Runtime**: the event loop itself faulted, or a harness invariant broke

use core::fmt;

use crate::bridge::CapturedFailure;
use crate::isolation::BoundaryId;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A capability state was requested that no declared capability provides.
    Lookup,
    /// The test body failed.
    TestFailed,
    /// A failure could not be reconstructed on the receiving side of a boundary.
    Bridge,
    /// An action outside the test body's own failure path faulted the loop.
    LoopFaulted,
    /// A code unit, type, method, or entry point could not be resolved.
    Resolve,
    /// Dispatch was attempted into a boundary that has been released.
    BoundaryReleased,
    /// Isolation was requested from inside an isolation boundary.
    NestedIsolation,
    /// Invalid harness configuration.
    Config,
    /// Harness bug or broken invariant.
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Lookup | Self::Resolve | Self::NestedIsolation | Self::Config => {
                ErrorCategory::Programmer
            }
            Self::TestFailed => ErrorCategory::Test,
            Self::Bridge | Self::BoundaryReleased => ErrorCategory::Boundary,
            Self::LoopFaulted | Self::Internal => ErrorCategory::Runtime,
        }
    }

    /// Returns true if the error should be reported as a failure of the test
    /// itself rather than of the harness.
    ///
    /// A faulted loop is reported like a test failure.
    #[must_use]
    pub const fn is_test_failure(&self) -> bool {
        matches!(self, Self::TestFailed | Self::LoopFaulted)
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Lookup => "capability state lookup failed",
            Self::TestFailed => "test failed",
            Self::Bridge => "failure could not cross isolation boundary",
            Self::LoopFaulted => "event loop faulted",
            Self::Resolve => "resolution failed",
            Self::BoundaryReleased => "isolation boundary already released",
            Self::NestedIsolation => "nested isolation is not supported",
            Self::Config => "invalid harness configuration",
            Self::Internal => "internal harness error",
        }
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Misuse of the harness; never retried.
    Programmer,
    /// Failure raised by the test body.
    Test,
    /// Isolation boundary failures.
    Boundary,
    /// Event loop or internal failures.
    Runtime,
}

/// Diagnostic context for an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Boundary in which the error was raised.
    pub boundary: Option<BoundaryId>,
    /// Code unit location involved in the error.
    pub unit: Option<String>,
    /// Type name involved in the error.
    pub type_name: Option<String>,
    /// Method or entry point name involved in the error.
    pub method: Option<String>,
}

/// The main error type for harness operations.
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    context: ErrorContext,
    failure: Option<Box<CapturedFailure>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            context: ErrorContext {
                boundary: None,
                unit: None,
                type_name: None,
                method: None,
            },
            failure: None,
        }
    }

    /// Creates a test-failure error carrying the captured failure.
    #[must_use]
    pub fn test_failed(failure: CapturedFailure) -> Self {
        Self::with_failure(ErrorKind::TestFailed, failure)
    }

    /// Creates a loop-fault error carrying the captured failure.
    #[must_use]
    pub fn loop_faulted(failure: CapturedFailure) -> Self {
        Self::with_failure(ErrorKind::LoopFaulted, failure)
    }

    fn with_failure(kind: ErrorKind, failure: CapturedFailure) -> Self {
        let boundary = failure.origin();
        let mut err = Self::new(kind).with_message(failure.message().to_owned());
        err.context.boundary = Some(boundary);
        err.failure = Some(Box::new(failure));
        err
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds structured context to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        self.context = ctx;
        self
    }

    /// Returns the message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the diagnostic context.
    #[must_use]
    pub const fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Returns the captured test failure, if this error carries one.
    #[must_use]
    pub fn failure(&self) -> Option<&CapturedFailure> {
        self.failure.as_deref()
    }

    /// Takes the captured test failure out of the error.
    #[must_use]
    pub fn into_failure(self) -> Option<CapturedFailure> {
        self.failure.map(|f| *f)
    }

    /// Swaps the carried failure, keeping kind and context.
    pub(crate) fn replace_failure(mut self, failure: CapturedFailure) -> Self {
        self.message = Some(failure.message().to_owned());
        self.failure = Some(Box::new(failure));
        self
    }

    /// Re-raises the error on the current thread.
    ///
    /// An error carrying a captured failure resumes the original panic payload
    /// (or the reconstructed one) without re-running the panic hook. Any other
    /// error panics with the `Error` itself as payload.
    pub fn rethrow(self) -> ! {
        match self.failure {
            Some(failure) => failure.rethrow(),
            None => std::panic::panic_any(self),
        }
    }

    /// Creates a lookup error for a state type nobody declared.
    #[must_use]
    pub fn lookup(type_name: &str) -> Self {
        Self::new(ErrorKind::Lookup)
            .with_message(format!("no declared capability provides state `{type_name}`"))
            .with_context(ErrorContext {
                type_name: Some(type_name.to_owned()),
                ..ErrorContext::default()
            })
    }

    /// Creates a resolution error.
    #[must_use]
    pub fn resolve(msg: impl Into<String>, ctx: ErrorContext) -> Self {
        Self::new(ErrorKind::Resolve).with_message(msg).with_context(ctx)
    }

    /// Creates a bridge error for a failure that could not be reconstructed.
    #[must_use]
    pub fn bridge(msg: impl Into<String>, type_name: Option<&str>, boundary: BoundaryId) -> Self {
        Self::new(ErrorKind::Bridge)
            .with_message(msg)
            .with_context(ErrorContext {
                boundary: Some(boundary),
                type_name: type_name.map(str::to_owned),
                ..ErrorContext::default()
            })
    }

    /// Creates an error for dispatch into a released boundary.
    #[must_use]
    pub fn released(boundary: BoundaryId) -> Self {
        Self::new(ErrorKind::BoundaryReleased)
            .with_message(format!("{boundary} no longer accepts dispatch"))
            .with_context(ErrorContext {
                boundary: Some(boundary),
                ..ErrorContext::default()
            })
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config).with_message(msg)
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(msg)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("context", &self.context)
            .field("failure", &self.failure)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.label())?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        if let Some(boundary) = self.context.boundary {
            if !boundary.is_home() {
                write!(f, " (in {boundary})")?;
            }
        }
        if let Some(trace) = self.failure.as_ref().and_then(|f| f.trace()) {
            write!(f, "\n{trace}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// Result alias for harness operations.
pub type Result<T> = std::result::Result<T, Error>;
