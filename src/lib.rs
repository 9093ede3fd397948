//! Affinity harness: run test bodies on a dedicated priority event loop,
//! optionally inside an unloadable isolation boundary.
//!
//! # Overview
//!
//! A test type declares capabilities ([`capability`]); the
//! [`AsyncTestCapability`] gives it [`AsyncTest::run_test`] and
//! [`AsyncTest::run_test_async`]. Each run:
//!
//! 1. reads [`AsyncTestState::use_isolation`] from the instance's capability
//!    states;
//! 2. in direct mode, runs the body on a fresh single-threaded
//!    [`EventLoop`] in its own thread;
//! 3. in isolated mode, creates an [`IsolationBoundary`], loads the harness
//!    and the test's code unit into it, and re-enters the harness there by
//!    name; the boundary is released when the run ends;
//! 4. returns the body's failure to the caller, reconstructed by the
//!    [`ExceptionBridge`] when its type belongs to the boundary.
//!
//! # Event loop
//!
//! Work is queued with a [`Priority`]. Among pending work the highest priority
//! runs first, FIFO within a priority, and nothing is preempted once started.
//! Awaiting an [`Operation`] resumes on the same loop thread.
//!
//! # Logging
//!
//! With the default `tracing-integration` feature the crate emits `tracing`
//! events for loop start/stop, boundary lifecycle, and failure
//! reconstruction.

pub mod bridge;
pub mod capability;
pub mod config;
pub mod error;
pub mod isolation;
pub mod runner;
pub mod runtime;
pub mod tracing_compat;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bridge::{
    CapturedFailure, ExceptionBridge, FailureCodec, FailureEnvelope, HomeTypes, JsonCodec,
    PanicTrace, Raised, RemoteFailure, TypeRecognizer,
};
pub use capability::{
    AutoTest, Capability, CapabilityDecl, CapabilityStates, DeclaresCapabilities, StateDecl,
};
pub use config::HarnessConfig;
pub use error::{Error, ErrorCategory, ErrorContext, ErrorKind, Result};
pub use isolation::{
    current_boundary_id, unit_static, BodyShape, BoundaryId, CodeUnit, IsolatedContext,
    IsolationBoundary, MethodRef, RemoteCallDescriptor, UnitBuilder, UnitCatalog, UnloadWitness,
};
pub use runner::{
    AsyncBody, AsyncTest, AsyncTestCapability, AsyncTestState, SyncBody, TestOutcome, TestRunner,
};
pub use runtime::{
    run_on_dedicated_thread, yield_now, Dispatcher, EventLoop, LoopHandle, Operation, Priority,
};
