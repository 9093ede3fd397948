//! Failure capture and reconciliation across isolation boundaries.
//!
//! A test body fails by panicking or by returning an `Err`. Either way the
//! failure is captured on the loop thread as a [`CapturedFailure`], tagged with
//! the boundary it was raised in, and carried back to the caller.
//!
//! [`ExceptionBridge::reconcile`] decides whether the caller can receive the
//! payload as-is. The payload type is owned by the home boundary when the
//! bridge's [`TypeRecognizer`] knows it, otherwise by the boundary the failure
//! came from. A failure owned by another boundary is encoded with the failure
//! type its code unit registered, round-tripped through the [`FailureCodec`],
//! and handed back as a [`RemoteFailure`] that keeps the original type name,
//! message, and trace. A payload type the unit never registered cannot make
//! the trip and yields an [`ErrorKind::Bridge`](crate::ErrorKind::Bridge)
//! error instead; the original is never silently replaced.
//!
//! Reconciliation needs the origin boundary's loaded units, so it must happen
//! before that boundary is released.

pub mod capture;
mod codec;
mod recognize;

pub use capture::{payload_message, PanicTrace};
pub use codec::{FailureCodec, FailureEnvelope, JsonCodec, RemoteFailure};
pub use recognize::{HomeTypes, TypeRecognizer};

use crate::error::{Error, Result};
use crate::isolation::{current_boundary_id, BoundaryId, IsolationBoundary};
use crate::tracing_compat::{debug, error, warn};
use capture::PanicCapture;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// How a failure left the test body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Raised {
    /// The body panicked.
    Panic,
    /// The body returned an `Err`.
    Return,
}

/// A failure raised by a test body plus where it came from.
pub struct CapturedFailure {
    payload: Box<dyn Any + Send>,
    payload_type: TypeId,
    type_name: Option<String>,
    message: String,
    trace: Option<PanicTrace>,
    origin: BoundaryId,
    raised: Raised,
}

impl CapturedFailure {
    /// Captures a caught panic in the current boundary.
    pub(crate) fn from_panic(capture: PanicCapture) -> Self {
        let PanicCapture { payload, trace } = capture;
        let origin = current_boundary_id();
        let payload_type = Any::type_id(&*payload);
        let (type_name, message) = describe_payload(&*payload, payload_type, origin);
        Self {
            payload,
            payload_type,
            type_name,
            message,
            trace,
            origin,
            raised: Raised::Panic,
        }
    }

    /// Captures an error returned by a test body in the current boundary.
    pub fn from_error<E>(err: E) -> Self
    where
        E: std::error::Error + Send + 'static,
    {
        Self {
            message: err.to_string(),
            payload: Box::new(err),
            payload_type: TypeId::of::<E>(),
            type_name: Some(std::any::type_name::<E>().to_owned()),
            trace: None,
            origin: current_boundary_id(),
            raised: Raised::Return,
        }
    }

    fn from_remote(remote: RemoteFailure, raised: Raised) -> Self {
        Self {
            message: remote.to_string(),
            trace: remote.trace().cloned(),
            origin: remote.origin(),
            payload_type: TypeId::of::<RemoteFailure>(),
            type_name: Some(std::any::type_name::<RemoteFailure>().to_owned()),
            payload: Box::new(remote),
            raised,
        }
    }

    /// The failure payload.
    #[must_use]
    pub fn payload(&self) -> &(dyn Any + Send) {
        &*self.payload
    }

    /// Downcasts the payload.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }

    /// Returns true if the payload is a `T`.
    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.payload_type == TypeId::of::<T>()
    }

    /// Takes the payload out.
    #[must_use]
    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }

    /// Payload type name, when known.
    #[must_use]
    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    /// Failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Trace recorded where the failure was raised.
    #[must_use]
    pub fn trace(&self) -> Option<&PanicTrace> {
        self.trace.as_ref()
    }

    /// Boundary the failure was raised in.
    #[must_use]
    pub const fn origin(&self) -> BoundaryId {
        self.origin
    }

    /// How the failure left the body.
    #[must_use]
    pub const fn raised(&self) -> Raised {
        self.raised
    }

    /// Re-raises the failure on the current thread.
    ///
    /// The original payload is resumed without re-running the panic hook, so
    /// the recorded trace is what the next catch site sees.
    pub fn rethrow(self) -> ! {
        if self.raised == Raised::Return {
            error!(
                type_name = ?self.type_name,
                message = %self.message,
                "test body returned an error"
            );
        }
        PanicCapture {
            payload: self.payload,
            trace: self.trace,
        }
        .resume()
    }
}

impl fmt::Debug for CapturedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedFailure")
            .field("type_name", &self.type_name)
            .field("message", &self.message)
            .field("origin", &self.origin)
            .field("raised", &self.raised)
            .field("trace", &self.trace)
            .finish_non_exhaustive()
    }
}

fn describe_payload(
    payload: &(dyn Any + Send),
    payload_type: TypeId,
    origin: BoundaryId,
) -> (Option<String>, String) {
    if let Some(message) = payload_message(payload) {
        let name = if payload_type == TypeId::of::<String>() {
            std::any::type_name::<String>()
        } else {
            std::any::type_name::<&'static str>()
        };
        return (Some(name.to_owned()), message);
    }
    if let Some(err) = payload.downcast_ref::<Error>() {
        return (Some(std::any::type_name::<Error>().to_owned()), err.to_string());
    }
    if let Some(remote) = payload.downcast_ref::<RemoteFailure>() {
        return (
            Some(std::any::type_name::<RemoteFailure>().to_owned()),
            remote.to_string(),
        );
    }
    let registered = IsolationBoundary::lookup(origin).and_then(|b| b.failure_type(payload_type));
    match registered {
        Some(entry) => (
            Some(entry.type_name.to_owned()),
            (entry.describe)(payload).unwrap_or_default(),
        ),
        None => (None, "panic payload of unknown type".to_owned()),
    }
}

/// Reconciles failures with the home boundary.
#[derive(Clone)]
pub struct ExceptionBridge {
    codec: Arc<dyn FailureCodec>,
    recognizer: Arc<dyn TypeRecognizer>,
}

impl ExceptionBridge {
    /// Bridge with a custom codec and recognizer.
    pub fn new(codec: impl FailureCodec + 'static, recognizer: impl TypeRecognizer + 'static) -> Self {
        Self {
            codec: Arc::new(codec),
            recognizer: Arc::new(recognizer),
        }
    }

    /// The boundary that owns the bridge itself.
    #[must_use]
    pub const fn home(&self) -> BoundaryId {
        BoundaryId::HOME
    }

    /// The boundary owning the failure's payload type.
    #[must_use]
    pub fn owner_of(&self, failure: &CapturedFailure) -> BoundaryId {
        if self.recognizer.recognizes(failure.payload_type) {
            self.home()
        } else {
            failure.origin
        }
    }

    /// Returns a failure whose payload the home boundary recognizes.
    ///
    /// Failures already owned by home come back unchanged, payload identity
    /// intact. Others are rebuilt as a [`RemoteFailure`].
    pub fn reconcile(&self, failure: CapturedFailure) -> Result<CapturedFailure> {
        let owner = self.owner_of(&failure);
        if owner == self.home() {
            return Ok(failure);
        }
        let type_name = failure.type_name.clone();
        let Some(boundary) = IsolationBoundary::lookup(owner) else {
            return Err(Error::bridge(
                format!("{owner} was released before its failure could be reconstructed"),
                type_name.as_deref(),
                owner,
            ));
        };
        let Some(entry) = boundary.failure_type(failure.payload_type) else {
            warn!(
                boundary = %owner,
                type_name = ?type_name,
                message = %failure.message,
                "failure type is not serializable across the boundary"
            );
            let shown = type_name.as_deref().unwrap_or("<unknown type>");
            return Err(Error::bridge(
                format!(
                    "failure of type `{shown}` is not registered as serializable and cannot cross {owner}; original message: {}",
                    failure.message
                ),
                type_name.as_deref(),
                owner,
            ));
        };
        let body = match (entry.encode)(failure.payload()) {
            Some(Ok(body)) => body,
            Some(Err(e)) => {
                return Err(Error::bridge(
                    format!("failed to serialize `{}`: {e}", entry.type_name),
                    Some(entry.type_name),
                    owner,
                ))
            }
            None => {
                return Err(Error::internal(format!(
                    "registered encoder for `{}` rejected its own type",
                    entry.type_name
                )))
            }
        };
        let envelope = FailureEnvelope {
            type_name: entry.type_name.to_owned(),
            message: failure.message.clone(),
            trace: failure.trace.clone(),
            origin: failure.origin,
            body: Some(body),
        };
        let bytes = self.codec.encode(&envelope)?;
        let remote = RemoteFailure::from(self.codec.decode(&bytes)?);
        debug!(
            boundary = %owner,
            type_name = %entry.type_name,
            codec = self.codec.name(),
            bytes = bytes.len(),
            "failure reconstructed for home boundary"
        );
        Ok(CapturedFailure::from_remote(remote, failure.raised))
    }

    /// Reconciles the failure carried by `err`, if any.
    ///
    /// A reconciliation failure replaces `err` with the bridge error.
    #[must_use]
    pub fn reconcile_error(&self, err: Error) -> Error {
        let kind = err.kind();
        let Some(failure) = err.failure() else {
            return err;
        };
        if self.owner_of(failure) == self.home() {
            return err;
        }
        let context = err.context().clone();
        let Some(failure) = err.into_failure() else {
            return Error::internal("failure vanished during reconciliation");
        };
        match self.reconcile(failure) {
            Ok(reconciled) => Error::new(kind)
                .with_context(context)
                .replace_failure(reconciled),
            Err(bridge_err) => bridge_err,
        }
    }

    /// Reconciles and re-raises `failure`.
    pub fn rethrow(&self, failure: CapturedFailure) -> ! {
        match self.reconcile(failure) {
            Ok(failure) => failure.rethrow(),
            Err(err) => err.rethrow(),
        }
    }
}

impl Default for ExceptionBridge {
    fn default() -> Self {
        Self::new(JsonCodec, HomeTypes::new())
    }
}

impl fmt::Debug for ExceptionBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionBridge")
            .field("codec", &self.codec.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::isolation::{CodeUnit, UnitBuilder, UnitCatalog};
    use crate::test_utils::init_test_logging;
    use serde::Serialize;

    #[derive(Debug, Serialize)]
    struct Overheated {
        kelvin: u32,
    }

    impl fmt::Display for Overheated {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "core at {}K", self.kelvin)
        }
    }

    impl std::error::Error for Overheated {}

    #[derive(Debug)]
    struct Opaque;

    impl fmt::Display for Opaque {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("opaque failure")
        }
    }

    impl std::error::Error for Opaque {}

    /// Registered, but its body never serializes.
    #[derive(Debug)]
    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("sensor handle has no portable form"))
        }
    }

    impl fmt::Display for Unencodable {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("sensor lost")
        }
    }

    impl std::error::Error for Unencodable {}

    fn load_thermal(unit: &mut UnitBuilder) {
        unit.failure_type::<Overheated>();
        unit.failure_type::<Unencodable>();
    }

    static THERMAL: CodeUnit = CodeUnit::new("bridge-tests::thermal", load_thermal);

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    /// A boundary with the thermal unit loaded.
    fn thermal_boundary() -> IsolationBoundary {
        UnitCatalog::publish(&THERMAL);
        let boundary = IsolationBoundary::create().expect("create boundary");
        boundary.load(THERMAL.location()).expect("load unit");
        boundary
    }

    #[test]
    fn home_failures_pass_through_unchanged() {
        init_test("home_failures_pass_through_unchanged");
        let failure = CapturedFailure::from_error(Overheated { kelvin: 300 });
        assert!(failure.origin().is_home());
        let bridge = ExceptionBridge::default();
        let same = bridge.reconcile(failure).expect("home failure");
        let original = same.downcast_ref::<Overheated>().map(|o| o.kelvin);
        crate::assert_with_log!(original == Some(300), "payload identity intact", Some(300), original);
        crate::test_complete!("home_failures_pass_through_unchanged");
    }

    #[test]
    fn foreign_failure_becomes_remote_failure() {
        init_test("foreign_failure_becomes_remote_failure");
        let boundary = thermal_boundary();
        let failure = {
            let _inside = boundary.enter();
            CapturedFailure::from_error(Overheated { kelvin: 412 })
        };
        assert_eq!(failure.origin(), boundary.id());

        let bridge = ExceptionBridge::default();
        assert_eq!(bridge.owner_of(&failure), boundary.id());
        let rebuilt = bridge.reconcile(failure).expect("registered type crosses");
        boundary.release();

        let remote = rebuilt.downcast_ref::<RemoteFailure>().expect("remote failure");
        crate::assert_with_log!(
            remote.message() == "core at 412K",
            "message preserved",
            "core at 412K",
            remote.message()
        );
        assert!(remote.type_name().ends_with("Overheated"));
        assert!(rebuilt.message().contains("core at 412K"));
        assert_eq!(rebuilt.raised(), Raised::Return);
        assert_eq!(bridge.owner_of(&rebuilt), BoundaryId::HOME);
        crate::test_complete!("foreign_failure_becomes_remote_failure");
    }

    #[test]
    fn unregistered_type_is_a_bridge_error() {
        init_test("unregistered_type_is_a_bridge_error");
        let boundary = thermal_boundary();
        let failure = {
            let _inside = boundary.enter();
            CapturedFailure::from_error(Opaque)
        };
        let err = ExceptionBridge::default()
            .reconcile(failure)
            .expect_err("opaque type cannot cross");
        boundary.release();
        assert_eq!(err.kind(), ErrorKind::Bridge);
        let shown = err.to_string();
        crate::assert_with_log!(
            shown.contains("Opaque") && shown.contains("opaque failure"),
            "bridge error names type and message",
            "Opaque / opaque failure",
            shown
        );
        crate::test_complete!("unregistered_type_is_a_bridge_error");
    }

    #[test]
    fn registered_type_that_fails_to_serialize_is_a_bridge_error() {
        init_test("registered_type_that_fails_to_serialize_is_a_bridge_error");
        let boundary = thermal_boundary();
        let failure = {
            let _inside = boundary.enter();
            CapturedFailure::from_error(Unencodable)
        };
        let err = ExceptionBridge::default()
            .reconcile(failure)
            .expect_err("body cannot be encoded");
        boundary.release();
        assert_eq!(err.kind(), ErrorKind::Bridge);
        let shown = err.to_string();
        crate::assert_with_log!(
            shown.contains("failed to serialize") && shown.contains("no portable form"),
            "serializer error is reported",
            "failed to serialize ... no portable form",
            shown
        );
        assert!(err.context().type_name.as_deref().is_some_and(|t| t.ends_with("Unencodable")));
        crate::test_complete!("registered_type_that_fails_to_serialize_is_a_bridge_error");
    }

    #[test]
    fn reconcile_after_release_is_a_bridge_error() {
        init_test("reconcile_after_release_is_a_bridge_error");
        let boundary = thermal_boundary();
        let failure = {
            let _inside = boundary.enter();
            CapturedFailure::from_error(Overheated { kelvin: 500 })
        };
        boundary.release();
        let err = ExceptionBridge::default()
            .reconcile(failure)
            .expect_err("released boundary");
        assert_eq!(err.kind(), ErrorKind::Bridge);
        crate::test_complete!("reconcile_after_release_is_a_bridge_error");
    }

    #[test]
    fn recognizer_additions_keep_payload() {
        init_test("recognizer_additions_keep_payload");
        let boundary = thermal_boundary();
        let failure = {
            let _inside = boundary.enter();
            CapturedFailure::from_error(Opaque)
        };
        let bridge = ExceptionBridge::new(JsonCodec, HomeTypes::new().with::<Opaque>());
        let kept = bridge.reconcile(failure).expect("recognized at home");
        boundary.release();
        assert!(kept.is::<Opaque>());
        crate::test_complete!("recognizer_additions_keep_payload");
    }
}
