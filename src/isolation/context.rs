//! One isolated run: create a boundary, re-enter the harness inside it by
//! name, reconcile any failure, release.

use super::boundary::{IsolationBoundary, UnloadWitness};
use super::unit::{BodyShape, MethodRef, RemoteCallDescriptor, UnitCatalog};
use super::BoundaryId;
use crate::bridge::ExceptionBridge;
use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::runner::{harness_unit, REENTER_ENTRY};
use crate::tracing_compat::{debug, debug_span};
use serde::{Deserialize, Serialize};

/// Request passed to the harness re-entry entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ReentryRequest {
    pub(crate) call: RemoteCallDescriptor,
    pub(crate) config: HarnessConfig,
}

/// Releases the boundary on every exit path.
struct ReleaseOnDrop<'a>(&'a IsolationBoundary);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Runs a test method inside a fresh, unloadable boundary.
#[derive(Debug)]
pub struct IsolatedContext {
    boundary: IsolationBoundary,
    bridge: ExceptionBridge,
}

impl IsolatedContext {
    /// Creates the context and its boundary.
    ///
    /// Fails with `NestedIsolation` inside an existing boundary.
    pub fn create() -> Result<Self> {
        Ok(Self {
            boundary: IsolationBoundary::create()?,
            bridge: ExceptionBridge::default(),
        })
    }

    /// Uses `bridge` for failures leaving the boundary.
    #[must_use]
    pub fn with_bridge(mut self, bridge: ExceptionBridge) -> Self {
        self.bridge = bridge;
        self
    }

    /// Id of the boundary this context owns.
    #[must_use]
    pub fn boundary_id(&self) -> BoundaryId {
        self.boundary.id()
    }

    /// A reclamation witness for this context's boundary.
    #[must_use]
    pub fn witness(&self) -> UnloadWitness {
        self.boundary.witness()
    }

    /// Creates a context and runs `method` in it.
    pub fn create_and_run(method: &MethodRef, shape: BodyShape, config: &HarnessConfig) -> Result<()> {
        Self::create()?.run(method, shape, config)
    }

    /// Runs `method` inside the boundary, then releases it.
    ///
    /// The method's unit is published to the [`UnitCatalog`] so the boundary
    /// can load its own copy by location. A failure is reconciled through the
    /// bridge while the boundary is still live.
    pub fn run(self, method: &MethodRef, shape: BodyShape, config: &HarnessConfig) -> Result<()> {
        let _span = debug_span!("isolated_run", boundary = %self.boundary.id(), method = ?method).entered();
        let release = ReleaseOnDrop(&self.boundary);

        UnitCatalog::publish(method.unit());
        let request = ReentryRequest {
            call: method.descriptor(shape),
            config: config.clone(),
        };
        let bytes = serde_json::to_vec(&request)
            .map_err(|e| Error::internal(format!("failed to encode re-entry request: {e}")))?;

        let harness = harness_unit().location();
        let outcome = self
            .boundary
            .invoke_entry(harness, REENTER_ENTRY, &bytes)
            .map_err(|err| self.bridge.reconcile_error(err));

        drop(release);
        debug!(ok = outcome.is_ok(), "isolated run finished");
        outcome
    }
}
