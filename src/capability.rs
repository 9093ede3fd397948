//! Capability declarations and per-instance capability state.
//!
//! A test type opts into cross-cutting behavior by declaring capabilities.
//! Each capability names at most one state type. When a test instance is
//! built, [`CapabilityStates::from_declarations`] constructs exactly one state
//! object per distinct state type; capabilities naming the same state type
//! share that single instance.
//!
//! Declarations are a static table rather than runtime introspection:
//!
//! ```ignore
//! use affinity_harness::{capabilities, AsyncTestCapability, AutoTest, CapabilityStates,
//!                        DeclaresCapabilities};
//!
//! struct PriorityTests { states: CapabilityStates }
//!
//! impl DeclaresCapabilities for PriorityTests {
//!     fn declared_capabilities() -> Vec<CapabilityDecl> {
//!         capabilities![AsyncTestCapability]
//!     }
//! }
//! ```

use crate::error::{Error, Result};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

/// A marker capability a test type may declare.
pub trait Capability: 'static {
    /// Human-readable capability name used in diagnostics.
    const NAME: &'static str;

    /// The state type backing this capability, if it has one.
    fn state() -> Option<StateDecl>;
}

/// Identity and constructor of a capability state type.
#[derive(Clone, Copy)]
pub struct StateDecl {
    type_id: TypeId,
    type_name: &'static str,
    construct: fn() -> Box<dyn Any + Send>,
}

impl StateDecl {
    /// Declares `S` as a capability state, constructed with `Default`.
    #[must_use]
    pub fn of<S: Default + Send + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<S>(),
            type_name: std::any::type_name::<S>(),
            construct: || Box::new(S::default()),
        }
    }

    /// The state type's identity.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The state type's name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for StateDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDecl")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// One entry of a test type's static capability table.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityDecl {
    capability: TypeId,
    name: &'static str,
    state: Option<StateDecl>,
}

impl CapabilityDecl {
    /// Builds the declaration for capability `C`.
    #[must_use]
    pub fn of<C: Capability>() -> Self {
        Self {
            capability: TypeId::of::<C>(),
            name: C::NAME,
            state: C::state(),
        }
    }

    /// Capability name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Associated state declaration, if any.
    #[must_use]
    pub const fn state(&self) -> Option<StateDecl> {
        self.state
    }
}

/// Builds a `Vec<CapabilityDecl>` from capability types.
#[macro_export]
macro_rules! capabilities {
    ($($cap:ty),* $(,)?) => {
        vec![$($crate::capability::CapabilityDecl::of::<$cap>()),*]
    };
}

/// Implemented by test types to expose their static capability table.
pub trait DeclaresCapabilities {
    /// The capabilities this type declares.
    fn declared_capabilities() -> Vec<CapabilityDecl>;

    /// Builds a fresh state registry for a new instance of this type.
    #[must_use]
    fn new_capability_states() -> CapabilityStates {
        CapabilityStates::from_declarations(&Self::declared_capabilities())
    }
}

/// Per-instance registry of capability state objects, keyed by state type.
pub struct CapabilityStates {
    states: HashMap<TypeId, (&'static str, Box<dyn Any + Send>)>,
}

impl CapabilityStates {
    /// Constructs one state per distinct state type named by `decls`.
    ///
    /// Duplicate capabilities, and distinct capabilities sharing a state type,
    /// produce a single instance. Capabilities without state contribute nothing.
    #[must_use]
    pub fn from_declarations(decls: &[CapabilityDecl]) -> Self {
        let mut seen_capabilities = Vec::with_capacity(decls.len());
        let mut states = HashMap::new();
        for decl in decls {
            if seen_capabilities.contains(&decl.capability) {
                continue;
            }
            seen_capabilities.push(decl.capability);
            let Some(state) = decl.state else { continue };
            states
                .entry(state.type_id)
                .or_insert_with(|| (state.type_name, (state.construct)()));
        }
        crate::tracing_compat::trace!(
            capabilities = seen_capabilities.len(),
            states = states.len(),
            "capability states constructed"
        );
        Self { states }
    }

    /// An empty registry (no declared capabilities).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            states: HashMap::new(),
        }
    }

    /// Returns the state of type `T`.
    pub fn get<T: 'static>(&self) -> Result<&T> {
        self.states
            .get(&TypeId::of::<T>())
            .and_then(|(_, state)| state.downcast_ref::<T>())
            .ok_or_else(|| Error::lookup(std::any::type_name::<T>()))
    }

    /// Returns the state of type `T` mutably.
    pub fn get_mut<T: 'static>(&mut self) -> Result<&mut T> {
        self.states
            .get_mut(&TypeId::of::<T>())
            .and_then(|(_, state)| state.downcast_mut::<T>())
            .ok_or_else(|| Error::lookup(std::any::type_name::<T>()))
    }

    /// Returns true if some declared capability provides `T`.
    #[must_use]
    pub fn contains<T: 'static>(&self) -> bool {
        self.states.contains_key(&TypeId::of::<T>())
    }

    /// Number of distinct state objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if no state objects exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Names of the constructed state types, sorted.
    #[must_use]
    pub fn state_type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.states.values().map(|(name, _)| *name).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for CapabilityStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityStates")
            .field("states", &self.state_type_names())
            .finish()
    }
}

/// A test type carrying a capability state registry.
pub trait AutoTest {
    /// The instance's capability states.
    fn capability_states(&self) -> &CapabilityStates;

    /// The instance's capability states, mutably.
    fn capability_states_mut(&mut self) -> &mut CapabilityStates;

    /// Shorthand for `capability_states().get::<T>()`.
    fn state<T: 'static>(&self) -> Result<&T> {
        self.capability_states().get::<T>()
    }

    /// Shorthand for `capability_states_mut().get_mut::<T>()`.
    fn state_mut<T: 'static>(&mut self) -> Result<&mut T> {
        self.capability_states_mut().get_mut::<T>()
    }
}
