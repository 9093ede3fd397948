//! Which payload types belong to the home boundary.

use super::codec::RemoteFailure;
use crate::error::Error;
use std::any::TypeId;

/// Decides whether a payload type is recognized on the home side.
pub trait TypeRecognizer: Send + Sync {
    /// Returns true if values of `type_id` can be handed to home code as-is.
    fn recognizes(&self, type_id: TypeId) -> bool;
}

/// Default recognizer: std panic payloads, the crate's error types, and any
/// types added with [`HomeTypes::with`].
#[derive(Debug, Clone)]
pub struct HomeTypes {
    known: Vec<TypeId>,
}

impl HomeTypes {
    /// The built-in set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            known: vec![
                TypeId::of::<String>(),
                TypeId::of::<&'static str>(),
                TypeId::of::<Error>(),
                TypeId::of::<RemoteFailure>(),
            ],
        }
    }

    /// Adds `T` to the recognized set.
    #[must_use]
    pub fn with<T: 'static>(mut self) -> Self {
        let id = TypeId::of::<T>();
        if !self.known.contains(&id) {
            self.known.push(id);
        }
        self
    }
}

impl Default for HomeTypes {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRecognizer for HomeTypes {
    fn recognizes(&self, type_id: TypeId) -> bool {
        self.known.contains(&type_id)
    }
}
