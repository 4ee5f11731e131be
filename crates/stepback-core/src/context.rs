//! Execution contexts.
//!
//! A context is the runtime scope a unit's entities live in. The codec never
//! serializes one: a context handle is written as its name, and decoding asks
//! the target context for a child of that name. The context also carries the
//! type registry used to resolve type and species names at decode time.

use crate::registry::TypeRegistry;
use std::sync::Arc;

#[derive(Debug)]
pub struct Context {
    name: String,
    types: Arc<TypeRegistry>,
}

impl Context {
    pub fn new(name: impl Into<String>, types: Arc<TypeRegistry>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            types,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// A named child context sharing this context's type registry.
    pub fn child(&self, name: &str) -> Arc<Context> {
        Context::new(name, Arc::clone(&self.types))
    }
}

/// Contexts compare by name: a decoded handle equals the one that was encoded
/// when the target context hands out a child of the same name.
impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
