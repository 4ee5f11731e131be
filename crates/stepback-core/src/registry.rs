use crate::id::TypeId;
use std::collections::HashMap;

/// Names of the types every registry built with
/// [`TypeRegistryBuilder::with_builtins`] knows, with their parametric flag.
pub const BUILTIN_TYPES: &[(&str, bool)] = &[
    ("unknown", false),
    ("bool", false),
    ("int", false),
    ("float", false),
    ("string", false),
    ("type", false),
    ("geometry", false),
    ("agent", false),
    ("context", false),
    ("list", true),
    ("map", true),
    ("pair", true),
    ("container", true),
];

/// Species every model has: the unit root entity.
pub const ROOT_SPECIES: &str = "simulation";

/// What a registered name denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Builtin,
    /// A model species; entities of this species can be decoded.
    Species,
}

/// A type definition in the registry.
#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: String,
    /// Parametric (container-like) types carry key/content descriptors.
    pub parametric: bool,
    pub kind: TypeKind,
}

/// Builder for constructing an immutable [`TypeRegistry`].
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    types: Vec<TypeDef>,
    name_to_id: HashMap<String, TypeId>,
    duplicates: Vec<String>,
}

impl TypeRegistryBuilder {
    /// An empty builder. Most callers want [`TypeRegistryBuilder::with_builtins`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder pre-loaded with the builtin types and the root species.
    pub fn with_builtins() -> Self {
        let mut b = Self::new();
        for &(name, parametric) in BUILTIN_TYPES {
            b.push(name, parametric, TypeKind::Builtin);
        }
        b.register_species(ROOT_SPECIES);
        b
    }

    /// Register a builtin-style type. Returns its ID.
    pub fn register_type(&mut self, name: &str, parametric: bool) -> TypeId {
        self.push(name, parametric, TypeKind::Builtin)
    }

    /// Register a model species. Returns its ID.
    pub fn register_species(&mut self, name: &str) -> TypeId {
        self.push(name, false, TypeKind::Species)
    }

    fn push(&mut self, name: &str, parametric: bool, kind: TypeKind) -> TypeId {
        if let Some(&id) = self.name_to_id.get(name) {
            self.duplicates.push(name.to_string());
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeDef {
            name: name.to_string(),
            parametric,
            kind,
        });
        self.name_to_id.insert(name.to_string(), id);
        id
    }

    /// Lookup type ID by name.
    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.name_to_id.get(name).copied()
    }

    /// Finalize and build the immutable registry.
    pub fn build(self) -> Result<TypeRegistry, RegistryError> {
        if let Some(name) = self.duplicates.into_iter().next() {
            return Err(RegistryError::Duplicate(name));
        }
        if self.types.iter().any(|t| t.name.is_empty()) {
            return Err(RegistryError::EmptyName);
        }
        Ok(TypeRegistry {
            types: self.types,
            name_to_id: self.name_to_id,
        })
    }
}

/// Immutable registry. Frozen after build(). Thread-safe to share.
#[derive(Debug)]
pub struct TypeRegistry {
    types: Vec<TypeDef>,
    name_to_id: HashMap<String, TypeId>,
}

impl TypeRegistry {
    /// Registry holding only the builtin types and the root species.
    pub fn builtin() -> Self {
        let b = TypeRegistryBuilder::with_builtins();
        Self {
            types: b.types,
            name_to_id: b.name_to_id,
        }
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeDef> {
        self.types.get(id.0 as usize)
    }

    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.name_to_id.get(name).copied()
    }

    /// Resolve a type name to its definition.
    pub fn lookup(&self, name: &str) -> Option<&TypeDef> {
        self.type_id(name).and_then(|id| self.get(id))
    }

    pub fn is_species(&self, name: &str) -> bool {
        self.lookup(name)
            .map(|t| t.kind == TypeKind::Species)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("type `{0}` registered twice")]
    Duplicate(String),
    #[error("type names must not be empty")]
    EmptyName,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_builder() -> TypeRegistryBuilder {
        let mut b = TypeRegistryBuilder::with_builtins();
        b.register_species("ant");
        b.register_species("nest");
        b
    }

    #[test]
    fn register_and_build() {
        let reg = setup_builder().build().unwrap();
        assert_eq!(reg.len(), BUILTIN_TYPES.len() + 3);
        assert!(reg.is_species("ant"));
        assert!(reg.is_species(ROOT_SPECIES));
        assert!(!reg.is_species("int"));
    }

    #[test]
    fn lookup_by_name() {
        let reg = setup_builder().build().unwrap();
        let map = reg.lookup("map").unwrap();
        assert!(map.parametric);
        assert_eq!(map.kind, TypeKind::Builtin);
        assert!(reg.lookup("nonexistent").is_none());
    }

    #[test]
    fn duplicate_registration_fails_at_build() {
        let mut b = setup_builder();
        let first = b.type_id("ant").unwrap();
        assert_eq!(b.register_species("ant"), first);
        match b.build() {
            Err(RegistryError::Duplicate(name)) => assert_eq!(name, "ant"),
            other => panic!("expected Duplicate, got: {other:?}"),
        }
    }

    #[test]
    fn empty_name_rejected() {
        let mut b = TypeRegistryBuilder::new();
        b.register_type("", false);
        assert!(matches!(b.build(), Err(RegistryError::EmptyName)));
    }

    #[test]
    fn builtin_registry_matches_builder() {
        let reg = TypeRegistry::builtin();
        assert_eq!(reg.len(), BUILTIN_TYPES.len() + 1);
        assert!(reg.get(TypeId(999)).is_none());
        assert!(!reg.is_empty());
    }
}
