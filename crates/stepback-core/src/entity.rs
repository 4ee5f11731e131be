//! Live entities and their populations.
//!
//! A unit's state is a tree: the root entity owns populations, each
//! population owns member entities, and members may own populations of their
//! own. Cross links between entities are [`Value::Entity`] addresses, never
//! ownership, so the tree stays acyclic even when the model graph is not.

use crate::reference::EntityRef;
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::BTreeMap;

/// A live, serializable model object (an agent).
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    species: String,
    index: u32,
    attributes: IndexMap<String, Value>,
    populations: IndexMap<String, Population>,
}

impl Entity {
    pub fn new(species: impl Into<String>, index: u32) -> Self {
        Self {
            species: species.into(),
            index,
            attributes: IndexMap::new(),
            populations: IndexMap::new(),
        }
    }

    pub fn species(&self) -> &str {
        &self.species
    }

    /// Index inside the owning population.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.attributes.get_mut(name)
    }

    /// Set an attribute, returning the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes.insert(name.into(), value)
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.shift_remove(name)
    }

    /// Attributes in insertion order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    pub fn population(&self, species: &str) -> Option<&Population> {
        self.populations.get(species)
    }

    pub fn population_mut(&mut self, species: &str) -> Option<&mut Population> {
        self.populations.get_mut(species)
    }

    /// Get the population for `species`, creating an empty one if absent.
    pub fn ensure_population(&mut self, species: &str) -> &mut Population {
        self.populations
            .entry(species.to_string())
            .or_insert_with(|| Population::new(species))
    }

    /// Install a population, replacing any population of the same species.
    pub fn insert_population(&mut self, population: Population) -> Option<Population> {
        self.populations
            .insert(population.species().to_string(), population)
    }

    pub fn populations(&self) -> impl Iterator<Item = &Population> {
        self.populations.values()
    }

    /// Total number of entities in this subtree, including `self`.
    pub fn count_entities(&self) -> usize {
        1 + self
            .populations
            .values()
            .flat_map(|p| p.iter())
            .map(Entity::count_entities)
            .sum::<usize>()
    }

    /// Call `f` for every entity reference held by any attribute in this
    /// subtree.
    pub fn visit_references(&self, f: &mut impl FnMut(&EntityRef)) {
        for value in self.attributes.values() {
            value.visit_references(f);
        }
        for member in self.populations.values().flat_map(|p| p.iter()) {
            member.visit_references(f);
        }
    }
}

/// The members of one species owned by an entity, keyed by index.
#[derive(Debug, Clone, PartialEq)]
pub struct Population {
    species: String,
    members: BTreeMap<u32, Entity>,
    next_index: u32,
}

impl Population {
    pub fn new(species: impl Into<String>) -> Self {
        Self {
            species: species.into(),
            members: BTreeMap::new(),
            next_index: 0,
        }
    }

    pub(crate) fn with_next_index(species: impl Into<String>, next_index: u32) -> Self {
        Self {
            next_index,
            ..Self::new(species)
        }
    }

    pub fn species(&self) -> &str {
        &self.species
    }

    /// The index the next spawned member will receive.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Create a new member with the next free index.
    ///
    /// Indices are never reused. Once `u32::MAX` is handed out the counter
    /// stays there and further spawns return that member.
    pub fn spawn(&mut self) -> &mut Entity {
        let index = self.next_index;
        self.next_index = index.saturating_add(1);
        self.members
            .entry(index)
            .or_insert_with(|| Entity::new(self.species.clone(), index))
    }

    /// Insert a member at its own index, replacing any existing member there.
    pub fn insert(&mut self, entity: Entity) -> Option<Entity> {
        self.next_index = self.next_index.max(entity.index.saturating_add(1));
        self.members.insert(entity.index, entity)
    }

    pub fn remove(&mut self, index: u32) -> Option<Entity> {
        self.members.remove(&index)
    }

    pub fn get(&self, index: u32) -> Option<&Entity> {
        self.members.get(&index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Entity> {
        self.members.get_mut(&index)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.members.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.members.values_mut()
    }
}
