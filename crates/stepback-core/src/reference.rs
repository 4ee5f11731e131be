//! Entity addressing by owner path.
//!
//! An [`EntityRef`] names an entity by the chain of populations that lead to
//! it from a unit's root entity: each step is a population species plus the
//! member's index inside that population. The empty path addresses the root
//! itself. The codec writes these instead of nested full encodings, which is
//! what keeps cyclic entity graphs finite on the wire.

use crate::entity::{Entity, Population};
use std::fmt;

/// One hop of an owner path: the population species and the member index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefStep {
    pub species: String,
    pub index: u32,
}

/// Address of an entity relative to a unit's root entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    steps: Vec<RefStep>,
}

impl EntityRef {
    /// The root entity of a unit.
    pub fn root() -> Self {
        Self { steps: Vec::new() }
    }

    /// Address of member `index` of population `species` owned by `self`.
    pub fn child(&self, species: impl Into<String>, index: u32) -> Self {
        let mut steps = self.steps.clone();
        steps.push(RefStep {
            species: species.into(),
            index,
        });
        Self { steps }
    }

    /// Rebuild a reference from parallel species/index columns.
    /// Returns `None` when the columns have different lengths.
    pub fn from_parts(species: Vec<String>, indices: Vec<u32>) -> Option<Self> {
        if species.len() != indices.len() {
            return None;
        }
        let steps = species
            .into_iter()
            .zip(indices)
            .map(|(species, index)| RefStep { species, index })
            .collect();
        Some(Self { steps })
    }

    /// Split into parallel species/index columns (the wire layout).
    pub fn to_parts(&self) -> (Vec<String>, Vec<u32>) {
        self.steps
            .iter()
            .map(|s| (s.species.clone(), s.index))
            .unzip()
    }

    pub fn is_root(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of hops from the root.
    pub fn depth(&self) -> usize {
        self.steps.len()
    }

    pub fn steps(&self) -> &[RefStep] {
        &self.steps
    }

    /// The last hop, or `None` for the root.
    pub fn last(&self) -> Option<&RefStep> {
        self.steps.last()
    }

    /// Address of the owning entity, or `None` for the root.
    pub fn parent(&self) -> Option<EntityRef> {
        if self.steps.is_empty() {
            return None;
        }
        Some(Self {
            steps: self.steps[..self.steps.len() - 1].to_vec(),
        })
    }

    /// Look the entity up under `root`.
    pub fn resolve<'a>(&self, root: &'a Entity) -> Option<&'a Entity> {
        let mut current = root;
        for step in &self.steps {
            current = current.population(&step.species)?.get(step.index)?;
        }
        Some(current)
    }

    /// Mutable variant of [`EntityRef::resolve`].
    pub fn resolve_mut<'a>(&self, root: &'a mut Entity) -> Option<&'a mut Entity> {
        let mut current = root;
        for step in &self.steps {
            current = current
                .population_mut(&step.species)?
                .get_mut(step.index)?;
        }
        Some(current)
    }

    /// The population that holds the addressed entity, or `None` for the root.
    pub fn owning_population<'a>(&self, root: &'a Entity) -> Option<&'a Population> {
        let last = self.last()?;
        let owner = self.parent()?.resolve(root)?;
        owner.population(&last.species)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "/");
        }
        for step in &self.steps {
            write!(f, "/{}[{}]", step.species, step.index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn colony() -> Entity {
        let mut root = Entity::new("simulation", 0);
        let ants = root.ensure_population("ant");
        ants.spawn().set("name", Value::from("a0"));
        let ant = ants.spawn();
        ant.set("name", Value::from("a1"));
        ant.ensure_population("egg").spawn().set("size", Value::Int(3));
        root
    }

    #[test]
    fn root_resolves_to_root() {
        let root = colony();
        let resolved = EntityRef::root().resolve(&root).unwrap();
        assert_eq!(resolved.species(), "simulation");
        assert!(EntityRef::root().parent().is_none());
    }

    #[test]
    fn nested_path_resolves() {
        let root = colony();
        let egg = EntityRef::root().child("ant", 1).child("egg", 0);
        assert_eq!(egg.depth(), 2);
        let resolved = egg.resolve(&root).unwrap();
        assert_eq!(resolved.get("size"), Some(&Value::Int(3)));
        assert_eq!(egg.parent(), Some(EntityRef::root().child("ant", 1)));
    }

    #[test]
    fn missing_member_does_not_resolve() {
        let root = colony();
        assert!(EntityRef::root().child("ant", 9).resolve(&root).is_none());
        assert!(EntityRef::root().child("bee", 0).resolve(&root).is_none());
    }

    #[test]
    fn resolve_mut_allows_in_place_edit() {
        let mut root = colony();
        let a0 = EntityRef::root().child("ant", 0);
        a0.resolve_mut(&mut root)
            .unwrap()
            .set("name", Value::from("renamed"));
        assert_eq!(
            a0.resolve(&root).unwrap().get("name"),
            Some(&Value::from("renamed"))
        );
    }

    #[test]
    fn parts_round_trip_and_reject_ragged_columns() {
        let r = EntityRef::root().child("ant", 1).child("egg", 0);
        let (species, indices) = r.to_parts();
        assert_eq!(species, vec!["ant".to_string(), "egg".to_string()]);
        assert_eq!(EntityRef::from_parts(species, indices), Some(r));
        assert!(EntityRef::from_parts(vec!["ant".into()], vec![]).is_none());
    }

    #[test]
    fn owning_population_lookup() {
        let root = colony();
        let pop = EntityRef::root()
            .child("ant", 0)
            .owning_population(&root)
            .unwrap();
        assert_eq!(pop.len(), 2);
        assert!(EntityRef::root().owning_population(&root).is_none());
    }

    #[test]
    fn display_format() {
        assert_eq!(EntityRef::root().to_string(), "/");
        assert_eq!(
            EntityRef::root().child("ant", 2).child("egg", 0).to_string(),
            "/ant[2]/egg[0]"
        );
    }
}
