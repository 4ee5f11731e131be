//! Wire representation of entity graphs and the conversion to and from it.
//!
//! Encoding walks live entities and produces serde-derived wire structs that a
//! [`crate::codec::SnapshotCodec`] turns into bytes. The walk is driven by an
//! explicit [`Mode`]: an entity reached while `Outer` is written in full and
//! its fields are then walked `Inner`; an entity reached while `Inner` is
//! written as a [`WireRef`] only. Populations are ownership, not references,
//! so their members are always written in full.
//!
//! Decoding builds detached live values. Type and species names are resolved
//! against the target [`Context`]'s registry; entity references are only
//! converted here and checked against the final tree by the caller.

use crate::codec::{DecodeError, EncodeError};
use crate::context::Context;
use crate::entity::{Entity, Population};
use crate::reference::EntityRef;
use crate::value::{ListValue, MapValue, Point, Shape, ShapeKind, TypeDesc, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a stepback payload.
pub const WIRE_MAGIC: u32 = 0x57EB_0001;

/// Current wire version. Increment when breaking the wire format.
pub const WIRE_VERSION: u32 = 1;

/// Header kind byte of a payload holding a whole unit root.
pub const ENTITY_PAYLOAD: u8 = 42;

/// Header kind byte of a payload holding an arbitrary value.
pub const OBJECT_PAYLOAD: u8 = 43;

// ---------------------------------------------------------------------------
// Encoding mode
// ---------------------------------------------------------------------------

/// Whether the encoder is currently inside a full entity encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Not inside any entity: entity values are written in full.
    Outer,
    /// Inside an entity's fields: entity values are written as references.
    Inner,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Header prepended to every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHeader {
    pub magic: u32,
    pub version: u32,
    /// [`ENTITY_PAYLOAD`] or [`OBJECT_PAYLOAD`].
    pub kind: u8,
    /// Cycle of the unit when the payload was produced.
    pub cycle: u64,
}

impl WireHeader {
    pub fn new(kind: u8, cycle: u64) -> Self {
        Self {
            magic: WIRE_MAGIC,
            version: WIRE_VERSION,
            kind,
            cycle,
        }
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.magic != WIRE_MAGIC {
            return Err(DecodeError::InvalidMagic(self.magic));
        }
        if self.version > WIRE_VERSION {
            return Err(DecodeError::FutureVersion(self.version));
        }
        if self.version < WIRE_VERSION {
            return Err(DecodeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDocument {
    pub header: WireHeader,
    pub body: WireBody,
}

impl WireDocument {
    pub fn entity(agent: WireAgent, cycle: u64) -> Self {
        Self {
            header: WireHeader::new(ENTITY_PAYLOAD, cycle),
            body: WireBody::Entity(agent),
        }
    }

    pub fn object(value: WireValue) -> Self {
        Self {
            header: WireHeader::new(OBJECT_PAYLOAD, 0),
            body: WireBody::Object(value),
        }
    }

    /// Validate the header and check that its kind byte matches the body.
    pub fn validate(&self) -> Result<(), DecodeError> {
        self.header.validate()?;
        if self.header.kind != self.body.kind() {
            return Err(DecodeError::Malformed {
                format: "wire",
                reason: format!(
                    "header kind {} does not match {} body",
                    self.header.kind,
                    self.body.label()
                ),
            });
        }
        Ok(())
    }

    /// The first NaN or infinite float anywhere in the document.
    pub fn first_non_finite(&self) -> Option<f64> {
        match &self.body {
            WireBody::Entity(agent) => agent.first_non_finite(),
            WireBody::Object(value) => value.first_non_finite(),
        }
    }
}

/// What a payload carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireBody {
    /// A whole unit root entity.
    Entity(WireAgent),
    /// An arbitrary value encoded against a unit.
    Object(WireValue),
}

impl WireBody {
    pub fn label(&self) -> &'static str {
        match self {
            WireBody::Entity(_) => "entity",
            WireBody::Object(_) => "object",
        }
    }

    pub fn kind(&self) -> u8 {
        match self {
            WireBody::Entity(_) => ENTITY_PAYLOAD,
            WireBody::Object(_) => OBJECT_PAYLOAD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireType {
    pub name: String,
    pub params: Option<Box<(WireType, WireType)>>,
}

/// Owner path in column layout: `species[i]` and `indices[i]` form hop `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRef {
    pub species: Vec<String>,
    pub indices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireAgent {
    pub index: u32,
    pub species: String,
    pub attributes: Vec<(String, WireValue)>,
    pub populations: Vec<WirePopulation>,
}

impl WireAgent {
    fn first_non_finite(&self) -> Option<f64> {
        self.attributes
            .iter()
            .find_map(|(_, v)| v.first_non_finite())
            .or_else(|| {
                self.populations
                    .iter()
                    .flat_map(|p| &p.members)
                    .find_map(WireAgent::first_non_finite)
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePopulation {
    pub species: String,
    pub next_index: u32,
    pub members: Vec<WireAgent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireShape {
    pub depth: Option<f64>,
    pub kind: u8,
    pub points: Vec<[f64; 3]>,
    /// Always a reference; the owner is never nested in full.
    pub owner: Option<WireRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireEntity {
    /// First encounter on an outer path. `owner` is `None` for a unit root.
    Full {
        owner: Option<WireRef>,
        agent: WireAgent,
    },
    Ref(WireRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List {
        content: WireType,
        items: Vec<WireValue>,
    },
    Map {
        key: WireType,
        content: WireType,
        ordered: bool,
        entries: Vec<(WireValue, WireValue)>,
    },
    Type(WireType),
    Context(String),
    Shape(WireShape),
    Entity(WireEntity),
}

impl WireValue {
    fn first_non_finite(&self) -> Option<f64> {
        match self {
            WireValue::Float(f) => Some(*f).filter(|f| !f.is_finite()),
            WireValue::List { items, .. } => items.iter().find_map(WireValue::first_non_finite),
            WireValue::Map { entries, .. } => entries
                .iter()
                .find_map(|(k, v)| k.first_non_finite().or_else(|| v.first_non_finite())),
            WireValue::Shape(shape) => shape
                .depth
                .into_iter()
                .chain(shape.points.iter().flatten().copied())
                .find(|f| !f.is_finite()),
            WireValue::Entity(WireEntity::Full { agent, .. }) => agent.first_non_finite(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// One encoding pass over a unit.
pub(crate) struct Encoder<'a> {
    root: &'a Entity,
    /// Entities already written in full during this pass.
    seen: HashSet<EntityRef>,
}

impl<'a> Encoder<'a> {
    pub(crate) fn new(root: &'a Entity) -> Self {
        Self {
            root,
            seen: HashSet::new(),
        }
    }

    /// Write `entity` (located at `path`) in full. Fields are walked `Inner`.
    pub(crate) fn entity(
        &mut self,
        entity: &'a Entity,
        path: &EntityRef,
    ) -> Result<WireAgent, EncodeError> {
        self.seen.insert(path.clone());
        let mut attributes = Vec::with_capacity(entity.attribute_count());
        for (name, value) in entity.attributes() {
            attributes.push((name.to_string(), self.value(value, Mode::Inner)?));
        }
        let mut populations = Vec::new();
        for population in entity.populations() {
            let mut members = Vec::with_capacity(population.len());
            for member in population.iter() {
                let member_path = path.child(population.species(), member.index());
                members.push(self.entity(member, &member_path)?);
            }
            populations.push(WirePopulation {
                species: population.species().to_string(),
                next_index: population.next_index(),
                members,
            });
        }
        Ok(WireAgent {
            index: entity.index(),
            species: entity.species().to_string(),
            attributes,
            populations,
        })
    }

    pub(crate) fn value(&mut self, value: &Value, mode: Mode) -> Result<WireValue, EncodeError> {
        Ok(match value {
            Value::Nil => WireValue::Nil,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(f) => WireValue::Float(*f),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::List(list) => {
                let mut items = Vec::with_capacity(list.len());
                for item in &list.items {
                    items.push(self.value(item, mode)?);
                }
                WireValue::List {
                    content: wire_type(&list.content),
                    items,
                }
            }
            Value::Map(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (k, v) in map.iter() {
                    entries.push((self.value(k, mode)?, self.value(v, mode)?));
                }
                WireValue::Map {
                    key: wire_type(&map.key),
                    content: wire_type(&map.content),
                    ordered: map.ordered,
                    entries,
                }
            }
            Value::Type(t) => WireValue::Type(wire_type(t)),
            Value::Context(ctx) => WireValue::Context(ctx.name().to_string()),
            Value::Shape(shape) => WireValue::Shape(WireShape {
                depth: shape.depth,
                kind: shape.kind.tag(),
                points: shape.points.iter().map(|p| [p.x, p.y, p.z]).collect(),
                owner: shape.owner.as_ref().map(wire_ref),
            }),
            Value::Entity(r) => WireValue::Entity(self.entity_value(r, mode)?),
        })
    }

    fn entity_value(&mut self, r: &EntityRef, mode: Mode) -> Result<WireEntity, EncodeError> {
        if mode == Mode::Inner || self.seen.contains(r) {
            return Ok(WireEntity::Ref(wire_ref(r)));
        }
        let root = self.root;
        let entity = r
            .resolve(root)
            .ok_or_else(|| EncodeError::DanglingReference(r.clone()))?;
        let agent = self.entity(entity, r)?;
        Ok(WireEntity::Full {
            owner: r.parent().as_ref().map(wire_ref),
            agent,
        })
    }
}

fn wire_type(t: &TypeDesc) -> WireType {
    WireType {
        name: t.name().to_string(),
        params: match (t.key_type(), t.content_type()) {
            (Some(k), Some(c)) => Some(Box::new((wire_type(k), wire_type(c)))),
            _ => None,
        },
    }
}

fn wire_ref(r: &EntityRef) -> WireRef {
    let (species, indices) = r.to_parts();
    WireRef { species, indices }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// An entity that was written in full inside a value and must be inserted
/// into its owner once the surrounding decode succeeds.
#[derive(Debug)]
pub(crate) struct PendingInsert {
    pub owner: Option<EntityRef>,
    pub entity: Entity,
}

/// One decoding pass against a target context.
pub(crate) struct Decoder<'a> {
    context: &'a Context,
    inserts: Vec<PendingInsert>,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(context: &'a Context) -> Self {
        Self {
            context,
            inserts: Vec::new(),
        }
    }

    pub(crate) fn into_inserts(self) -> Vec<PendingInsert> {
        self.inserts
    }

    pub(crate) fn entity(&mut self, wire: WireAgent) -> Result<Entity, DecodeError> {
        self.check_species(&wire.species)?;
        let mut entity = Entity::new(wire.species, wire.index);
        for (name, value) in wire.attributes {
            let value = self.value(value)?;
            entity.set(name, value);
        }
        for population in wire.populations {
            self.check_species(&population.species)?;
            let mut live = Population::with_next_index(population.species, population.next_index);
            for member in population.members {
                if member.index >= live.next_index() {
                    return Err(DecodeError::Malformed {
                        format: "wire",
                        reason: format!(
                            "member index {} out of range for population `{}` (next index {})",
                            member.index,
                            live.species(),
                            live.next_index()
                        ),
                    });
                }
                let member = self.entity(member)?;
                if member.species() != live.species() {
                    return Err(DecodeError::Malformed {
                        format: "wire",
                        reason: format!(
                            "member of species `{}` stored in population `{}`",
                            member.species(),
                            live.species()
                        ),
                    });
                }
                live.insert(member);
            }
            entity.insert_population(live);
        }
        Ok(entity)
    }

    pub(crate) fn value(&mut self, wire: WireValue) -> Result<Value, DecodeError> {
        Ok(match wire {
            WireValue::Nil => Value::Nil,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Str(s) => Value::Str(s),
            WireValue::List { content, items } => {
                let content = self.type_desc(content)?;
                let mut live = ListValue::new(content);
                for item in items {
                    live.items.push(self.value(item)?);
                }
                Value::List(live)
            }
            WireValue::Map {
                key,
                content,
                ordered,
                entries,
            } => {
                let mut live = MapValue::new(self.type_desc(key)?, self.type_desc(content)?, ordered);
                for (k, v) in entries {
                    let k = self.value(k)?;
                    let v = self.value(v)?;
                    live.insert(k, v);
                }
                Value::Map(live)
            }
            WireValue::Type(t) => Value::Type(self.type_desc(t)?),
            WireValue::Context(name) => Value::Context(self.context.child(&name)),
            WireValue::Shape(shape) => Value::Shape(self.shape(shape)?),
            WireValue::Entity(WireEntity::Ref(r)) => Value::Entity(entity_ref(r)?),
            WireValue::Entity(WireEntity::Full { owner, agent }) => {
                let owner = owner.map(entity_ref).transpose()?;
                let entity = self.entity(agent)?;
                let address = match &owner {
                    Some(o) => o.child(entity.species(), entity.index()),
                    None => EntityRef::root(),
                };
                self.inserts.push(PendingInsert { owner, entity });
                Value::Entity(address)
            }
        })
    }

    fn shape(&mut self, wire: WireShape) -> Result<Shape, DecodeError> {
        let kind = ShapeKind::from_tag(wire.kind).ok_or(DecodeError::UnknownShapeKind(wire.kind))?;
        let points = wire
            .points
            .into_iter()
            .map(|[x, y, z]| Point::new(x, y, z))
            .collect();
        let mut shape = Shape::new(kind, points);
        shape.depth = wire.depth;
        shape.owner = wire.owner.map(entity_ref).transpose()?;
        Ok(shape)
    }

    fn type_desc(&self, wire: WireType) -> Result<TypeDesc, DecodeError> {
        let def = self
            .context
            .types()
            .lookup(&wire.name)
            .ok_or_else(|| DecodeError::UnknownType {
                name: wire.name.clone(),
                context: self.context.name().to_string(),
            })?;
        if def.parametric != wire.params.is_some() {
            return Err(DecodeError::TypeArity {
                name: wire.name,
                parametric: def.parametric,
            });
        }
        match wire.params {
            Some(params) => {
                let (key, content) = *params;
                Ok(TypeDesc::compound(
                    wire.name,
                    self.type_desc(key)?,
                    self.type_desc(content)?,
                ))
            }
            None => Ok(TypeDesc::simple(wire.name)),
        }
    }

    fn check_species(&self, species: &str) -> Result<(), DecodeError> {
        if self.context.types().is_species(species) {
            Ok(())
        } else {
            Err(DecodeError::UnknownSpecies {
                species: species.to_string(),
                context: self.context.name().to_string(),
            })
        }
    }
}

fn entity_ref(wire: WireRef) -> Result<EntityRef, DecodeError> {
    let (species, indices) = (wire.species.len(), wire.indices.len());
    EntityRef::from_parts(wire.species, wire.indices)
        .ok_or(DecodeError::RaggedReference { species, indices })
}

/// Apply pending inserts to `root`, in decode order.
pub(crate) fn apply_inserts(root: &mut Entity, inserts: Vec<PendingInsert>) -> Result<(), DecodeError> {
    for PendingInsert { owner, entity } in inserts {
        match owner {
            Some(owner) => {
                let target = owner
                    .resolve_mut(root)
                    .ok_or_else(|| DecodeError::UnresolvedReference(owner.clone()))?;
                let species = entity.species().to_string();
                target.ensure_population(&species).insert(entity);
            }
            None => *root = entity,
        }
    }
    Ok(())
}

/// The first reference under `root` (or in `extra`) that does not resolve.
pub(crate) fn first_unresolved(root: &Entity, extra: Option<&Value>) -> Option<EntityRef> {
    let mut missing = None;
    let mut check = |r: &EntityRef| {
        if missing.is_none() && r.resolve(root).is_none() {
            missing = Some(r.clone());
        }
    };
    root.visit_references(&mut check);
    if let Some(value) = extra {
        value.visit_references(&mut check);
    }
    missing
}
