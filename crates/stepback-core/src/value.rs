//! Attribute values held by live entities.
//!
//! Values are plain data with one exception: [`Value::Entity`] holds an
//! [`EntityRef`], an address into the owning unit rather than the entity
//! itself. Containers carry their element type descriptors so the codec can
//! write them without inspecting the elements.

use crate::context::Context;
use crate::reference::EntityRef;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Type descriptors
// ---------------------------------------------------------------------------

/// A type name plus, for parametric (container) types, key and content types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDesc {
    name: String,
    params: Option<Box<(TypeDesc, TypeDesc)>>,
}

impl TypeDesc {
    /// A non-parametric type such as `int` or a species name.
    pub fn simple(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: None,
        }
    }

    /// A parametric type such as `map<string, int>`.
    pub fn compound(name: impl Into<String>, key: TypeDesc, content: TypeDesc) -> Self {
        Self {
            name: name.into(),
            params: Some(Box::new((key, content))),
        }
    }

    pub fn unknown() -> Self {
        Self::simple("unknown")
    }

    /// `list<content>`; lists are keyed by `int`.
    pub fn list_of(content: TypeDesc) -> Self {
        Self::compound("list", Self::simple("int"), content)
    }

    pub fn map_of(key: TypeDesc, content: TypeDesc) -> Self {
        Self::compound("map", key, content)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_compound(&self) -> bool {
        self.params.is_some()
    }

    pub fn key_type(&self) -> Option<&TypeDesc> {
        self.params.as_deref().map(|(k, _)| k)
    }

    pub fn content_type(&self) -> Option<&TypeDesc> {
        self.params.as_deref().map(|(_, c)| c)
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.params.as_deref() {
            Some((key, content)) => write!(f, "{}<{},{}>", self.name, key, content),
            None => write!(f, "{}", self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Shapes
// ---------------------------------------------------------------------------

/// Geometric kind of a [`Shape`]. The discriminant is the wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShapeKind {
    Null = 0,
    Point = 1,
    LineString = 2,
    Polygon = 3,
    MultiPoint = 4,
    MultiLineString = 5,
    MultiPolygon = 6,
    Box = 7,
    Sphere = 8,
    Cylinder = 9,
}

impl ShapeKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Null,
            1 => Self::Point,
            2 => Self::LineString,
            3 => Self::Polygon,
            4 => Self::MultiPoint,
            5 => Self::MultiLineString,
            6 => Self::MultiPolygon,
            7 => Self::Box,
            8 => Self::Sphere,
            9 => Self::Cylinder,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// A geometry with optional extrusion depth and an optional owning entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    pub kind: ShapeKind,
    pub points: Vec<Point>,
    /// Extrusion depth, if the shape is extruded.
    pub depth: Option<f64>,
    /// The entity this shape is the geometry of.
    pub owner: Option<EntityRef>,
}

impl Shape {
    pub fn new(kind: ShapeKind, points: Vec<Point>) -> Self {
        Self {
            kind,
            points,
            depth: None,
            owner: None,
        }
    }

    pub fn point(x: f64, y: f64) -> Self {
        Self::new(ShapeKind::Point, vec![Point::new(x, y, 0.0)])
    }

    pub fn with_owner(mut self, owner: EntityRef) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_depth(mut self, depth: f64) -> Self {
        self.depth = Some(depth);
        self
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// An ordered container with a declared content type.
#[derive(Debug, Clone, PartialEq)]
pub struct ListValue {
    pub content: TypeDesc,
    pub items: Vec<Value>,
}

impl ListValue {
    pub fn new(content: TypeDesc) -> Self {
        Self {
            content,
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A keyed container. Entries keep insertion order; keys are unique.
///
/// `ordered` is carried through encoding unchanged so a map declared as
/// unordered by the model stays unordered after a restore.
#[derive(Debug, Clone, PartialEq)]
pub struct MapValue {
    pub key: TypeDesc,
    pub content: TypeDesc,
    pub ordered: bool,
    entries: Vec<(Value, Value)>,
}

impl MapValue {
    pub fn new(key: TypeDesc, content: TypeDesc, ordered: bool) -> Self {
        Self {
            key,
            content,
            ordered,
            entries: Vec::new(),
        }
    }

    /// Insert or replace. Returns the previous value for `key`, if any.
    pub fn insert(&mut self, key: Value, value: Value) -> Option<Value> {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A single attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(ListValue),
    Map(MapValue),
    Type(TypeDesc),
    /// A handle to an execution context; only its name is ever encoded.
    Context(Arc<Context>),
    Shape(Shape),
    /// A reference to another live entity of the same unit.
    Entity(EntityRef),
}

impl Value {
    /// Build a list from items with the given content type.
    pub fn list(content: TypeDesc, items: Vec<Value>) -> Self {
        Value::List(ListValue { content, items })
    }

    /// Short name of the value's category, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Type(_) => "type",
            Value::Context(_) => "context",
            Value::Shape(_) => "geometry",
            Value::Entity(_) => "agent",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Value::Entity(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListValue> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Call `f` for every entity reference reachable from this value,
    /// including shape owners.
    pub fn visit_references(&self, f: &mut impl FnMut(&EntityRef)) {
        match self {
            Value::Entity(r) => f(r),
            Value::Shape(shape) => {
                if let Some(owner) = &shape.owner {
                    f(owner);
                }
            }
            Value::List(list) => {
                for item in &list.items {
                    item.visit_references(f);
                }
            }
            Value::Map(map) => {
                for (k, v) in map.iter() {
                    k.visit_references(f);
                    v.visit_references(f);
                }
            }
            _ => {}
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<EntityRef> for Value {
    fn from(v: EntityRef) -> Self {
        Value::Entity(v)
    }
}

impl From<Shape> for Value {
    fn from(v: Shape) -> Self {
        Value::Shape(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_desc_display() {
        let t = TypeDesc::map_of(TypeDesc::simple("string"), TypeDesc::list_of(TypeDesc::simple("ant")));
        assert_eq!(t.to_string(), "map<string,list<int,ant>>");
        assert!(t.is_compound());
        assert_eq!(t.key_type().unwrap().name(), "string");
        assert!(!TypeDesc::simple("int").is_compound());
    }

    #[test]
    fn shape_kind_tags_round_trip() {
        for tag in 0..=9u8 {
            assert_eq!(ShapeKind::from_tag(tag).unwrap().tag(), tag);
        }
        assert!(ShapeKind::from_tag(200).is_none());
    }

    #[test]
    fn map_insert_replaces_existing_key() {
        let mut m = MapValue::new(TypeDesc::simple("string"), TypeDesc::simple("int"), true);
        assert!(m.insert(Value::from("a"), Value::Int(1)).is_none());
        assert_eq!(m.insert(Value::from("a"), Value::Int(2)), Some(Value::Int(1)));
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&Value::from("a")), Some(&Value::Int(2)));
    }

    #[test]
    fn visit_references_walks_containers_and_shapes() {
        let a = EntityRef::root().child("ant", 0);
        let b = EntityRef::root().child("ant", 1);
        let mut map = MapValue::new(TypeDesc::simple("string"), TypeDesc::simple("ant"), false);
        map.insert(Value::from("friend"), Value::Entity(b.clone()));
        let value = Value::list(
            TypeDesc::unknown(),
            vec![
                Value::Entity(a.clone()),
                Value::Map(map),
                Value::Shape(Shape::point(1.0, 2.0).with_owner(a.clone())),
                Value::Int(4),
            ],
        );
        let mut seen = Vec::new();
        value.visit_references(&mut |r| seen.push(r.clone()));
        assert_eq!(seen, vec![a.clone(), b, a]);
    }
}
