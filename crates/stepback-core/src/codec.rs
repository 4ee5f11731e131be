//! Snapshot codecs.
//!
//! A [`SnapshotCodec`] turns a unit's state (or any value held by a unit)
//! into a self-describing byte payload and back. Codecs only differ in how
//! they serialize the [`WireDocument`]; the entity walk, the outer/inner
//! reference rule, and the decode-time resolution are shared provided
//! methods. Codecs hold no per-call state, so one instance can serve every
//! worker thread at once.
//!
//! Codecs are looked up through an explicitly constructed [`CodecRegistry`]
//! keyed by format byte and format name.

use crate::context::Context;
use crate::entity::Entity;
use crate::id::FormatId;
use crate::reference::EntityRef;
use crate::value::Value;
use crate::wire::{self, Decoder, Encoder, Mode, WireBody, WireDocument, WireHeader, WIRE_VERSION};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Format name of the default codec. Unknown names fall back to it.
pub const BINARY_FORMAT: &str = "binary";

pub const JSON_FORMAT: &str = "json";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during encoding.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("{format} encoding failed: {reason}")]
    Backend { format: &'static str, reason: String },
    #[error("entity reference {0} does not resolve in the source unit")]
    DanglingReference(EntityRef),
}

/// Errors that can occur during decoding.
///
/// Variants split into two classes, see [`DecodeError::kind`]: structural
/// errors mean the bytes are damaged or not a payload of this version;
/// resolution errors mean the bytes are fine but name something the target
/// context or unit does not have.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("{format} decoding failed: {reason}")]
    Malformed { format: &'static str, reason: String },
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", wire::WIRE_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unsupported wire version: expected {}, got {}", WIRE_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("payload from future wire version {0} (this build supports up to {WIRE_VERSION})")]
    FutureVersion(u32),
    #[error("expected {expected} payload, found {found}")]
    UnexpectedPayload {
        expected: &'static str,
        found: &'static str,
    },
    #[error("reference path has {species} species but {indices} indices")]
    RaggedReference { species: usize, indices: usize },
    #[error("unknown shape kind tag {0}")]
    UnknownShapeKind(u8),
    #[error("entity reference {0} cannot be resolved in the target unit")]
    UnresolvedReference(EntityRef),
    #[error("type `{name}` is not known to context `{context}`")]
    UnknownType { name: String, context: String },
    #[error("species `{species}` is not known to context `{context}`")]
    UnknownSpecies { species: String, context: String },
    #[error("type `{name}` parametric mismatch (registry says parametric = {parametric})")]
    TypeArity { name: String, parametric: bool },
}

/// Classification of a [`DecodeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Damaged or foreign bytes. Never worth retrying.
    Structural,
    /// Valid bytes that do not match the target context or unit.
    Resolution,
}

impl DecodeError {
    pub fn kind(&self) -> DecodeErrorKind {
        match self {
            DecodeError::Malformed { .. }
            | DecodeError::InvalidMagic(_)
            | DecodeError::UnsupportedVersion(_)
            | DecodeError::FutureVersion(_)
            | DecodeError::UnexpectedPayload { .. }
            | DecodeError::RaggedReference { .. }
            | DecodeError::UnknownShapeKind(_) => DecodeErrorKind::Structural,
            DecodeError::UnresolvedReference(_)
            | DecodeError::UnknownType { .. }
            | DecodeError::UnknownSpecies { .. }
            | DecodeError::TypeArity { .. } => DecodeErrorKind::Resolution,
        }
    }

    pub fn is_structural(&self) -> bool {
        self.kind() == DecodeErrorKind::Structural
    }

    pub fn is_resolution(&self) -> bool {
        self.kind() == DecodeErrorKind::Resolution
    }
}

// ---------------------------------------------------------------------------
// Codec trait
// ---------------------------------------------------------------------------

/// An entity decoded into a detached value, with the cycle it was taken at.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEntity {
    pub entity: Entity,
    pub cycle: u64,
}

pub trait SnapshotCodec: Send + Sync + fmt::Debug {
    /// Format byte under which this codec is registered.
    fn format_id(&self) -> FormatId;

    /// Format name under which this codec is registered.
    fn format_name(&self) -> &'static str;

    /// Serialize a wire document.
    fn write_document(&self, document: &WireDocument) -> Result<Vec<u8>, EncodeError>;

    /// Deserialize a wire document. Only structural errors can occur here.
    fn read_document(&self, bytes: &[u8]) -> Result<WireDocument, DecodeError>;

    /// Encode a unit root and everything it owns.
    fn encode_entity(&self, root: &Entity, cycle: u64) -> Result<Vec<u8>, EncodeError> {
        let agent = Encoder::new(root).entity(root, &EntityRef::root())?;
        self.write_document(&WireDocument::entity(agent, cycle))
    }

    /// Encode a value held by (or addressing into) the unit rooted at `root`.
    /// Entity values met at the top level are written in full.
    fn encode_value(&self, root: &Entity, value: &Value) -> Result<Vec<u8>, EncodeError> {
        let wire = Encoder::new(root).value(value, Mode::Outer)?;
        self.write_document(&WireDocument::object(wire))
    }

    /// Decode an entity payload into a new detached entity.
    ///
    /// References inside it are kept as addresses and are not checked: a
    /// detached entity has no unit to resolve them in yet.
    fn decode_entity(&self, context: &Context, bytes: &[u8]) -> Result<DecodedEntity, DecodeError> {
        let (header, agent) = read_entity(self, bytes)?;
        let mut decoder = Decoder::new(context);
        let mut entity = decoder.entity(agent)?;
        wire::apply_inserts(&mut entity, decoder.into_inserts())?;
        Ok(DecodedEntity {
            entity,
            cycle: header.cycle,
        })
    }

    /// Decode an entity payload and replace `root` with it.
    ///
    /// The payload is fully decoded and every reference checked against the
    /// decoded tree before `root` is touched; on error `root` is unchanged.
    /// Returns the cycle recorded in the payload.
    fn restore_into(&self, context: &Context, root: &mut Entity, bytes: &[u8]) -> Result<u64, DecodeError> {
        let decoded = self.decode_unit(context, bytes)?;
        *root = decoded.entity;
        Ok(decoded.cycle)
    }

    /// Decode an entity payload as a complete unit state: like
    /// [`SnapshotCodec::decode_entity`], but every reference must resolve
    /// inside the decoded tree.
    fn decode_unit(&self, context: &Context, bytes: &[u8]) -> Result<DecodedEntity, DecodeError> {
        let decoded = self.decode_entity(context, bytes)?;
        if let Some(missing) = wire::first_unresolved(&decoded.entity, None) {
            return Err(DecodeError::UnresolvedReference(missing));
        }
        Ok(decoded)
    }

    /// Decode a value payload against the unit rooted at `root`.
    ///
    /// Entities written in full are recreated inside `root`; references are
    /// resolved against the result. On error `root` is unchanged.
    fn decode_value(&self, context: &Context, root: &mut Entity, bytes: &[u8]) -> Result<Value, DecodeError> {
        let document = self.read_document(bytes)?;
        document.validate()?;
        let wire = match document.body {
            WireBody::Object(wire) => wire,
            other => {
                return Err(DecodeError::UnexpectedPayload {
                    expected: "object",
                    found: other.label(),
                });
            }
        };
        let mut decoder = Decoder::new(context);
        let value = decoder.value(wire)?;
        let inserts = decoder.into_inserts();
        if inserts.is_empty() {
            if let Some(missing) = wire::first_unresolved(root, Some(&value)) {
                return Err(DecodeError::UnresolvedReference(missing));
            }
            return Ok(value);
        }
        let mut staged = root.clone();
        wire::apply_inserts(&mut staged, inserts)?;
        if let Some(missing) = wire::first_unresolved(&staged, Some(&value)) {
            return Err(DecodeError::UnresolvedReference(missing));
        }
        *root = staged;
        Ok(value)
    }
}

fn read_entity<C: SnapshotCodec + ?Sized>(
    codec: &C,
    bytes: &[u8],
) -> Result<(WireHeader, wire::WireAgent), DecodeError> {
    let document = codec.read_document(bytes)?;
    document.validate()?;
    match document.body {
        WireBody::Entity(agent) => Ok((document.header, agent)),
        other => Err(DecodeError::UnexpectedPayload {
            expected: "entity",
            found: other.label(),
        }),
    }
}

/// Read only the header of a payload.
///
/// The codec has to decode the whole document to get at the header; this is
/// a convenience for inspecting the recorded cycle.
pub fn read_header(codec: &dyn SnapshotCodec, bytes: &[u8]) -> Result<WireHeader, DecodeError> {
    let document = codec.read_document(bytes)?;
    document.validate()?;
    Ok(document.header)
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

/// Compact binary codec backed by `bitcode`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl SnapshotCodec for BinaryCodec {
    fn format_id(&self) -> FormatId {
        FormatId(0)
    }

    fn format_name(&self) -> &'static str {
        BINARY_FORMAT
    }

    fn write_document(&self, document: &WireDocument) -> Result<Vec<u8>, EncodeError> {
        bitcode::serialize(document).map_err(|e| EncodeError::Backend {
            format: BINARY_FORMAT,
            reason: e.to_string(),
        })
    }

    fn read_document(&self, bytes: &[u8]) -> Result<WireDocument, DecodeError> {
        bitcode::deserialize(bytes).map_err(|e| DecodeError::Malformed {
            format: BINARY_FORMAT,
            reason: e.to_string(),
        })
    }
}

/// Human-readable codec backed by `serde_json`. Useful for inspecting
/// snapshots. JSON has no NaN or infinity, so documents holding one fail to
/// encode instead of being written as `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl SnapshotCodec for JsonCodec {
    fn format_id(&self) -> FormatId {
        FormatId(1)
    }

    fn format_name(&self) -> &'static str {
        JSON_FORMAT
    }

    fn write_document(&self, document: &WireDocument) -> Result<Vec<u8>, EncodeError> {
        if let Some(f) = document.first_non_finite() {
            return Err(EncodeError::Backend {
                format: JSON_FORMAT,
                reason: format!("non-finite float {f} has no JSON representation"),
            });
        }
        serde_json::to_vec(document).map_err(|e| EncodeError::Backend {
            format: JSON_FORMAT,
            reason: e.to_string(),
        })
    }

    fn read_document(&self, bytes: &[u8]) -> Result<WireDocument, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed {
            format: JSON_FORMAT,
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// CodecRegistry
// ---------------------------------------------------------------------------

/// Codecs by format byte and format name.
///
/// Always contains the binary codec, which is what unknown lookups fall back
/// to.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    by_id: HashMap<FormatId, Arc<dyn SnapshotCodec>>,
    by_name: HashMap<&'static str, Arc<dyn SnapshotCodec>>,
    fallback: Arc<dyn SnapshotCodec>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    /// A registry holding only the binary codec.
    pub fn new() -> Self {
        let fallback: Arc<dyn SnapshotCodec> = Arc::new(BinaryCodec);
        let mut registry = Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            fallback: Arc::clone(&fallback),
        };
        registry.register(fallback);
        registry
    }

    /// A registry holding the binary and JSON codecs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonCodec));
        registry
    }

    /// Register a codec under its format byte and name, replacing any
    /// previous codec with the same byte or name.
    pub fn register(&mut self, codec: Arc<dyn SnapshotCodec>) {
        self.by_id.insert(codec.format_id(), Arc::clone(&codec));
        self.by_name.insert(codec.format_name(), codec);
    }

    /// Codec for a format byte, falling back to the binary codec.
    pub fn by_id(&self, id: FormatId) -> Arc<dyn SnapshotCodec> {
        self.by_id
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Codec for a format name, falling back to the binary codec.
    pub fn by_name(&self, name: &str) -> Arc<dyn SnapshotCodec> {
        self.by_name
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registered format names, sorted.
    pub fn available_formats(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
