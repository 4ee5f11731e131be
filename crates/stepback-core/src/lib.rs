//! Stepback Core -- concurrent stepping and rollback for simulations.
//!
//! This crate runs many independent simulation units in synchronized rounds
//! on a bounded worker pool, records their entity graphs into compact
//! snapshots, and rolls them back to earlier cycles.
//!
//! # Round Barrier
//!
//! [`scheduler::Scheduler::run_round`] submits one task per registered unit
//! and returns only when all of them have finished. A failing or panicking
//! task is handed to a [`failure::FailureHandler`]; the rest of the round is
//! unaffected.
//!
//! # Outer and Inner Encoding
//!
//! Entity graphs may be cyclic. The codec keeps them finite by writing an
//! entity in full only when it is reached from outside any entity, and as an
//! owner-path reference ([`reference::EntityRef`]) when reached from inside
//! one:
//!
//! ```rust,ignore
//! let bytes = BinaryCodec.encode_entity(sim.root(), sim.cycle())?;
//! let cycle = BinaryCodec.restore_into(&context, &mut root, &bytes)?;
//! ```
//!
//! # Key Types
//!
//! - [`controller::Controller`] -- `step` / `step_back` over a set of
//!   simulations, recording after every round.
//! - [`scheduler::Scheduler`] -- Round table, worker pool and round barrier.
//! - [`codec::SnapshotCodec`] -- Binary (`bitcode`) and JSON codecs, looked up
//!   through a [`codec::CodecRegistry`].
//! - [`history::Recorder`] -- Per-unit snapshot stack with optional
//!   background compression ([`compress`]).
//! - [`entity::Entity`] -- Live entity tree; cross links are
//!   [`value::Value::Entity`] references.
//! - [`registry::TypeRegistry`] -- Type and species names known to a
//!   [`context::Context`].
//! - [`config::RuntimeConfig`] -- Concurrency, codec and history settings
//!   loaded from TOML, RON or JSON.

pub mod behavior;
pub mod codec;
pub mod compress;
pub mod config;
pub mod context;
pub mod controller;
pub mod entity;
pub mod failure;
pub mod history;
pub mod id;
pub mod reference;
pub mod registry;
pub mod scheduler;
pub mod sim;
pub mod unit;
pub mod value;
pub mod wire;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
