//! Snapshot history and rollback.
//!
//! Each unit owns at most one [`History`]: a stack of encoded snapshots, each
//! tagged with the cycle it was taken at. A [`Recorder`] pushes a snapshot of
//! a unit onto its history and restores the unit from it. Both operations
//! assume the caller holds the unit's exclusive lock.
//!
//! Ordering rules:
//!
//! - Recording at a cycle already on top replaces that node.
//! - Recording at a cycle below the top first drops every newer node.
//! - Restoring skips the top node when it was taken at the unit's current
//!   cycle, since rolling back to the present is a no-op.
//! - A successful restore pops the node it restored from, along with any
//!   newer node, so consecutive restores walk strictly back in time.
//! - A failed record leaves the stack unchanged; a failed restore leaves both
//!   the stack and the unit unchanged.

use crate::codec::{DecodeError, EncodeError, SnapshotCodec};
use crate::compress::{self, COMPRESSED, Compressor, UNCOMPRESSED};
use crate::context::Context;
use crate::entity::Entity;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] EncodeError),
    #[error("failed to decode snapshot: {0}")]
    Decode(#[from] DecodeError),
    #[error("snapshot for cycle {cycle} could not be decompressed: {source}")]
    Corrupt {
        cycle: u64,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// HistoryNode
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Payload {
    Raw(Arc<[u8]>),
    Zipped(Vec<u8>),
}

#[derive(Debug)]
struct NodeSlot {
    payload: Payload,
    /// A compression job for this node is queued or running.
    pending: bool,
}

/// One encoded snapshot and the cycle it was taken at.
///
/// The payload may be swapped for its compressed form in the background; the
/// cycle never changes.
#[derive(Debug)]
pub struct HistoryNode {
    cycle: u64,
    slot: Mutex<NodeSlot>,
    settled: Condvar,
}

impl HistoryNode {
    pub fn new(cycle: u64, bytes: Vec<u8>) -> Self {
        Self {
            cycle,
            slot: Mutex::new(NodeSlot {
                payload: Payload::Raw(bytes.into()),
                pending: false,
            }),
            settled: Condvar::new(),
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// [`COMPRESSED`] or [`UNCOMPRESSED`].
    pub fn marker(&self) -> u8 {
        match self.slot.lock().payload {
            Payload::Raw(_) => UNCOMPRESSED,
            Payload::Zipped(_) => COMPRESSED,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.marker() == COMPRESSED
    }

    /// Bytes currently held, compressed or not.
    pub fn stored_len(&self) -> usize {
        match &self.slot.lock().payload {
            Payload::Raw(bytes) => bytes.len(),
            Payload::Zipped(bytes) => bytes.len(),
        }
    }

    /// Block until no compression job is pending for this node.
    pub fn wait_settled(&self) {
        let mut slot = self.slot.lock();
        while slot.pending {
            self.settled.wait(&mut slot);
        }
    }

    /// The encoder's bytes, waiting for pending compression and unzipping
    /// when needed.
    pub fn bytes(&self) -> Result<Vec<u8>, HistoryError> {
        let mut slot = self.slot.lock();
        while slot.pending {
            self.settled.wait(&mut slot);
        }
        match &slot.payload {
            Payload::Raw(bytes) => Ok(bytes.to_vec()),
            Payload::Zipped(bytes) => compress::unzip(bytes).map_err(|source| HistoryError::Corrupt {
                cycle: self.cycle,
                source,
            }),
        }
    }

    /// Mark the node as queued for compression. Returns `false` when it is
    /// already compressed or queued.
    pub(crate) fn begin_compression(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.pending || matches!(slot.payload, Payload::Zipped(_)) {
            return false;
        }
        slot.pending = true;
        true
    }

    /// Compress the payload on the calling thread and settle the node.
    pub(crate) fn compress_now(&self, level: u32) {
        let raw = match &self.slot.lock().payload {
            Payload::Raw(bytes) => Some(Arc::clone(bytes)),
            Payload::Zipped(_) => None,
        };
        let zipped = raw.map(|bytes| (bytes.len(), compress::zip(&bytes, level)));

        let mut slot = self.slot.lock();
        match zipped {
            Some((raw_len, Ok(bytes))) => {
                debug!(cycle = self.cycle, raw_len, zipped_len = bytes.len(), "compressed snapshot");
                slot.payload = Payload::Zipped(bytes);
            }
            Some((_, Err(e))) => {
                warn!(cycle = self.cycle, error = %e, "snapshot compression failed, keeping raw bytes");
            }
            None => {}
        }
        slot.pending = false;
        self.settled.notify_all();
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// A unit's snapshot stack, oldest first.
#[derive(Debug, Default)]
pub struct History {
    nodes: VecDeque<Arc<HistoryNode>>,
    /// Oldest nodes are evicted beyond this depth.
    max_depth: Option<usize>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// A history that keeps at most `max_depth` nodes (at least one).
    pub fn with_max_depth(max_depth: Option<usize>) -> Self {
        Self {
            nodes: VecDeque::new(),
            max_depth: max_depth.map(|d| d.max(1)),
        }
    }

    /// Push a node, applying the replace, truncate and eviction rules.
    pub fn push(&mut self, node: Arc<HistoryNode>) {
        while self
            .nodes
            .back()
            .is_some_and(|top| top.cycle() >= node.cycle())
        {
            self.nodes.pop_back();
        }
        self.nodes.push_back(node);
        if let Some(max) = self.max_depth {
            while self.nodes.len() > max {
                self.nodes.pop_front();
            }
        }
    }

    pub fn pop(&mut self) -> Option<Arc<HistoryNode>> {
        self.nodes.pop_back()
    }

    pub fn top(&self) -> Option<&Arc<HistoryNode>> {
        self.nodes.back()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn can_step_back(&self) -> bool {
        !self.nodes.is_empty()
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }

    /// Recorded cycles, oldest first.
    pub fn cycles(&self) -> Vec<u64> {
        self.nodes.iter().map(|n| n.cycle()).collect()
    }

    /// Bytes held by all nodes in their current (possibly compressed) form.
    pub fn stored_bytes(&self) -> usize {
        self.nodes.iter().map(|n| n.stored_len()).sum()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Position of the node a restore at `current` rolls back to: the top
    /// node, or the one below it when the top was taken at `current`.
    fn restore_target(&self, current: u64) -> Option<usize> {
        let top = self.nodes.len().checked_sub(1)?;
        if self.nodes[top].cycle() == current {
            top.checked_sub(1)
        } else {
            Some(top)
        }
    }
}

// ---------------------------------------------------------------------------
// Recordable
// ---------------------------------------------------------------------------

/// A unit whose state can be recorded and rolled back.
pub trait Recordable {
    /// Context the unit's state is decoded against.
    fn context(&self) -> &Context;

    fn root(&self) -> &Entity;

    /// The unit's current cycle.
    fn cycle(&self) -> u64;

    fn history(&self) -> Option<&History>;

    /// The history slot; created on first record.
    fn history_mut(&mut self) -> &mut Option<History>;

    /// Replace the unit's state with a restored root taken at `cycle`.
    fn install(&mut self, root: Entity, cycle: u64);
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Outcome of [`Recorder::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restore {
    /// The unit now holds the state recorded at `cycle`.
    Restored { cycle: u64 },
    /// There was nothing older than the current cycle to restore.
    Nothing,
}

/// Records units onto their histories and restores them.
#[derive(Debug, Clone)]
pub struct Recorder {
    codec: Arc<dyn SnapshotCodec>,
    compressor: Option<Compressor>,
    max_depth: Option<usize>,
}

impl Recorder {
    pub fn new(codec: Arc<dyn SnapshotCodec>) -> Self {
        Self {
            codec,
            compressor: None,
            max_depth: None,
        }
    }

    /// Compress every recorded node in the background.
    pub fn with_compression(mut self, compressor: Compressor) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Depth limit applied to histories this recorder creates.
    pub fn with_max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn codec(&self) -> &Arc<dyn SnapshotCodec> {
        &self.codec
    }

    /// Encode the unit and push the snapshot onto its history. Returns the
    /// recorded cycle.
    pub fn record<U: Recordable + ?Sized>(&self, unit: &mut U) -> Result<u64, HistoryError> {
        let started = Instant::now();
        let cycle = unit.cycle();
        let bytes = self.codec.encode_entity(unit.root(), cycle).inspect_err(|e| {
            warn!(cycle, error = %e, "record failed");
        })?;
        let len = bytes.len();
        let node = Arc::new(HistoryNode::new(cycle, bytes));

        let max_depth = self.max_depth;
        let history = unit
            .history_mut()
            .get_or_insert_with(|| History::with_max_depth(max_depth));
        history.push(Arc::clone(&node));
        let depth = history.len();

        if let Some(compressor) = &self.compressor {
            compressor.submit(node);
        }
        debug!(
            cycle,
            bytes = len,
            depth,
            elapsed_us = started.elapsed().as_micros() as u64,
            "recorded snapshot"
        );
        Ok(cycle)
    }

    /// Roll the unit back to its most recent snapshot older than the
    /// current cycle.
    pub fn restore<U: Recordable + ?Sized>(&self, unit: &mut U) -> Result<Restore, HistoryError> {
        let started = Instant::now();
        let current = unit.cycle();
        let (at, target) = {
            let Some(history) = unit.history_mut().as_mut() else {
                return Ok(Restore::Nothing);
            };
            match history.restore_target(current) {
                Some(at) => (at, Arc::clone(&history.nodes[at])),
                None => {
                    // Only the present is recorded; rolling back to it is a no-op.
                    history.clear();
                    return Ok(Restore::Nothing);
                }
            }
        };

        let cycle = target.cycle();
        let decoded = target
            .bytes()
            .and_then(|bytes| Ok(self.codec.decode_unit(unit.context(), &bytes)?))
            .inspect_err(|e| warn!(cycle, current, error = %e, "restore failed"))?;
        unit.install(decoded.entity, cycle);
        if let Some(history) = unit.history_mut() {
            history.nodes.truncate(at);
        }
        debug!(
            from = current,
            to = cycle,
            elapsed_us = started.elapsed().as_micros() as u64,
            "restored snapshot"
        );
        Ok(Restore::Restored { cycle })
    }

    /// Whether the unit has any recorded snapshot.
    pub fn can_step_back<U: Recordable + ?Sized>(&self, unit: &U) -> bool {
        unit.history().is_some_and(History::can_step_back)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
