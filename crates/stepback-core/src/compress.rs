//! Background compression of history nodes.
//!
//! Compression runs on one process-wide pool shared by every recorder. Each
//! submitted node is marked pending until its job finishes, so a restore that
//! reaches the node first simply waits for it. [`drain`] blocks until no job
//! is in flight, which is what tests use to make compression observable.

use crate::history::HistoryNode;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use parking_lot::{Condvar, Mutex, const_mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::io::{self, Read, Write};
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// Marker of a node that holds the encoder's bytes as-is.
pub const UNCOMPRESSED: u8 = 0;

/// Marker of a node whose bytes are zlib-compressed.
pub const COMPRESSED: u8 = 1;

pub const DEFAULT_LEVEL: u32 = 6;

/// Upper bound on compression workers.
const MAX_WORKERS: usize = 4;

// ---------------------------------------------------------------------------
// zlib helpers
// ---------------------------------------------------------------------------

/// Compress `bytes` with zlib at `level` (clamped to 0..=9).
pub fn zip(bytes: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(bytes.len() / 2),
        Compression::new(level.min(9)),
    );
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn unzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    ZlibDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Pool and in-flight tracking
// ---------------------------------------------------------------------------

static IN_FLIGHT: Mutex<usize> = const_mutex(0);
static IDLE: Condvar = Condvar::new();

fn pool() -> Option<&'static ThreadPool> {
    static POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();
    POOL.get_or_init(|| {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get().min(MAX_WORKERS))
            .unwrap_or(2);
        match ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("stepback-zip-{i}"))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!(error = %e, "compression pool unavailable, compressing inline");
                None
            }
        }
    })
    .as_ref()
}

fn enter() {
    *IN_FLIGHT.lock() += 1;
}

fn leave() {
    let mut n = IN_FLIGHT.lock();
    *n -= 1;
    if *n == 0 {
        IDLE.notify_all();
    }
}

/// Block until every submitted compression job has finished.
pub fn drain() {
    let mut n = IN_FLIGHT.lock();
    while *n > 0 {
        IDLE.wait(&mut n);
    }
}

/// Number of compression jobs submitted but not yet finished.
pub fn in_flight() -> usize {
    *IN_FLIGHT.lock()
}

// ---------------------------------------------------------------------------
// Compressor
// ---------------------------------------------------------------------------

/// Submits history nodes to the shared compression pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compressor {
    level: u32,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}

impl Compressor {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Compress `node` in the background. Nodes that are already compressed
    /// or already queued are left alone.
    pub fn submit(&self, node: Arc<HistoryNode>) {
        if !node.begin_compression() {
            return;
        }
        enter();
        let level = self.level;
        let job = move || {
            node.compress_now(level);
            leave();
        };
        match pool() {
            Some(pool) => pool.spawn(job),
            None => job(),
        }
    }
}
