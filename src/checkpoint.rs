//! Checkpoint snapshots and the store trait.
//!
//! A snapshot is a self-contained record of a run's state at one superstep
//! boundary: the full channel map, progress bookkeeping, cycle counters, and
//! the writes produced during the superstep. Snapshots form an append-only
//! sequence per run; the latest one is the authoritative resume point.
//!
//! Snapshots serialize to canonical JSON (map keys are sorted) and are
//! framed with zstd compression when that actually shrinks them.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

/// Classification of a recorded write, mirrored in the run-details API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteKind {
    /// A state channel (`Node.output` or a workflow input).
    State,
    /// A control decision: a downstream step enabled by this write.
    Branch,
    /// Engine-internal bookkeeping.
    System,
}

/// One channel write produced by a node invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub kind: WriteKind,
    pub channel: String,
    pub value: Value,
}

/// Trace of one node invocation within a superstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTrace {
    pub node: String,
    pub task_id: String,
    pub writes: Vec<WriteRecord>,
    /// Steps that became ready because of this invocation.
    pub branches: Vec<String>,
}

/// Per-run state snapshot at a superstep boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub superstep: u32,
    pub ts: DateTime<Utc>,
    /// Full channel map at this boundary.
    pub channels: BTreeMap<String, Value>,
    /// Completed workflow-level steps (nodes and cycles).
    pub completed: BTreeSet<String>,
    /// Workflow-level nodes permanently skipped by a false `when`.
    pub skipped: BTreeSet<String>,
    /// Finished iteration count per cycle.
    pub cycle_iterations: BTreeMap<String, u32>,
    /// Cycle currently in flight, if any.
    pub active_cycle: Option<String>,
    /// Internal nodes still pending in the active cycle iteration.
    pub pending: Vec<String>,
    /// Node awaiting external input (HITL).
    pub suspended_node: Option<String>,
    /// Writes log for this superstep.
    pub traces: Vec<NodeTrace>,
    /// Error recorded before the run was marked failed.
    pub error: Option<String>,
}

impl Snapshot {
    /// Initial snapshot for a fresh run: the channel map holds the workflow
    /// inputs and nothing has executed.
    pub fn initial(channels: BTreeMap<String, Value>) -> Self {
        Self {
            superstep: 0,
            ts: Utc::now(),
            channels,
            completed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            cycle_iterations: BTreeMap::new(),
            active_cycle: None,
            pending: Vec::new(),
            suspended_node: None,
            traces: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("checkpoint store database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt checkpoint: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence backend for checkpoints. The engine is agnostic: the CLI uses
/// the embedded SQLite store, server mode shares the orchestrator's Postgres.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot keyed by `(run_id, snapshot.superstep)`.
    /// Saving the same superstep twice overwrites (resume after a crash
    /// re-executes from the previous boundary).
    async fn save(&self, run_id: uuid::Uuid, snapshot: &Snapshot) -> StoreResult<()>;

    /// Latest snapshot for a run, if any.
    async fn load_latest(&self, run_id: uuid::Uuid) -> StoreResult<Option<Snapshot>>;

    /// All snapshots for a run ordered by superstep.
    async fn list(&self, run_id: uuid::Uuid) -> StoreResult<Vec<Snapshot>>;

    /// Delete checkpoints for runs that reached a terminal state more than
    /// `ttl_secs` ago. Returns the number of deleted rows.
    async fn purge_expired(&self, ttl_secs: i64) -> StoreResult<u64>;
}

// ----------------------------------------------------------------------------
// Snapshot wire encoding
// ----------------------------------------------------------------------------

const FRAME_MAGIC: [u8; 4] = *b"WRLZ";
const FRAME_VERSION: u8 = 1;
const FRAME_CODEC_ZSTD: u8 = 1;
const FRAME_HEADER_LEN: usize = 4 + 1 + 1 + 8;
const FRAME_ZSTD_LEVEL: i32 = 3;

/// Serialize a snapshot to framed bytes, compressed when it helps.
pub fn encode_snapshot(snapshot: &Snapshot) -> StoreResult<Vec<u8>> {
    let raw = serde_json::to_vec(snapshot)?;
    let compressed = match zstd::bulk::compress(&raw, FRAME_ZSTD_LEVEL) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(?err, "failed to compress snapshot; storing uncompressed");
            return Ok(raw);
        }
    };

    if compressed.len() + FRAME_HEADER_LEN >= raw.len() {
        return Ok(raw);
    }

    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + compressed.len());
    out.extend_from_slice(&FRAME_MAGIC);
    out.push(FRAME_VERSION);
    out.push(FRAME_CODEC_ZSTD);
    out.extend_from_slice(&(raw.len() as u64).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decode framed snapshot bytes produced by [`encode_snapshot`].
pub fn decode_snapshot(bytes: &[u8]) -> StoreResult<Snapshot> {
    if bytes.len() < FRAME_HEADER_LEN || !bytes.starts_with(&FRAME_MAGIC) {
        return Ok(serde_json::from_slice(bytes)?);
    }

    let version = bytes[FRAME_MAGIC.len()];
    let codec = bytes[FRAME_MAGIC.len() + 1];
    if version != FRAME_VERSION || codec != FRAME_CODEC_ZSTD {
        return Err(StoreError::Corrupt(format!(
            "unknown snapshot frame header (version {}, codec {})",
            version, codec
        )));
    }

    let len_start = FRAME_MAGIC.len() + 2;
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[len_start..len_start + 8]);
    let raw_len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| StoreError::Corrupt("snapshot length overflow".to_string()))?;

    let decoded = zstd::bulk::decompress(&bytes[FRAME_HEADER_LEN..], raw_len)
        .map_err(|err| StoreError::Corrupt(format!("zstd decompress failed: {}", err)))?;
    Ok(serde_json::from_slice(&decoded)?)
}
