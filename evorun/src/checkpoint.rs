// src/checkpoint.rs
//
// Durable snapshots of a run.
//
// A checkpoint holds the fully scored population of one generation, the
// score and fitness histories, the best candidate seen so far and the
// evolution engine's opaque state. Resuming restores the engine, breeds the
// stored generation and continues with the next generation number.
//
// On disk a checkpoint is wrapped in an envelope:
//
//   { "schema_version": 1, "payload_sha256": "sha256:<hex>", "payload": {...} }
//
// The hash covers the compact JSON encoding of the payload. Files are
// written to a temp file, fsynced, then renamed over the target, so a crash
// mid-write leaves the previous checkpoint intact.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::EvoConfig;
use crate::error::{EvoError, Result};
use crate::history::{FitnessHistory, ScoreHistory};
use crate::population::{Candidate, Population};

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// File name of the latest checkpoint inside a store directory.
pub const LATEST_CHECKPOINT_FILE: &str = "checkpoint.json";

/// Snapshot of a run after a generation has been scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint<P> {
    /// Generation of `population`.
    pub generation: u64,
    /// Fully scored population of `generation`.
    pub population: Population<P>,
    pub score_history: ScoreHistory,
    pub fitness_history: FitnessHistory,
    /// Best candidate across all generations so far.
    pub best: Option<Candidate<P>>,
    /// EvolutionEngine::snapshot_state output.
    pub engine_state: serde_json::Value,
    /// Wall-clock time of the snapshot, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    schema_version: u32,
    payload_sha256: String,
    payload: serde_json::Value,
}

/// Persists and retrieves checkpoints. Written only from the scheduler thread.
pub trait CheckpointStore<P> {
    /// Atomically replace the stored checkpoint. Saving the same checkpoint
    /// twice leaves the same bytes on disk.
    fn save(&self, checkpoint: &Checkpoint<P>) -> Result<PathBuf>;

    /// Latest checkpoint, or `None` if nothing has been saved yet.
    fn load(&self) -> Result<Option<Checkpoint<P>>>;
}

/// Directory-backed JSON checkpoint store.
#[derive(Debug, Clone)]
pub struct JsonCheckpointStore {
    dir: PathBuf,
    keep_history: bool,
}

impl JsonCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keep_history: false,
        }
    }

    /// Also keep a `checkpoint-<generation>.json` copy of every save.
    pub fn with_history(mut self, keep: bool) -> Self {
        self.keep_history = keep;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_CHECKPOINT_FILE)
    }

    pub fn generation_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("checkpoint-{generation:06}.json"))
    }

    /// Read and verify a checkpoint file.
    pub fn read_file<P: DeserializeOwned>(path: &Path) -> Result<Checkpoint<P>> {
        let bytes = fs::read(path).map_err(|source| EvoError::CheckpointRead {
            path: path.to_path_buf(),
            source,
        })?;
        decode_checkpoint(path, &bytes)
    }
}

impl<P> CheckpointStore<P> for JsonCheckpointStore
where
    P: Serialize + DeserializeOwned,
{
    fn save(&self, checkpoint: &Checkpoint<P>) -> Result<PathBuf> {
        let latest = self.latest_path();
        let bytes = encode_checkpoint(checkpoint)?;

        let write = |path: &Path| -> Result<()> {
            fs::create_dir_all(&self.dir)
                .and_then(|_| atomic_write(path, &bytes))
                .map_err(|source| EvoError::CheckpointWrite {
                    path: path.to_path_buf(),
                    source,
                })
        };

        if self.keep_history {
            write(&self.generation_path(checkpoint.generation))?;
        }
        write(&latest)?;

        info!(
            generation = checkpoint.generation,
            path = %latest.display(),
            bytes = bytes.len(),
            "checkpoint written"
        );
        Ok(latest)
    }

    fn load(&self) -> Result<Option<Checkpoint<P>>> {
        let path = self.latest_path();
        if !path.exists() {
            debug!(path = %path.display(), "no checkpoint to load");
            return Ok(None);
        }
        Self::read_file(&path).map(Some)
    }
}

/// Serialise a checkpoint into its hashed envelope.
pub fn encode_checkpoint<P: Serialize>(checkpoint: &Checkpoint<P>) -> Result<Vec<u8>> {
    let payload = serde_json::to_value(checkpoint)?;
    let envelope = Envelope {
        schema_version: CHECKPOINT_SCHEMA_VERSION,
        payload_sha256: payload_digest(&payload)?,
        payload,
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

/// Parse and verify an envelope. `path` is only used for error reporting.
pub fn decode_checkpoint<P: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<Checkpoint<P>> {
    let corrupt = |reason: String| EvoError::CheckpointCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| corrupt(format!("unreadable envelope: {e}")))?;
    if envelope.schema_version != CHECKPOINT_SCHEMA_VERSION {
        return Err(corrupt(format!(
            "unsupported schema version {} (expected {})",
            envelope.schema_version, CHECKPOINT_SCHEMA_VERSION
        )));
    }

    let actual = payload_digest(&envelope.payload)?;
    if actual != envelope.payload_sha256 {
        return Err(corrupt(format!(
            "payload hash mismatch: recorded {}, computed {}",
            envelope.payload_sha256, actual
        )));
    }

    serde_json::from_value(envelope.payload).map_err(|e| corrupt(format!("invalid payload: {e}")))
}

fn payload_digest(payload: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("sha256:{}", hex_encode(&hasher.finalize())))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Write `data` to `path` via temp file + fsync + rename.
///
/// The temp file lives next to the target so the rename stays on one
/// filesystem.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let temp_name = format!(
        ".tmp_{}_{}",
        std::process::id(),
        path.file_name()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default()
    );
    let temp_path = parent.join(&temp_name);

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Decides when a checkpoint is due: every N generations or every T seconds,
/// whichever comes first. Both timers restart after each checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointCadence {
    every_n_generations: Option<u64>,
    every: Option<Duration>,
    last_generation: Option<u64>,
    last_time: Instant,
}

impl CheckpointCadence {
    pub fn new(every_n_generations: Option<u64>, every: Option<Duration>) -> Self {
        Self {
            every_n_generations,
            every,
            last_generation: None,
            last_time: Instant::now(),
        }
    }

    pub fn from_config(cfg: &EvoConfig) -> Self {
        Self::new(
            cfg.checkpoint_every_n_generations,
            cfg.checkpoint_every_n_seconds.map(Duration::from_secs),
        )
    }

    /// Treat `generation` as already checkpointed (used after resume).
    pub fn with_last_generation(mut self, generation: u64) -> Self {
        self.last_generation = Some(generation);
        self
    }

    /// Is a checkpoint due after `generation` finished at `now`?
    ///
    /// Counting starts before generation 0, so with N = 10 the first
    /// checkpoint follows generation 9.
    pub fn is_due(&self, generation: u64, now: Instant) -> bool {
        if let Some(every) = self.every {
            if now.saturating_duration_since(self.last_time) >= every {
                return true;
            }
        }
        if let Some(n) = self.every_n_generations {
            let elapsed = match self.last_generation {
                Some(last) => generation.saturating_sub(last),
                None => generation + 1,
            };
            if elapsed >= n {
                return true;
            }
        }
        false
    }

    /// Restart both timers after a successful checkpoint. Not called for a
    /// failed write, which leaves the cadence due for the next generation.
    pub fn mark(&mut self, generation: u64, now: Instant) {
        self.last_generation = Some(generation);
        self.last_time = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::population::{CandidateId, CandidateStatus};

    fn sample_checkpoint() -> Checkpoint<Vec<f32>> {
        let mut pop = Population::from_policies(vec![vec![0.5f32, -1.25], vec![3.0]]).unwrap();
        pop.candidates_mut()[0].fitness = Some(1.5);
        pop.candidates_mut()[0].status = CandidateStatus::Scored;
        pop.candidates_mut()[1].fitness = Some(-2.0);
        pop.candidates_mut()[1].status = CandidateStatus::Failed;
        Checkpoint {
            generation: 0,
            best: pop.get(CandidateId(0)).cloned(),
            population: pop,
            score_history: ScoreHistory::new(),
            fitness_history: FitnessHistory::new(),
            engine_state: serde_json::json!({"next_id": 2}),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let cp = sample_checkpoint();
        let bytes = encode_checkpoint(&cp).unwrap();
        let back: Checkpoint<Vec<f32>> = decode_checkpoint(Path::new("mem"), &bytes).unwrap();
        assert_eq!(cp, back);
    }

    #[test]
    fn test_tampered_payload_is_corrupt() {
        let cp = sample_checkpoint();
        let bytes = encode_checkpoint(&cp).unwrap();
        let mut v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        v["payload"]["generation"] = serde_json::json!(7);
        let tampered = serde_json::to_vec(&v).unwrap();

        let res: Result<Checkpoint<Vec<f32>>> = decode_checkpoint(Path::new("mem"), &tampered);
        assert!(matches!(res, Err(EvoError::CheckpointCorrupt { .. })));
    }

    #[test]
    fn test_invalid_population_with_valid_hash_is_corrupt() {
        let bytes = encode_checkpoint(&sample_checkpoint()).unwrap();
        let envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        let rehash = |mut payload: serde_json::Value, edit: &dyn Fn(&mut serde_json::Value)| {
            edit(&mut payload);
            let digest = payload_digest(&payload).unwrap();
            let mut v = envelope.clone();
            v["payload"] = payload;
            v["payload_sha256"] = serde_json::json!(digest);
            serde_json::to_vec(&v).unwrap()
        };

        let duplicated = rehash(envelope["payload"].clone(), &|p| {
            let first = p["population"]["candidates"][0].clone();
            p["population"]["candidates"][1] = first;
        });
        let res: Result<Checkpoint<Vec<f32>>> = decode_checkpoint(Path::new("mem"), &duplicated);
        match res {
            Err(EvoError::CheckpointCorrupt { reason, .. }) => {
                assert!(reason.contains("duplicate"), "{reason}")
            }
            other => panic!("expected corrupt checkpoint, got {other:?}"),
        }

        let emptied = rehash(envelope["payload"].clone(), &|p| {
            p["population"]["candidates"] = serde_json::json!([]);
        });
        let res: Result<Checkpoint<Vec<f32>>> = decode_checkpoint(Path::new("mem"), &emptied);
        assert!(matches!(res, Err(EvoError::CheckpointCorrupt { .. })));
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let bytes = encode_checkpoint(&sample_checkpoint()).unwrap();
        let res: Result<Checkpoint<Vec<f32>>> =
            decode_checkpoint(Path::new("mem"), &bytes[..bytes.len() / 2]);
        assert!(matches!(res, Err(EvoError::CheckpointCorrupt { .. })));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let cp = sample_checkpoint();
        assert_eq!(encode_checkpoint(&cp).unwrap(), encode_checkpoint(&cp).unwrap());
    }

    #[test]
    fn test_cadence_every_n_generations() {
        let now = Instant::now();
        let mut c = CheckpointCadence::new(Some(10), None);
        assert!(!c.is_due(0, now));
        assert!(!c.is_due(8, now));
        assert!(c.is_due(9, now));
        c.mark(9, now);
        assert!(!c.is_due(18, now));
        assert!(c.is_due(19, now));
    }

    #[test]
    fn test_cadence_time_trigger() {
        let start = Instant::now();
        let mut c = CheckpointCadence::new(None, Some(Duration::from_secs(900)));
        assert!(!c.is_due(0, start));
        let later = start + Duration::from_secs(901);
        assert!(c.is_due(1, later));
        c.mark(1, later);
        assert!(!c.is_due(2, later + Duration::from_secs(10)));
    }

    #[test]
    fn test_cadence_disabled() {
        let c = CheckpointCadence::new(None, None);
        assert!(!c.is_due(1_000, Instant::now() + Duration::from_secs(1_000_000)));
    }
}
