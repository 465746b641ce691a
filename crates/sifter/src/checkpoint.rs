//! Durable run state.
//!
//! Each run lives in its own directory under the runs root:
//!
//! ```text
//! <state_dir>/runs/<run_id>/checkpoint.json
//! ```
//!
//! Saves are atomic. The new snapshot is written to a temporary file in the same directory,
//! synced, and renamed over the previous checkpoint, so a crash at any point leaves either the
//! old or the new snapshot on disk, never a torn one. Saves are serialized through an internal
//! lock and hold no file handles between calls.
//!
//! Loading is forgiving about what it cannot read and strict about what it can:
//! - A missing file yields `None`.
//! - A file that does not parse is archived next to the original as
//!   `checkpoint.json.corrupt-<timestamp>` and also yields `None`. [`CheckpointStore::inspect`]
//!   is the read-only variant: it leaves such a file in place and reports it as
//!   [`SifterError::CorruptCheckpoint`].
//! - A file that parses but cannot be trusted (wrong run id, duplicate record ids, a newer
//!   format version) is refused with [`SifterError::AmbiguousCheckpoint`].
//! - Unknown fields are ignored so that older binaries can read newer checkpoints of the same
//!   format version.
//!
//! Run ids name directories, so they are restricted to ASCII letters, digits, `-`, `_` and `.`
//! and may not start with a dot. See [`validate_run_id`].

use std::{collections::HashSet, io::Write, time::Duration};

use tokio::sync::{Mutex, RwLock};

use super::*;
use crate::{
  backoff::BackoffPolicy,
  record::{Record, Status},
  stage::Stage,
};

/// Rejects run ids that could escape the runs root or name a hidden directory.
pub fn validate_run_id(run_id: &str) -> Result<()> {
  let valid = !run_id.is_empty()
    && !run_id.starts_with('.')
    && run_id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
  if valid {
    Ok(())
  } else {
    Err(SifterError::Config(format!(
      "invalid run id '{run_id}': use letters, digits, '-', '_' or '.', not starting with '.'"
    )))
  }
}

/// Checkpoint format version written by this build.
pub const CHECKPOINT_VERSION: u32 = 1;

/// File name of the checkpoint inside a run directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// A record that needs a human to find its full text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualQueueEntry {
  /// Record id.
  pub id:        String,
  /// Title, for the operator's convenience.
  pub title:     String,
  /// Normalized DOI, if known.
  pub doi:       Option<String>,
  /// Providers that were exhausted.
  pub providers: Vec<String>,
  /// When the record was queued.
  pub queued_at: DateTime<Utc>,
}

/// Persisted snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
  /// Format version.
  pub version:      u32,
  /// Logical run identifier.
  pub run_id:       String,
  /// When the run was created.
  pub created_at:   DateTime<Utc>,
  /// When this snapshot was taken.
  pub updated_at:   DateTime<Utc>,
  /// Number of stages, counted from the start of [`Stage::ALL`], that have been dispatched for
  /// the whole batch.
  #[serde(default)]
  pub stage_cursor: usize,
  /// Every record in the run, in batch order.
  pub records:      Vec<Record>,
  /// Records waiting for manual acquisition.
  #[serde(default)]
  pub manual_queue: Vec<ManualQueueEntry>,
}

impl Checkpoint {
  /// Creates a fresh checkpoint for `run_id`.
  ///
  /// Records whose id was already seen are dropped, keeping the first, so that every saved
  /// checkpoint can be resumed.
  pub fn new(run_id: impl Into<String>, records: Vec<Record>) -> Self {
    let run_id = run_id.into();
    let mut seen = HashSet::new();
    let before = records.len();
    let records: Vec<Record> = records.into_iter().filter(|r| seen.insert(r.id.clone())).collect();
    if records.len() < before {
      warn!(run_id = %run_id, "Dropped {} records with duplicate ids", before - records.len());
    }
    let now = Utc::now();
    Self {
      version: CHECKPOINT_VERSION,
      run_id,
      created_at: now,
      updated_at: now,
      stage_cursor: 0,
      records,
      manual_queue: Vec::new(),
    }
  }

  /// Looks up a record by id.
  pub fn record(&self, id: &str) -> Option<&Record> { self.records.iter().find(|r| r.id == id) }

  /// Counts records per status, keyed like `stage_complete(screen)` or `done`.
  pub fn counts(&self) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in &self.records {
      let status = record.status();
      let key = match status.stage() {
        Some(stage) => format!("{}({stage})", status.label()),
        None => status.label().to_string(),
      };
      *counts.entry(key).or_insert(0) += 1;
    }
    counts
  }

  /// Counts records per terminal label (`done`, `failed`, `skipped`) plus `unfinished`.
  pub fn terminal_counts(&self) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for record in &self.records {
      let key = if record.status().is_terminal() { record.status().label() } else { "unfinished" };
      *counts.entry(key).or_insert(0) += 1;
    }
    counts
  }

  /// Ensures the snapshot can be resumed as `run_id`.
  fn check(&self, path: &Path, run_id: &str) -> Result<()> {
    let ambiguous = |reason: String| SifterError::AmbiguousCheckpoint {
      path: path.to_path_buf(),
      reason,
    };
    if self.version > CHECKPOINT_VERSION {
      return Err(ambiguous(format!(
        "format version {} is newer than supported version {CHECKPOINT_VERSION}",
        self.version
      )));
    }
    if self.run_id != run_id {
      return Err(ambiguous(format!("checkpoint belongs to run '{}'", self.run_id)));
    }
    if self.stage_cursor > Stage::ALL.len() {
      return Err(ambiguous(format!("stage cursor {} is out of range", self.stage_cursor)));
    }
    let mut seen = HashSet::new();
    for record in &self.records {
      if !seen.insert(record.id.as_str()) {
        return Err(ambiguous(format!("duplicate record id '{}'", record.id)));
      }
    }
    Ok(())
  }
}

/// Minimal view of a checkpoint used when listing runs.
#[derive(Debug, Clone, Deserialize)]
pub struct RunInfo {
  /// Run identifier.
  pub run_id:     String,
  /// Creation time.
  pub created_at: DateTime<Utc>,
  /// Last save.
  pub updated_at: DateTime<Utc>,
}

/// Owner of all persisted run state.
#[derive(Debug)]
pub struct CheckpointStore {
  root:         PathBuf,
  backoff:      BackoffPolicy,
  max_attempts: u32,
  writer:       Mutex<()>,
  index:        RwLock<HashMap<String, Status>>,
}

impl CheckpointStore {
  /// Creates a store rooted at `root` (usually `<state_dir>/runs`).
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root:         root.into(),
      backoff:      BackoffPolicy::new(Duration::from_millis(100))
        .with_ceiling(Duration::from_secs(2)),
      max_attempts: 3,
      writer:       Mutex::new(()),
      index:        RwLock::new(HashMap::new()),
    }
  }

  /// Overrides the retry schedule used by [`save`](Self::save).
  pub fn with_retry(mut self, backoff: BackoffPolicy, max_attempts: u32) -> Self {
    self.backoff = backoff;
    self.max_attempts = max_attempts.max(1);
    self
  }

  /// Root directory of all runs.
  pub fn root(&self) -> &Path { &self.root }

  /// Directory of a run.
  pub fn run_dir(&self, run_id: &str) -> PathBuf { self.root.join(run_id) }

  /// Checkpoint file of a run.
  pub fn path_for(&self, run_id: &str) -> PathBuf { self.run_dir(run_id).join(CHECKPOINT_FILE) }

  /// Loads the checkpoint of `run_id`.
  ///
  /// Returns `Ok(None)` when there is nothing usable to resume from. See the module docs for how
  /// corrupt and ambiguous files are handled.
  pub async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>> {
    let path = self.path_for(run_id);
    let Some(bytes) = self.read(run_id).await? else { return Ok(None) };

    let checkpoint: Checkpoint = match serde_json::from_slice(&bytes) {
      Ok(checkpoint) => checkpoint,
      Err(e) => {
        let archived = self.archive_corrupt(&path).await?;
        warn!(
          "Checkpoint {} is unreadable ({e}); archived as {} and starting fresh",
          path.display(),
          archived.display()
        );
        return Ok(None);
      },
    };
    checkpoint.check(&path, run_id)?;

    self.reindex(&checkpoint).await;
    debug!("Loaded checkpoint for run {} with {} records", run_id, checkpoint.records.len());
    Ok(Some(checkpoint))
  }

  /// Reads the checkpoint of `run_id` without touching anything on disk.
  ///
  /// Unlike [`load`](Self::load), an unparsable file is left where it is and reported as
  /// [`SifterError::CorruptCheckpoint`].
  pub async fn inspect(&self, run_id: &str) -> Result<Option<Checkpoint>> {
    let path = self.path_for(run_id);
    let Some(bytes) = self.read(run_id).await? else { return Ok(None) };
    let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
      .map_err(|source| SifterError::CorruptCheckpoint { path: path.clone(), source })?;
    checkpoint.check(&path, run_id)?;
    Ok(Some(checkpoint))
  }

  async fn read(&self, run_id: &str) -> Result<Option<Vec<u8>>> {
    validate_run_id(run_id)?;
    let path = self.path_for(run_id);
    match tokio::fs::read(&path).await {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!("No checkpoint at {}", path.display());
        Ok(None)
      },
      Err(e) => Err(e.into()),
    }
  }

  /// Atomically replaces the checkpoint of `checkpoint.run_id`.
  ///
  /// I/O failures are retried with backoff. After the last attempt the error surfaces as
  /// [`SifterError::Persistence`] and the previous checkpoint is left as it was.
  pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
    validate_run_id(&checkpoint.run_id)?;
    let bytes = serde_json::to_vec_pretty(checkpoint)?;
    let path = self.path_for(&checkpoint.run_id);

    let _guard = self.writer.lock().await;
    let mut attempt = 0;
    loop {
      attempt += 1;
      match write_atomic(path.clone(), bytes.clone()).await {
        Ok(()) => break,
        Err(source) if attempt >= self.max_attempts => {
          error!("Giving up on checkpoint {} after {attempt} attempts: {source}", path.display());
          return Err(SifterError::Persistence { path, attempts: attempt, source });
        },
        Err(e) => {
          let delay = self.backoff.delay(attempt - 1);
          warn!(
            "Checkpoint write to {} failed (attempt {attempt}): {e}; retrying in {delay:?}",
            path.display()
          );
          tokio::time::sleep(delay).await;
        },
      }
    }
    drop(_guard);

    self.reindex(checkpoint).await;
    trace!("Saved checkpoint for run {}", checkpoint.run_id);
    Ok(())
  }

  /// Status of a record as of the last load or save.
  pub async fn record_status(&self, id: &str) -> Option<Status> {
    self.index.read().await.get(id).cloned()
  }

  /// Every run with a readable checkpoint, most recently updated first.
  pub async fn runs(&self) -> Result<Vec<RunInfo>> {
    let mut runs = Vec::new();
    let mut entries = match tokio::fs::read_dir(&self.root).await {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
      Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
      let path = entry.path().join(CHECKPOINT_FILE);
      let Ok(bytes) = tokio::fs::read(&path).await else { continue };
      match serde_json::from_slice::<RunInfo>(&bytes) {
        Ok(info) => runs.push(info),
        Err(e) => debug!("Skipping unreadable checkpoint {}: {e}", path.display()),
      }
    }
    runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(runs)
  }

  /// The most recently updated run, if any.
  pub async fn latest(&self) -> Result<Option<String>> {
    Ok(self.runs().await?.into_iter().next().map(|info| info.run_id))
  }

  async fn reindex(&self, checkpoint: &Checkpoint) {
    let mut index = self.index.write().await;
    index.clear();
    index.extend(checkpoint.records.iter().map(|r| (r.id.clone(), r.status().clone())));
  }

  async fn archive_corrupt(&self, path: &Path) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let mut archived = path.as_os_str().to_owned();
    archived.push(format!(".corrupt-{stamp}"));
    let archived = PathBuf::from(archived);
    tokio::fs::rename(path, &archived).await?;
    Ok(archived)
  }
}

/// Writes `bytes` to `path` through a synced temporary file and a rename.
async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> std::io::Result<()> {
  tokio::task::spawn_blocking(move || {
    let dir = path.parent().ok_or_else(|| std::io::Error::other("checkpoint path has no parent"))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new().prefix(".checkpoint.").suffix(".tmp").tempfile_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(())
  })
  .await
  .map_err(std::io::Error::other)?
}
