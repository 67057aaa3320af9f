//! Durable home of the project state document.
//!
//! Mutating commands run under an exclusive `flock` on `command.lock` from
//! load to save. Writes additionally take `state.lock` and are rejected when
//! the on-disk `revision` moved since the caller loaded it. Readers take no
//! lock; the atomic rename guarantees they see a whole file.

pub mod json;

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;

use crate::config::OverseerPaths;
use crate::domain::ProjectState;
use crate::utils::clock::SharedClock;
use json::{JsonDoc, append_jsonl, read_json_doc, write_json};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error(
    "state changed on disk (revision {found}, expected {expected}); another overseer command ran concurrently, retry"
  )]
  Conflict { expected: u64, found: u64 },
  #[error("failed to lock {path}: {source}")]
  Lock {
    path: PathBuf,
    #[source]
    source: nix::errno::Errno,
  },
}

/// Result of reading the state file.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded {
  Absent,
  Present(Box<ProjectState>),
  Corrupt { path: PathBuf, error: String },
}

/// Exclusive advisory lock on the project's lock file, released on drop.
pub struct StateLock {
  _guard: Flock<File>,
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq)]
pub struct Event {
  pub timestamp: chrono::DateTime<chrono::Utc>,
  pub project_id: String,
  pub kind: String,
  pub detail: String,
}

pub struct StateStore {
  paths: OverseerPaths,
  clock: SharedClock,
  backup_retention: usize,
}

impl StateStore {
  #[must_use]
  pub fn new(paths: OverseerPaths, clock: SharedClock, backup_retention: usize) -> Self {
    Self {
      paths,
      clock,
      backup_retention,
    }
  }

  #[must_use]
  pub fn paths(&self) -> &OverseerPaths {
    &self.paths
  }

  /// Read the state file. Malformed content is reported as [`Loaded::Corrupt`].
  ///
  /// # Errors
  /// Only IO failures other than "not found" are errors.
  pub fn load(&self) -> Result<Loaded> {
    let path = self.paths.state_file();
    Ok(match read_json_doc::<ProjectState>(&path)? {
      JsonDoc::Absent => Loaded::Absent,
      JsonDoc::Valid(state) => Loaded::Present(Box::new(state)),
      JsonDoc::Corrupt(error) => Loaded::Corrupt { path, error },
    })
  }

  /// Load the state, falling back to the newest backup that parses when the
  /// main file is corrupt. Returns `None` when nothing usable exists.
  pub fn load_or_recover(&self) -> Result<Option<ProjectState>> {
    match self.load()? {
      Loaded::Absent => Ok(None),
      Loaded::Present(state) => Ok(Some(*state)),
      Loaded::Corrupt { path, error } => {
        log::warn!("state file {} is corrupt: {error}", path.display());
        for backup in self.backups()?.into_iter().rev() {
          if let JsonDoc::Valid(state) = read_json_doc::<ProjectState>(&backup)? {
            crate::log_warn!(
              "Recovered state from backup {} (revision {})",
              backup.display(),
              state.revision
            );
            return Ok(Some(state));
          }
        }
        crate::log_warn!(
          "State file {} is corrupt and no valid backup exists; treating project as absent",
          path.display()
        );
        Ok(None)
      }
    }
  }

  /// Take the exclusive write lock.
  pub fn lock(&self) -> Result<StateLock> {
    self.lock_path(self.paths.lock_file())
  }

  /// Serialize a whole command, load to save, against other mutating
  /// commands. Not reentrant: take it once per command, before [`Self::lock`].
  pub fn lock_command(&self) -> Result<StateLock> {
    self.lock_path(self.paths.command_lock_file())
  }

  fn lock_path(&self, path: PathBuf) -> Result<StateLock> {
    fs::create_dir_all(self.paths.state_dir())
      .with_context(|| format!("failed to create {}", self.paths.state_dir().display()))?;
    let file = OpenOptions::new()
      .create(true)
      .truncate(false)
      .write(true)
      .open(&path)
      .with_context(|| format!("failed to open {}", path.display()))?;
    let guard = Flock::lock(file, FlockArg::LockExclusive)
      .map_err(|(_, source)| StoreError::Lock { path, source })?;
    Ok(StateLock { _guard: guard })
  }

  /// Persist `state`, bumping its revision.
  ///
  /// The write is rejected with [`StoreError::Conflict`] when the on-disk
  /// revision differs from `state.revision`. A corrupt on-disk file never
  /// blocks the write, so a state recovered from a backup can be saved.
  pub fn save(&self, state: &mut ProjectState) -> Result<()> {
    let _lock = self.lock()?;
    self.save_locked(state)
  }

  /// [`Self::save`] for callers already holding [`Self::lock`].
  pub fn save_locked(&self, state: &mut ProjectState) -> Result<()> {
    let path = self.paths.state_file();
    let on_disk = read_json_doc::<ProjectState>(&path)?;
    let found = match &on_disk {
      JsonDoc::Absent => 0,
      JsonDoc::Valid(current) => current.revision,
      JsonDoc::Corrupt(_) => state.revision,
    };
    if found != state.revision {
      return Err(
        StoreError::Conflict {
          expected: state.revision,
          found,
        }
        .into(),
      );
    }
    if !matches!(on_disk, JsonDoc::Absent) {
      self.rotate_backup(&path, found)?;
    }
    state.revision += 1;
    state.updated_at = self.clock.now();
    state.orchestrator_version = crate::VERSION.to_string();
    write_json(&path, state)
  }

  /// Replace whatever is on disk with `state`, ignoring revisions. Used by
  /// `init` (a new project) and checkpoint restore.
  pub fn replace(&self, state: &mut ProjectState) -> Result<()> {
    let _lock = self.lock()?;
    let path = self.paths.state_file();
    let previous = match read_json_doc::<ProjectState>(&path)? {
      JsonDoc::Valid(current) => current.revision,
      JsonDoc::Absent | JsonDoc::Corrupt(_) => 0,
    };
    if path.exists() {
      self.rotate_backup(&path, previous)?;
    }
    state.revision = previous.max(state.revision) + 1;
    state.updated_at = self.clock.now();
    write_json(&path, state)
  }

  /// Backups ordered oldest first.
  pub fn backups(&self) -> Result<Vec<PathBuf>> {
    let dir = self.paths.backups_dir();
    let entries = match fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(err) => return Err(err).with_context(|| format!("failed to read {}", dir.display())),
    };
    let mut out: Vec<PathBuf> = entries
      .flatten()
      .map(|e| e.path())
      .filter(|p| is_backup_name(p))
      .collect();
    out.sort();
    Ok(out)
  }

  /// Copy the current file aside as `state-<ts>-r<revision>.json`, then prune
  /// the oldest copies beyond the retention count.
  fn rotate_backup(&self, current: &Path, revision: u64) -> Result<()> {
    if self.backup_retention == 0 {
      return Ok(());
    }
    let dir = self.paths.backups_dir();
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let stamp = self.clock.now().format("%Y%m%dT%H%M%S%.6fZ");
    let target = dir.join(format!("state-{stamp}-r{revision:08}.json"));
    fs::copy(current, &target).with_context(|| format!("failed to back up to {}", target.display()))?;

    let backups = self.backups()?;
    let excess = backups.len().saturating_sub(self.backup_retention);
    for old in backups.into_iter().take(excess) {
      if let Err(err) = fs::remove_file(&old) {
        log::warn!("failed to prune backup {}: {err}", old.display());
      }
    }
    Ok(())
  }

  /// Append a line to the event journal.
  pub fn append_event(&self, project_id: &str, kind: &str, detail: impl Into<String>) -> Result<()> {
    let event = Event {
      timestamp: self.clock.now(),
      project_id: project_id.to_string(),
      kind: kind.to_string(),
      detail: detail.into(),
    };
    log::debug!("event {}: {}", event.kind, event.detail);
    append_jsonl(&self.paths.events_log(), &event)
  }

  pub fn events(&self) -> Result<Vec<Event>> {
    json::read_jsonl(&self.paths.events_log())
  }
}

fn is_backup_name(path: &Path) -> bool {
  path
    .file_name()
    .and_then(|n| n.to_str())
    .is_some_and(|n| n.starts_with("state-") && n.ends_with(".json"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{Mode, Phase};
  use crate::utils::clock::{Clock as _, FixedClock};
  use chrono::{Duration, TimeZone, Utc};
  use std::sync::Arc;

  fn store(dir: &Path, retention: usize) -> (StateStore, FixedClock) {
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
    let store = StateStore::new(OverseerPaths::new(dir), Arc::new(clock.clone()), retention);
    (store, clock)
  }

  #[test]
  fn load_reports_absent_then_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path(), 10);
    assert_eq!(store.load().unwrap(), Loaded::Absent);

    let mut state = ProjectState::new("build it", Mode::Coding, clock.now());
    store.save(&mut state).unwrap();
    assert_eq!(state.revision, 1);
    match store.load().unwrap() {
      Loaded::Present(loaded) => assert_eq!(*loaded, state),
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn stale_revision_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path(), 10);
    let mut state = ProjectState::new("x", Mode::Coding, clock.now());
    store.save(&mut state).unwrap();

    let mut first = state.clone();
    let mut second = state.clone();
    first.phase = Phase::Planning;
    store.save(&mut first).unwrap();
    second.phase = Phase::Aborted;
    let err = store.save(&mut second).unwrap_err();
    match err.downcast_ref::<StoreError>() {
      Some(StoreError::Conflict { expected, found }) => {
        assert_eq!((*expected, *found), (1, 2));
      }
      other => panic!("expected conflict, got {other:?}"),
    }
    let Loaded::Present(on_disk) = store.load().unwrap() else {
      panic!("state missing");
    };
    assert_eq!(on_disk.phase, Phase::Planning);
  }

  #[test]
  fn corrupt_state_is_reported_and_recovered_from_backup() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path(), 10);
    let mut state = ProjectState::new("x", Mode::Coding, clock.now());
    store.save(&mut state).unwrap();
    clock.advance(Duration::seconds(1));
    state.phase = Phase::Planning;
    store.save(&mut state).unwrap();

    fs::write(store.paths().state_file(), "{ not json").unwrap();
    assert!(matches!(store.load().unwrap(), Loaded::Corrupt { .. }));
    let recovered = store.load_or_recover().unwrap().unwrap();
    assert_eq!(recovered.revision, 1);
    assert_eq!(recovered.phase, Phase::Init);
  }

  #[test]
  fn corrupt_state_without_backups_is_absent() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = store(dir.path(), 10);
    fs::create_dir_all(store.paths().state_dir()).unwrap();
    fs::write(store.paths().state_file(), "").unwrap();
    assert!(store.load_or_recover().unwrap().is_none());
  }

  #[test]
  fn backups_are_pruned_to_retention() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path(), 3);
    let mut state = ProjectState::new("x", Mode::Coding, clock.now());
    for _ in 0..6 {
      store.save(&mut state).unwrap();
      clock.advance(Duration::seconds(1));
    }
    let backups = store.backups().unwrap();
    assert_eq!(backups.len(), 3);
    let newest: ProjectState = json::read_json(backups.last().unwrap()).unwrap().unwrap();
    assert_eq!(newest.revision, 5);
  }

  #[test]
  fn replace_ignores_revision_but_keeps_it_increasing() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path(), 10);
    let mut old = ProjectState::new("old", Mode::Coding, clock.now());
    store.save(&mut old).unwrap();
    store.save(&mut old).unwrap();

    let mut fresh = ProjectState::new("new", Mode::Work, clock.now());
    store.replace(&mut fresh).unwrap();
    assert_eq!(fresh.revision, 3);
    assert_eq!(store.backups().unwrap().len(), 2);
  }

  #[test]
  fn events_are_appended() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = store(dir.path(), 10);
    store.append_event("p", "transition", "init -> planning").unwrap();
    store.append_event("p", "breaker_trip", "tokens").unwrap();
    let events = store.events().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].kind, "breaker_trip");
  }
}
