//! Registry of processes started on behalf of a project, and the orphan sweep.
//!
//! Kill rules: only registered PIDs, never our own process or its parent,
//! only after two consecutive orphan observations, and only once the audit
//! line is on disk.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::config::{OverseerPaths, Timeouts};
use crate::domain::{Phase, ProjectState};
use crate::store::json::{JsonDoc, append_jsonl, read_json_doc, write_json};
use crate::utils::clock::SharedClock;

/// Observations of "orphaned" required before a kill.
pub const KILL_AFTER_OBSERVATIONS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
  AgentWorker,
  Helper,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRegistryEntry {
  pub pid: u32,
  pub project_id: String,
  pub registered_at: DateTime<Utc>,
  pub kind: ProcessKind,
  /// Phase whose work required the process.
  pub phase: Phase,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub role: Option<String>,
  #[serde(default)]
  pub orphan_observations: u32,
}

pub type Registry = BTreeMap<u32, ProcessRegistryEntry>;

/// One line of `kills.log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillRecord {
  pub timestamp: DateTime<Utc>,
  pub pid: u32,
  pub project: String,
  pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
  pub killed: Vec<KillRecord>,
  /// First orphan observation, no action taken yet.
  pub flagged: Vec<(u32, String)>,
  /// Dead processes removed from the registry.
  pub reaped: Vec<u32>,
  /// Orphans that are protected from termination.
  pub skipped: Vec<(u32, String)>,
}

impl SweepReport {
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.killed.is_empty() && self.flagged.is_empty() && self.reaped.is_empty() && self.skipped.is_empty()
  }
}

/// Process liveness and signalling, injected so tests never touch real PIDs.
pub trait ProcessControl {
  fn is_alive(&self, pid: u32) -> bool;
  fn terminate(&self, pid: u32) -> Result<()>;
  fn own_pid(&self) -> u32;
  fn parent_pid(&self) -> u32;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NixProcessControl;

fn to_pid(pid: u32) -> Option<Pid> {
  i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

impl ProcessControl for NixProcessControl {
  fn is_alive(&self, pid: u32) -> bool {
    let Some(pid) = to_pid(pid) else {
      return false;
    };
    // EPERM means the process exists but belongs to someone else.
    matches!(signal::kill(pid, None), Ok(()) | Err(Errno::EPERM))
  }

  fn terminate(&self, pid: u32) -> Result<()> {
    let target = to_pid(pid).with_context(|| format!("invalid pid {pid}"))?;
    match signal::kill(target, Signal::SIGTERM) {
      Ok(()) | Err(Errno::ESRCH) => Ok(()),
      Err(err) => Err(err).with_context(|| format!("failed to send SIGTERM to {pid}")),
    }
  }

  fn own_pid(&self) -> u32 {
    std::process::id()
  }

  fn parent_pid(&self) -> u32 {
    u32::try_from(nix::unistd::getppid().as_raw()).unwrap_or(0)
  }
}

pub struct ProcessMonitor<C: ProcessControl> {
  paths: OverseerPaths,
  clock: SharedClock,
  timeouts: Timeouts,
  control: C,
}

impl<C: ProcessControl> ProcessMonitor<C> {
  pub fn new(paths: OverseerPaths, clock: SharedClock, timeouts: Timeouts, control: C) -> Self {
    Self {
      paths,
      clock,
      timeouts,
      control,
    }
  }

  fn backup_path(&self) -> PathBuf {
    self.paths.state_dir().join("processes.json.bak")
  }

  fn lock(&self) -> Result<Flock<File>> {
    let path = self.paths.lock_file();
    std::fs::create_dir_all(self.paths.state_dir())
      .with_context(|| format!("failed to create {}", self.paths.state_dir().display()))?;
    let file = OpenOptions::new()
      .create(true)
      .truncate(false)
      .write(true)
      .open(&path)
      .with_context(|| format!("failed to open {}", path.display()))?;
    Flock::lock(file, FlockArg::LockExclusive)
      .map_err(|(_, errno)| anyhow::anyhow!("failed to lock {}: {errno}", path.display()))
  }

  /// Read the registry; a damaged file falls back to its `.bak` copy.
  pub fn load(&self) -> Result<Registry> {
    let path = self.paths.registry_file();
    match read_json_doc::<Registry>(&path)? {
      JsonDoc::Absent => Ok(Registry::new()),
      JsonDoc::Valid(reg) => Ok(reg),
      JsonDoc::Corrupt(err) => {
        log::warn!("process registry {} is corrupt: {err}", path.display());
        match read_json_doc::<Registry>(&self.backup_path())? {
          JsonDoc::Valid(reg) => {
            crate::log_warn!("Recovered process registry from {}", self.backup_path().display());
            Ok(reg)
          }
          _ => {
            crate::log_warn!("Process registry is unreadable; starting with an empty registry");
            Ok(Registry::new())
          }
        }
      }
    }
  }

  fn store(&self, registry: &Registry) -> Result<()> {
    let path = self.paths.registry_file();
    if let JsonDoc::Valid(previous) = read_json_doc::<Registry>(&path)? {
      write_json(&self.backup_path(), &previous)?;
    }
    write_json(&path, registry)
  }

  pub fn register(
    &self,
    pid: u32,
    project_id: &str,
    kind: ProcessKind,
    phase: Phase,
    role: Option<String>,
  ) -> Result<ProcessRegistryEntry> {
    if to_pid(pid).is_none() {
      anyhow::bail!("invalid pid {pid}");
    }
    let _lock = self.lock()?;
    let mut registry = self.load()?;
    let entry = ProcessRegistryEntry {
      pid,
      project_id: project_id.to_string(),
      registered_at: self.clock.now(),
      kind,
      phase,
      role,
      orphan_observations: 0,
    };
    registry.insert(pid, entry.clone());
    self.store(&registry)?;
    log::debug!("registered pid {pid} for {project_id} ({phase})");
    Ok(entry)
  }

  /// Remove `pid`. Returns whether it was registered.
  pub fn unregister(&self, pid: u32) -> Result<bool> {
    let _lock = self.lock()?;
    let mut registry = self.load()?;
    let removed = registry.remove(&pid).is_some();
    if removed {
      self.store(&registry)?;
    }
    Ok(removed)
  }

  pub fn unregister_many(&self, pids: &[u32]) -> Result<usize> {
    if pids.is_empty() {
      return Ok(0);
    }
    let _lock = self.lock()?;
    let mut registry = self.load()?;
    let before = registry.len();
    registry.retain(|pid, _| !pids.contains(pid));
    let removed = before - registry.len();
    if removed > 0 {
      self.store(&registry)?;
    }
    Ok(removed)
  }

  /// Remove those of `pids` that are no longer running. Live ones stay
  /// registered for the orphan sweep.
  pub fn unregister_exited(&self, pids: &[u32]) -> Result<usize> {
    let exited: Vec<u32> = pids
      .iter()
      .copied()
      .filter(|pid| !self.control.is_alive(*pid))
      .collect();
    self.unregister_many(&exited)
  }

  /// Why `entry` no longer has a reason to run, if it does not.
  #[must_use]
  pub fn orphan_reason(
    &self,
    entry: &ProcessRegistryEntry,
    state: Option<&ProjectState>,
    now: DateTime<Utc>,
  ) -> Option<String> {
    let Some(state) = state else {
      return Some("project state is absent".to_string());
    };
    if state.project_id != entry.project_id {
      return Some(format!("project {} was replaced", entry.project_id));
    }
    if state.phase.is_terminal() {
      return Some(format!("project is {}", state.phase));
    }
    if phase_advanced(entry.phase, state) {
      return Some(format!(
        "phase advanced from {} to {}",
        entry.phase, state.phase
      ));
    }
    let limit = self.timeouts.for_phase(entry.phase);
    if now - entry.registered_at > limit {
      return Some(format!(
        "running longer than the {} timeout ({}s)",
        entry.phase,
        limit.num_seconds()
      ));
    }
    None
  }

  /// One pass over the registry.
  pub fn sweep(&self, state: Option<&ProjectState>) -> Result<SweepReport> {
    let _lock = self.lock()?;
    let mut registry = self.load()?;
    let now = self.clock.now();
    let own = self.control.own_pid();
    let parent = self.control.parent_pid();
    let mut report = SweepReport::default();
    let mut remove = Vec::new();

    for (pid, entry) in &mut registry {
      let pid = *pid;
      if !self.control.is_alive(pid) {
        report.reaped.push(pid);
        remove.push(pid);
        continue;
      }
      let Some(reason) = self.orphan_reason(entry, state, now) else {
        entry.orphan_observations = 0;
        continue;
      };
      if pid == own || pid == parent {
        report
          .skipped
          .push((pid, "own process or its parent".to_string()));
        continue;
      }
      entry.orphan_observations = entry.orphan_observations.saturating_add(1);
      if entry.orphan_observations < KILL_AFTER_OBSERVATIONS {
        report.flagged.push((pid, reason));
        continue;
      }

      let record = KillRecord {
        timestamp: now,
        pid,
        project: entry.project_id.clone(),
        reason,
      };
      append_jsonl(&self.paths.kills_log(), &record)?;
      match self.control.terminate(pid) {
        Ok(()) => {
          remove.push(pid);
          report.killed.push(record);
        }
        Err(err) => {
          log::warn!("failed to terminate {pid}: {err:#}");
          report.skipped.push((pid, format!("signal failed: {err}")));
        }
      }
    }

    for pid in remove {
      registry.remove(&pid);
    }
    self.store(&registry)?;
    Ok(report)
  }

  pub fn kill_log(&self) -> Result<Vec<KillRecord>> {
    crate::store::json::read_jsonl(&self.paths.kills_log())
  }
}

fn phase_advanced(entry_phase: Phase, state: &ProjectState) -> bool {
  if entry_phase == Phase::Healing {
    return state.phase != Phase::Healing;
  }
  match (entry_phase.rank(), state.working_phase().rank()) {
    (Some(entry_rank), Some(current)) => current > entry_rank,
    _ => false,
  }
}
