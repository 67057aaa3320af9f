use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use owo_colors::OwoColorize as _;
use serde::Deserialize;
use toml::Value as TomlValue;

use crate::domain::{Mode, Phase};
use crate::utils::clock::SharedClock;
use crate::utils::command::Command;

/// Directory (relative to the project root) that holds everything we persist.
pub const STATE_DIR_NAME: &str = ".overseer";

/// Known top-level config keys.
const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
  "agent", "agents", "limits", "timeouts", "quality", "state", "models", "phases",
];

const KNOWN_AGENT_KEYS: &[&str] = &["cmd"];
const KNOWN_LIMIT_KEYS: &[&str] = &[
  "max_tokens",
  "max_cost_usd",
  "max_same_error",
  "max_heal_attempts",
  "max_total_heal_attempts",
];
const KNOWN_TIMEOUT_KEYS: &[&str] = &[
  "planning_secs",
  "executing_secs",
  "verifying_secs",
  "healing_secs",
  "grace_secs",
];
const KNOWN_QUALITY_KEYS: &[&str] = &["threshold", "max_reruns"];
const KNOWN_STATE_KEYS: &[&str] = &["backup_retention"];
const KNOWN_MODEL_KEYS: &[&str] = &["tiers"];
const KNOWN_PHASE_KEYS: &[&str] = &["roles"];

const DEFAULT_TOML: &str =
  include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/defaults/overseer.toml"));

/// Embedded config template with all options commented out for documentation.
const CONFIG_TEMPLATE: &str = include_str!(concat!(
  env!("CARGO_MANIFEST_DIR"),
  "/defaults/overseer.template.toml"
));

#[must_use]
pub fn config_template() -> &'static str {
  CONFIG_TEMPLATE
}

/// Resolve the global config file path.
///
/// # Errors
/// Returns an error if the XDG config home cannot be resolved.
pub fn global_config_path() -> Result<PathBuf> {
  let xdg = xdg::BaseDirectories::with_prefix("overseer");
  let config_home = xdg
    .get_config_home()
    .ok_or_else(|| anyhow::anyhow!("unable to resolve XDG config home"))?;
  Ok(config_home.join("overseer.toml"))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
  #[serde(default)]
  pub cmd: Vec<String>,
}

impl AgentConfig {
  /// Returns the agent command argv, failing if undefined or empty.
  pub fn get_cmd(&self, name: &str) -> Result<Command> {
    if self.cmd.is_empty() {
      anyhow::bail!("{name} not defined or empty")
    }
    Command::new(&self.cmd)
  }
}

/// Resource ceilings enforced by the circuit breaker and healing engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Limits {
  pub max_tokens: u64,
  pub max_cost_usd: f64,
  /// Occurrences of one normalized error signature before that fix is abandoned.
  pub max_same_error: u32,
  /// Healing attempts per error signature.
  pub max_heal_attempts: u32,
  /// Healing attempts across all signatures.
  pub max_total_heal_attempts: u32,
}

impl Default for Limits {
  fn default() -> Self {
    Self {
      max_tokens: 2_000_000,
      max_cost_usd: 50.0,
      max_same_error: 3,
      max_heal_attempts: 3,
      max_total_heal_attempts: 10,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
  pub planning_secs: u64,
  pub executing_secs: u64,
  pub verifying_secs: u64,
  pub healing_secs: u64,
  /// How long an empty or half-written result file is tolerated.
  pub grace_secs: u64,
}

impl Default for Timeouts {
  fn default() -> Self {
    Self {
      planning_secs: 1800,
      executing_secs: 3600,
      verifying_secs: 1800,
      healing_secs: 1800,
      grace_secs: 60,
    }
  }
}

impl Timeouts {
  /// Ceiling for agent work in `phase`. Phases that never run agents use the
  /// planning value.
  #[must_use]
  pub fn for_phase(&self, phase: Phase) -> Duration {
    let secs = match phase {
      Phase::Executing => self.executing_secs,
      Phase::Verifying => self.verifying_secs,
      Phase::Healing => self.healing_secs,
      _ => self.planning_secs,
    };
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
  }

  #[must_use]
  pub fn grace(&self) -> Duration {
    Duration::seconds(i64::try_from(self.grace_secs).unwrap_or(i64::MAX / 1000))
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
  pub threshold: f64,
  pub max_reruns: u32,
}

impl Default for QualityConfig {
  fn default() -> Self {
    Self {
      threshold: 0.95,
      max_reruns: 1,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StateConfig {
  pub backup_retention: usize,
}

impl Default for StateConfig {
  fn default() -> Self {
    Self {
      backup_retention: 10,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
  /// Model tiers ordered cheapest first.
  pub tiers: Vec<String>,
}

impl Default for ModelsConfig {
  fn default() -> Self {
    Self {
      tiers: vec!["small".into(), "medium".into(), "large".into()],
    }
  }
}

impl ModelsConfig {
  /// Tier at `idx`, clamped to the most capable one.
  #[must_use]
  pub fn tier(&self, idx: usize) -> String {
    match self.tiers.len() {
      0 => "default".to_string(),
      len => self.tiers[idx.min(len - 1)].clone(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PhaseConfig {
  #[serde(default)]
  pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverseerConfig {
  /// Launcher used for dispatched agents. Unset means agents are started by
  /// whoever drives the pipeline and only their result files are observed.
  #[serde(default)]
  pub agent: Option<String>,
  #[serde(default)]
  pub agents: BTreeMap<String, AgentConfig>,
  #[serde(default)]
  pub limits: Limits,
  #[serde(default)]
  pub timeouts: Timeouts,
  #[serde(default)]
  pub quality: QualityConfig,
  #[serde(default)]
  pub state: StateConfig,
  #[serde(default)]
  pub models: ModelsConfig,
  #[serde(default)]
  pub phases: BTreeMap<String, PhaseConfig>,
}

impl OverseerConfig {
  /// Return the agent config for `name` or a helpful error listing known agents.
  pub fn get_agent(&self, name: &str) -> Result<&AgentConfig> {
    if let Some(cfg) = self.agents.get(name) {
      Ok(cfg)
    } else {
      let known: Vec<String> = self.agents.keys().cloned().collect();
      anyhow::bail!("unknown agent: {name}. Known agents: {}", known.join(", "));
    }
  }

  /// Roles dispatched for `phase`. Falls back to a single generic role.
  #[must_use]
  pub fn roles_for(&self, phase: Phase) -> Vec<String> {
    match self.phases.get(phase.as_str()) {
      Some(cfg) if !cfg.roles.is_empty() => cfg.roles.clone(),
      _ => vec![format!("{phase}-agent")],
    }
  }

  /// Launcher argv for dispatched agents, if any.
  ///
  /// Precedence: `OVERSEER_AGENT_CMD` (split with shell-words) then the
  /// configured `agent`.
  pub fn launcher_argv(&self) -> Result<Option<Vec<String>>> {
    if let Some(argv) = agent_env_argv() {
      return Ok(Some(argv));
    }
    let Some(name) = self.agent.as_deref().filter(|n| !n.trim().is_empty()) else {
      return Ok(None);
    };
    let cmd = self.get_agent(name)?.get_cmd(name)?;
    let mut argv = vec![cmd.program];
    argv.extend(cmd.args);
    Ok(Some(argv))
  }
}

#[must_use]
pub(crate) fn agent_env_argv() -> Option<Vec<String>> {
  let raw = std::env::var("OVERSEER_AGENT_CMD").ok()?;
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    return None;
  }
  let tokens = shell_words::split(trimmed).ok()?;
  if tokens.is_empty() {
    return None;
  }
  Some(tokens)
}

/// Files whose presence marks a directory as a software project.
const CODE_MARKERS: &[&str] = &[
  ".git",
  "Cargo.toml",
  "package.json",
  "pyproject.toml",
  "setup.py",
  "go.mod",
  "pom.xml",
  "build.gradle",
  "Gemfile",
  "composer.json",
  "Makefile",
];

/// `coding` when `root` looks like a software project, `work` otherwise.
#[must_use]
pub fn detect_mode(root: &Path) -> Mode {
  if CODE_MARKERS.iter().any(|m| root.join(m).exists()) {
    Mode::Coding
  } else {
    Mode::Work
  }
}

#[derive(Debug, Clone)]
pub struct OverseerPaths {
  root: PathBuf,
}

impl OverseerPaths {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  #[must_use]
  pub fn root(&self) -> &PathBuf {
    &self.root
  }

  #[must_use]
  pub fn state_dir(&self) -> PathBuf {
    self.root.join(STATE_DIR_NAME)
  }

  #[must_use]
  pub fn state_file(&self) -> PathBuf {
    self.state_dir().join("state.json")
  }

  #[must_use]
  pub fn lock_file(&self) -> PathBuf {
    self.state_dir().join("state.lock")
  }

  /// Held for the whole of a mutating command; taken before `state.lock`.
  #[must_use]
  pub fn command_lock_file(&self) -> PathBuf {
    self.state_dir().join("command.lock")
  }

  #[must_use]
  pub fn backups_dir(&self) -> PathBuf {
    self.state_dir().join("backups")
  }

  #[must_use]
  pub fn registry_file(&self) -> PathBuf {
    self.state_dir().join("processes.json")
  }

  #[must_use]
  pub fn kills_log(&self) -> PathBuf {
    self.state_dir().join("kills.log")
  }

  #[must_use]
  pub fn healing_log(&self) -> PathBuf {
    self.state_dir().join("healing.jsonl")
  }

  #[must_use]
  pub fn events_log(&self) -> PathBuf {
    self.state_dir().join("events.jsonl")
  }

  #[must_use]
  pub fn checkpoints_dir(&self) -> PathBuf {
    self.state_dir().join("checkpoints")
  }

  #[must_use]
  pub fn discarded_dir(&self) -> PathBuf {
    self.state_dir().join("discarded")
  }

  #[must_use]
  pub fn phases_dir(&self) -> PathBuf {
    self.state_dir().join("phases")
  }

  /// Phase outputs of replaced projects, one directory per project id.
  #[must_use]
  pub fn archive_dir(&self) -> PathBuf {
    self.state_dir().join("archive")
  }

  #[must_use]
  pub fn project_config(&self) -> PathBuf {
    self.state_dir().join("overseer.toml")
  }
}

/// Everything a command handler needs. Built once in `run`, never global.
#[derive(Clone)]
pub struct AppContext {
  pub paths: OverseerPaths,
  pub config: OverseerConfig,
  pub clock: SharedClock,
}

fn merge_values(base: &mut TomlValue, overlay: TomlValue) {
  match (base, overlay) {
    (TomlValue::Table(base_tbl), TomlValue::Table(overlay_tbl)) => {
      for (k, v) in overlay_tbl {
        match base_tbl.get_mut(&k) {
          Some(existing) => merge_values(existing, v),
          None => {
            base_tbl.insert(k, v);
          }
        }
      }
    }
    // Arrays and scalars: replace last-wins
    (base_slot, new_v) => *base_slot = new_v,
  }
}

fn warn_section(table: &toml::Table, section: &str, known: &[&str], file_path: &Path) {
  let Some(TomlValue::Table(inner)) = table.get(section) else {
    return;
  };
  for key in inner.keys() {
    if !known.contains(&key.as_str()) {
      eprintln!(
        "{}: unknown config key '{}.{}' in {} (known keys: {})",
        "warning".yellow(),
        section,
        key,
        file_path.display(),
        known.join(", ")
      );
    }
  }
}

fn warn_named_sections(table: &toml::Table, section: &str, known: &[&str], file_path: &Path) {
  let Some(TomlValue::Table(named)) = table.get(section) else {
    return;
  };
  for (name, val) in named {
    let TomlValue::Table(inner) = val else {
      continue;
    };
    for key in inner.keys() {
      if !known.contains(&key.as_str()) {
        eprintln!(
          "{}: unknown config key '{}.{}.{}' in {} (known keys: {})",
          "warning".yellow(),
          section,
          name,
          key,
          file_path.display(),
          known.join(", ")
        );
      }
    }
  }
}

/// Warn about unknown keys in a parsed TOML config file so typos surface.
fn warn_unknown_keys(val: &TomlValue, file_path: &Path) {
  let TomlValue::Table(table) = val else {
    return;
  };

  for key in table.keys() {
    if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
      eprintln!(
        "{}: unknown config key '{}' in {} (did you mean one of: {}?)",
        "warning".yellow(),
        key,
        file_path.display(),
        KNOWN_TOP_LEVEL_KEYS.join(", ")
      );
    }
  }

  warn_section(table, "limits", KNOWN_LIMIT_KEYS, file_path);
  warn_section(table, "timeouts", KNOWN_TIMEOUT_KEYS, file_path);
  warn_section(table, "quality", KNOWN_QUALITY_KEYS, file_path);
  warn_section(table, "state", KNOWN_STATE_KEYS, file_path);
  warn_section(table, "models", KNOWN_MODEL_KEYS, file_path);
  warn_named_sections(table, "agents", KNOWN_AGENT_KEYS, file_path);
  warn_named_sections(table, "phases", KNOWN_PHASE_KEYS, file_path);
}

fn merge_file(merged: &mut TomlValue, path: &Path) -> Result<()> {
  let data =
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
  let val: TomlValue =
    toml::from_str(&data).with_context(|| format!("invalid TOML in {}", path.display()))?;
  warn_unknown_keys(&val, path);
  merge_values(merged, val);
  Ok(())
}

/// Load and merge configuration from defaults, global, and project files.
///
/// # Errors
/// Returns an error if any of the config files cannot be read or parsed
/// as valid TOML, or if the merged document does not match the schema.
pub fn load_config(root: &Path) -> Result<OverseerConfig> {
  let mut merged: TomlValue =
    toml::from_str(DEFAULT_TOML).context("invalid embedded default config")?;

  let xdg = xdg::BaseDirectories::with_prefix("overseer");
  if let Some(global_path) = xdg.find_config_file("overseer.toml") {
    merge_file(&mut merged, &global_path)?;
  }

  let project_cfg = OverseerPaths::new(root).project_config();
  if project_cfg.exists() {
    merge_file(&mut merged, &project_cfg)?;
  }

  let merged_str = toml::to_string(&merged).context("failed to serialize merged config")?;
  let cfg: OverseerConfig =
    toml::from_str(&merged_str).context("failed to parse merged config")?;
  Ok(cfg)
}
