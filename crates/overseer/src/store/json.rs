//! JSON file primitives shared by every component that persists anything:
//! the state document, the process registry, checkpoints and audit logs.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Outcome of reading a JSON document that may be missing or damaged.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonDoc<T> {
  Absent,
  Valid(T),
  Corrupt(String),
}

/// Read and parse `path`, reporting malformed content instead of failing.
///
/// # Errors
/// Only IO errors other than "not found" are returned.
pub fn read_json_doc<T: DeserializeOwned>(path: &Path) -> Result<JsonDoc<T>> {
  let raw = match fs::read_to_string(path) {
    Ok(raw) => raw,
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(JsonDoc::Absent),
    Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
  };
  match serde_json::from_str::<T>(&raw) {
    Ok(value) => Ok(JsonDoc::Valid(value)),
    Err(err) => Ok(JsonDoc::Corrupt(err.to_string())),
  }
}

/// Read `path` as JSON. Missing files yield `None`; malformed files are errors.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
  match read_json_doc(path)? {
    JsonDoc::Absent => Ok(None),
    JsonDoc::Valid(value) => Ok(Some(value)),
    JsonDoc::Corrupt(err) => anyhow::bail!("invalid JSON in {}: {err}", path.display()),
  }
}

/// Write `value` to `path` atomically: temp file in the same directory,
/// fsync, then rename over the target.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
  let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;
  write_atomic(path, &data)
}

pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
  let dir = parent_dir(path);
  fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
  let tmp = temp_path_for(path);
  {
    let mut file =
      File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
    file
      .write_all(data)
      .with_context(|| format!("failed to write {}", tmp.display()))?;
    file
      .sync_all()
      .with_context(|| format!("failed to sync {}", tmp.display()))?;
  }
  if let Err(err) = fs::rename(&tmp, path) {
    let _ = fs::remove_file(&tmp);
    return Err(err).with_context(|| format!("failed to rename into {}", path.display()));
  }
  // Persist the rename itself; not every filesystem allows syncing a directory.
  if let Ok(handle) = File::open(&dir) {
    let _ = handle.sync_all();
  }
  Ok(())
}

/// Append one JSON line and flush it to disk before returning.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
  let dir = parent_dir(path);
  fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
  let mut line = serde_json::to_string(value).context("failed to serialize JSON line")?;
  line.push('\n');
  let mut file = OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)
    .with_context(|| format!("failed to open {}", path.display()))?;
  file
    .write_all(line.as_bytes())
    .with_context(|| format!("failed to append to {}", path.display()))?;
  file
    .sync_data()
    .with_context(|| format!("failed to sync {}", path.display()))?;
  Ok(())
}

/// Read every parseable line of a JSON-lines file. Damaged lines are skipped
/// with a warning so one torn write cannot hide the rest of the history.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
  let raw = match fs::read_to_string(path) {
    Ok(raw) => raw,
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
  };
  let mut out = Vec::new();
  for (idx, line) in raw.lines().enumerate() {
    if line.trim().is_empty() {
      continue;
    }
    match serde_json::from_str::<T>(line) {
      Ok(value) => out.push(value),
      Err(err) => log::warn!("skipping line {} of {}: {err}", idx + 1, path.display()),
    }
  }
  Ok(out)
}

fn parent_dir(path: &Path) -> PathBuf {
  match path.parent() {
    Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
    _ => PathBuf::from("."),
  }
}

fn temp_path_for(path: &Path) -> PathBuf {
  let name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| "doc".to_string());
  parent_dir(path).join(format!(".{name}.tmp-{}", std::process::id()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;
  use std::io::Write as _;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Doc {
    name: String,
    count: u32,
  }

  #[test]
  fn missing_file_is_absent() {
    let dir = tempfile::tempdir().unwrap();
    let doc: JsonDoc<Doc> = read_json_doc(&dir.path().join("nope.json")).unwrap();
    assert_eq!(doc, JsonDoc::Absent);
    let opt: Option<Doc> = read_json(&dir.path().join("nope.json")).unwrap();
    assert!(opt.is_none());
  }

  #[test]
  fn write_is_atomic_and_leaves_no_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("doc.json");
    let doc = Doc {
      name: "a".into(),
      count: 3,
    };
    write_json(&path, &doc).unwrap();
    let back: Option<Doc> = read_json(&path).unwrap();
    assert_eq!(back, Some(doc));
    let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
      .unwrap()
      .flatten()
      .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
      .collect();
    assert!(leftovers.is_empty());
  }

  #[test]
  fn corrupt_content_is_reported_not_raised() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    fs::write(&path, "{\"name\": \"a\", \"cou").unwrap();
    let doc: JsonDoc<Doc> = read_json_doc(&path).unwrap();
    assert!(matches!(doc, JsonDoc::Corrupt(_)));
    assert!(read_json::<Doc>(&path).is_err());
  }

  #[test]
  fn jsonl_skips_torn_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.jsonl");
    append_jsonl(
      &path,
      &Doc {
        name: "one".into(),
        count: 1,
      },
    )
    .unwrap();
    fs::OpenOptions::new()
      .append(true)
      .open(&path)
      .unwrap()
      .write_all(b"{\"name\":\"tor\n")
      .unwrap();
    append_jsonl(
      &path,
      &Doc {
        name: "two".into(),
        count: 2,
      },
    )
    .unwrap();
    let docs: Vec<Doc> = read_jsonl(&path).unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[1].name, "two");
  }
}
