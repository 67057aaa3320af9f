use std::path::{Path, PathBuf};

/// Resolve `program` to an executable path by walking PATH entries.
#[must_use]
pub fn which(program: &str) -> Option<PathBuf> {
  if program.contains(std::path::MAIN_SEPARATOR) {
    let candidate = PathBuf::from(program);
    return is_executable(&candidate).then_some(candidate);
  }

  let paths = std::env::var_os("PATH")?;
  std::env::split_paths(&paths)
    .map(|dir| dir.join(program))
    .find(|candidate| is_executable(candidate))
}

/// Returns true when `path` points to a regular executable file.
#[must_use]
pub fn is_executable(path: &Path) -> bool {
  if !path.is_file() {
    return false;
  }
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::metadata(path)
      .map(|meta| meta.permissions().mode() & 0o111 != 0)
      .unwrap_or(false)
  }
  #[cfg(not(unix))]
  {
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::os::unix::fs::PermissionsExt as _;

  #[test]
  fn finds_executables_on_path_only() {
    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("fake-agent");
    std::fs::write(&exe, "#!/bin/sh\n").unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
    let plain = dir.path().join("notes");
    std::fs::write(&plain, "x").unwrap();

    temp_env::with_var("PATH", Some(dir.path()), || {
      assert_eq!(which("fake-agent"), Some(exe.clone()));
      assert_eq!(which("notes"), None);
      assert_eq!(which("missing"), None);
    });
    assert!(is_executable(&exe));
    assert!(!is_executable(&plain));
  }
}
