//! Path normalization shared by the permission engine and the filesystem
//! handlers, so a decision is always about the file a handler touches.

use std::path::{Component, Path, PathBuf};

/// Error returned when a path argument cannot be normalized.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("Empty path")]
    Empty,

    #[error("Path '{path}' contains a NUL byte")]
    NulByte { path: String },
}

/// Normalize a tool-supplied path: expand `~`, resolve against the working
/// directory, and fold `.` and `..` lexically.
///
/// The filesystem is not consulted, so paths that do not exist yet (the
/// target of a write) normalize the same way as existing ones.
pub fn normalize(path: &str, working_dir: &Path) -> Result<PathBuf, PathError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }
    if trimmed.contains('\0') {
        return Err(PathError::NulByte { path: path.into() });
    }

    let expanded = expand_tilde(trimmed);
    let raw = Path::new(&expanded);
    let absolute = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        working_dir.join(raw)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            // `..` at the root stays at the root
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// Expand ~ to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if (path.starts_with("~/") || path == "~")
        && let Some(home) = home_dir()
    {
        return path.replacen('~', &home, 1);
    }
    path.to_string()
}

fn home_dir() -> Option<String> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok()
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wd() -> PathBuf {
        PathBuf::from("/work/project")
    }

    #[test]
    fn relative_paths_resolve_against_working_dir() {
        assert_eq!(
            normalize("src/main.rs", &wd()).unwrap(),
            PathBuf::from("/work/project/src/main.rs")
        );
    }

    #[test]
    fn parent_components_fold_lexically() {
        assert_eq!(
            normalize("../../etc/shadow", &wd()).unwrap(),
            PathBuf::from("/etc/shadow")
        );
        assert_eq!(
            normalize("/a/./b/../c", &wd()).unwrap(),
            PathBuf::from("/a/c")
        );
        // Cannot climb above the root.
        assert_eq!(
            normalize("/../../etc", &wd()).unwrap(),
            PathBuf::from("/etc")
        );
    }

    #[test]
    fn empty_path_rejected() {
        assert!(matches!(normalize("  ", &wd()), Err(PathError::Empty)));
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = home_dir() {
            let p = normalize("~/.ssh/id_rsa", &wd()).unwrap();
            assert!(p.starts_with(&home));
            assert!(p.ends_with(".ssh/id_rsa"));
        }
    }

    #[test]
    fn tilde_in_the_middle_is_literal() {
        assert_eq!(
            normalize("notes/~/a", &wd()).unwrap(),
            PathBuf::from("/work/project/notes/~/a")
        );
    }
}
