//! Path policy: allow/deny pattern matching for filesystem tool arguments.
//! Normalization lives in `meshtalk_core::path` and is re-exported here.
//!
//! Patterns come in three forms:
//! - `*.pem`: suffix wildcard, matches any path ending in `.pem`
//! - `/var/log*`: prefix wildcard, matches any path starting with `/var/log`
//! - `~/.ssh`: directory, matches the path itself and everything under it
//!
//! Deny patterns are always tested first.

use std::path::Path;

pub use meshtalk_core::path::{PathError, normalize};

/// Whether a normalized path matches one pattern.
pub fn matches_pattern(path: &Path, pattern: &str, working_dir: &Path) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }

    if let Some(suffix) = pattern.strip_prefix('*') {
        return !suffix.is_empty() && path.to_string_lossy().ends_with(suffix);
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        return match normalize(prefix, working_dir) {
            Ok(prefix) => path
                .to_string_lossy()
                .starts_with(prefix.to_string_lossy().as_ref()),
            Err(_) => false,
        };
    }

    match normalize(pattern, working_dir) {
        Ok(dir) => path.starts_with(&dir),
        Err(_) => false,
    }
}

/// Result of evaluating a path against the allow and deny lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathVerdict {
    /// A deny pattern matched.
    Denied { pattern: String },
    /// The allow list is non-empty and a pattern matched.
    Allowed,
    /// The allow list is non-empty and nothing matched.
    OutsideAllowList,
    /// No lists apply.
    Unrestricted,
}

/// Allow and deny pattern lists for filesystem tools.
#[derive(Debug, Clone, Default)]
pub struct PathRules {
    pub allowed: Vec<String>,
    pub denied: Vec<String>,
}

impl PathRules {
    pub fn new(allowed: Vec<String>, denied: Vec<String>) -> Self {
        Self { allowed, denied }
    }

    /// Evaluate a normalized path.
    ///
    /// When the path exists its canonical form (symlinks resolved) is also
    /// checked against the deny list, so a link pointing into a denied
    /// directory is caught.
    pub fn evaluate(&self, path: &Path, working_dir: &Path) -> PathVerdict {
        let canonical = path.canonicalize().ok();
        for pattern in &self.denied {
            let hit = matches_pattern(path, pattern, working_dir)
                || canonical
                    .as_deref()
                    .is_some_and(|c| matches_pattern(c, pattern, working_dir));
            if hit {
                return PathVerdict::Denied {
                    pattern: pattern.clone(),
                };
            }
        }

        if self.allowed.is_empty() {
            return PathVerdict::Unrestricted;
        }

        if self
            .allowed
            .iter()
            .any(|pattern| matches_pattern(path, pattern, working_dir))
        {
            PathVerdict::Allowed
        } else {
            PathVerdict::OutsideAllowList
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn wd() -> PathBuf {
        PathBuf::from("/work/project")
    }

    #[test]
    fn suffix_wildcard_matches() {
        let p = PathBuf::from("/work/project/certs/server.pem");
        assert!(matches_pattern(&p, "*.pem", &wd()));
        assert!(!matches_pattern(&p, "*.key", &wd()));
    }

    #[test]
    fn directory_pattern_matches_by_component() {
        let p = PathBuf::from("/etc/shadow");
        assert!(matches_pattern(&p, "/etc/shadow", &wd()));
        assert!(matches_pattern(&p, "/etc", &wd()));
        // "/etc/shadow-backup" is not under "/etc/shadow"
        let q = PathBuf::from("/etc/shadow-backup");
        assert!(!matches_pattern(&q, "/etc/shadow", &wd()));
    }

    #[test]
    fn prefix_wildcard_matches_by_string() {
        let p = PathBuf::from("/etc/shadow-backup");
        assert!(matches_pattern(&p, "/etc/shadow*", &wd()));
    }

    #[test]
    fn deny_takes_precedence_over_allow() {
        let rules = PathRules::new(vec!["/work".into()], vec!["*.pem".into()]);
        let p = PathBuf::from("/work/project/key.pem");
        assert_eq!(
            rules.evaluate(&p, &wd()),
            PathVerdict::Denied {
                pattern: "*.pem".into()
            }
        );
    }

    #[test]
    fn allow_list_verdicts() {
        let rules = PathRules::new(vec!["/work/project".into()], Vec::new());
        assert_eq!(
            rules.evaluate(Path::new("/work/project/a.txt"), &wd()),
            PathVerdict::Allowed
        );
        assert_eq!(
            rules.evaluate(Path::new("/tmp/a.txt"), &wd()),
            PathVerdict::OutsideAllowList
        );

        let open = PathRules::default();
        assert_eq!(
            open.evaluate(Path::new("/tmp/a.txt"), &wd()),
            PathVerdict::Unrestricted
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_into_denied_directory_is_caught() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("secret");
        std::fs::create_dir(&secret).unwrap();
        std::fs::write(secret.join("token"), "x").unwrap();
        let link = dir.path().join("innocent");
        std::os::unix::fs::symlink(&secret, &link).unwrap();

        let secret_canonical = secret.canonicalize().unwrap();
        let rules = PathRules::new(
            Vec::new(),
            vec![secret_canonical.to_string_lossy().into_owned()],
        );
        let through_link = link.join("token");
        assert!(matches!(
            rules.evaluate(&through_link, dir.path()),
            PathVerdict::Denied { .. }
        ));
    }
}
