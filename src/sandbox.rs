//! Filesystem Sandbox
//!
//! Resolves caller-supplied path strings into canonical absolute paths and
//! authorizes them against the sandbox roots. Writes must land under the
//! project root; reads may also land under the home root. Containment is
//! decided on the fully resolved (post-symlink) path, so a symlink inside
//! an authorized directory that points outside it is rejected.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::ToolError;

/// What the caller intends to do with the resolved path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
}

/// The authorized roots. `home_root` is fixed at construction;
/// `project_root` may be replaced by an explicit open-project operation
/// (swap under a lock, never mutated in place).
pub struct SandboxPolicy {
    project_root: RwLock<Option<PathBuf>>,
    home_root: PathBuf,
}

impl SandboxPolicy {
    /// Create a policy with no project open. `home_root` must exist.
    pub fn new(home_root: impl AsRef<Path>) -> Result<Self, ToolError> {
        Ok(Self {
            project_root: RwLock::new(None),
            home_root: home_root.as_ref().canonicalize()?,
        })
    }

    /// Replace the project root. The new root must be an existing directory.
    pub fn set_project_root(&self, path: &str) -> Result<PathBuf, ToolError> {
        let resolved = Path::new(path)
            .canonicalize()
            .map_err(|_| ToolError::NotFound(format!("directory not found: {}", path)))?;
        if !resolved.is_dir() {
            return Err(ToolError::NotFound(format!("not a directory: {}", path)));
        }
        *self.project_root.write().expect("project_root lock poisoned") = Some(resolved.clone());
        Ok(resolved)
    }

    pub fn project_root(&self) -> Option<PathBuf> {
        self.project_root
            .read()
            .expect("project_root lock poisoned")
            .clone()
    }

    pub fn home_root(&self) -> &Path {
        &self.home_root
    }

    /// Resolve `raw` to a canonical absolute path and authorize it for
    /// `intent`. Relative paths resolve against the project root and fail
    /// immediately when no project is open.
    pub fn resolve(&self, raw: &str, intent: Intent) -> Result<PathBuf, ToolError> {
        let candidate = Path::new(raw);
        let project = self.project_root();

        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            let root = project.clone().ok_or_else(|| {
                ToolError::SandboxViolation(
                    "relative path with no project open; use an absolute path or set a project root first"
                        .to_string(),
                )
            })?;
            root.join(candidate)
        };

        let resolved = canonicalize_lenient(&joined)?;

        let under_project = project.as_deref().is_some_and(|r| resolved.starts_with(r));
        let authorized = match intent {
            Intent::Write => under_project,
            Intent::Read => under_project || resolved.starts_with(&self.home_root),
        };

        if !authorized {
            // Report the caller's spelling, not the resolved internal path.
            return Err(ToolError::SandboxViolation(format!(
                "'{}' resolves outside the allowed {} roots",
                raw,
                match intent {
                    Intent::Write => "write",
                    Intent::Read => "read",
                }
            )));
        }

        Ok(resolved)
    }

    /// Best-effort display form: relative to the project root when possible.
    pub fn display_path(&self, resolved: &Path) -> String {
        if let Some(root) = self.project_root() {
            if let Ok(rel) = resolved.strip_prefix(&root) {
                if !rel.as_os_str().is_empty() {
                    return rel.to_string_lossy().replace('\\', "/");
                }
                return ".".to_string();
            }
        }
        resolved.to_string_lossy().to_string()
    }
}

/// Canonicalize a path whose trailing components may not exist yet (write
/// targets). The longest existing ancestor is canonicalized (resolving
/// symlinks and `..`), then the missing suffix is re-appended. A missing
/// suffix can never be a symlink, but it must not smuggle `..` back in:
/// `file_name()` returns `None` for such components and the path is
/// rejected.
fn canonicalize_lenient(path: &Path) -> Result<PathBuf, ToolError> {
    if let Ok(resolved) = path.canonicalize() {
        return Ok(resolved);
    }

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| ToolError::NotFound(path.display().to_string()))?;
    let name = path.file_name().ok_or_else(|| {
        ToolError::SandboxViolation("path may not traverse '..' through a missing directory".to_string())
    })?;

    let resolved_parent = canonicalize_lenient(parent)?;
    Ok(resolved_parent.join(name))
}
