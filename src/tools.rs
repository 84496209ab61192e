//! Filesystem Tools
//!
//! The five sandboxed file actions an agent may request: read, list,
//! search, write, edit. Every path passes through `SandboxPolicy` before
//! the filesystem is touched. Results and errors are both JSON payloads;
//! the loop forwards them to the model verbatim.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use regex::RegexBuilder;
use serde_json::{json, Map, Value};
use sysinfo::{MemoryRefreshKind, ProcessRefreshKind, RefreshKind, System};

use crate::error::ToolError;
use crate::sandbox::{Intent, SandboxPolicy};

// ─── Limits ──────────────────────────────────────────────────────

pub const MAX_FILE_SIZE: u64 = 500 * 1024;
pub const MAX_SEARCH_FILE_SIZE: u64 = 50 * 1024;
pub const MAX_SEARCH_RESULTS: usize = 50;
pub const MAX_LIST_ENTRIES: usize = 200;
pub const DEFAULT_READ_LIMIT: usize = 500;
pub const DEFAULT_LIST_DEPTH: usize = 3;
pub const MAX_PROCESS_ENTRIES: usize = 30;

/// Extensions treated as text. Files with no extension also pass for `read`
/// (Makefile, Dockerfile); `search` requires a listed extension.
const TEXT_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "svelte", "rs", "json", "yaml", "yml", "toml", "md",
    "css", "html", "sh", "ps1", "bat", "txt", "cfg", "ini", "env", "lock",
    "sql", "vue", "jsx", "tsx", "go", "java", "c", "cpp", "h", "hpp", "rb",
    "php", "xml", "csv", "dockerfile", "gitignore", "editorconfig",
];

/// Directory names skipped by `list` and `search`.
const IGNORED_DIRS: &[&str] = &[
    "node_modules", ".git", "__pycache__", "target", "dist", ".svelte-kit",
    "build", ".next", "venv", ".venv", "env", ".ollama", ".cache", ".npm",
    ".yarn",
];

fn is_text_extension(path: &Path) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_lowercase();
            TEXT_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

fn is_ignored_dir(name: &str) -> bool {
    IGNORED_DIRS.contains(&name)
}

// ─── Actions ─────────────────────────────────────────────────────

/// The closed set of filesystem actions. Adding an action means adding a
/// variant; every match below then fails to compile until handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileAction {
    Read,
    List,
    Search,
    Write,
    Edit,
}

impl FileAction {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "read_file" => Some(FileAction::Read),
            "list_files" => Some(FileAction::List),
            "search_files" => Some(FileAction::Search),
            "write_file" => Some(FileAction::Write),
            "edit_file" => Some(FileAction::Edit),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileAction::Read => "read_file",
            FileAction::List => "list_files",
            FileAction::Search => "search_files",
            FileAction::Write => "write_file",
            FileAction::Edit => "edit_file",
        }
    }

    /// Whether the action mutates the filesystem.
    pub fn is_write(&self) -> bool {
        matches!(self, FileAction::Write | FileAction::Edit)
    }
}

// ─── Argument helpers ────────────────────────────────────────────

fn require_str<'a>(args: &'a Map<String, Value>, key: &'static str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or(ToolError::MissingArgument(key))
}

fn opt_str<'a>(args: &'a Map<String, Value>, key: &str, default: &'a str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn opt_usize(args: &Map<String, Value>, key: &str, default: usize) -> usize {
    args.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

// ─── Tool set ────────────────────────────────────────────────────

pub struct FileToolSet {
    sandbox: Arc<SandboxPolicy>,
}

impl FileToolSet {
    pub fn new(sandbox: Arc<SandboxPolicy>) -> Self {
        Self { sandbox }
    }

    pub fn sandbox(&self) -> &SandboxPolicy {
        &self.sandbox
    }

    /// Execute `action` with JSON `args`, returning the success payload.
    /// Errors surface as `ToolError`; the caller serializes them for the
    /// model via `to_payload`.
    pub fn dispatch(&self, action: FileAction, args: &Map<String, Value>) -> Result<Value, ToolError> {
        match action {
            FileAction::Read => self.read(
                require_str(args, "path")?,
                opt_usize(args, "offset", 1),
                opt_usize(args, "limit", DEFAULT_READ_LIMIT),
            ),
            FileAction::List => self.list(
                opt_str(args, "path", "."),
                opt_usize(args, "max_depth", DEFAULT_LIST_DEPTH),
            ),
            FileAction::Search => self.search(
                require_str(args, "pattern")?,
                opt_str(args, "path", "."),
                opt_str(args, "glob", ""),
            ),
            FileAction::Write => self.write(
                require_str(args, "path")?,
                require_str(args, "content")?,
            ),
            FileAction::Edit => self.edit(
                require_str(args, "path")?,
                require_str(args, "old_string")?,
                require_str(args, "new_string")?,
            ),
        }
    }

    /// Read a text file, returning a 1-based line window.
    pub fn read(&self, path: &str, offset: usize, limit: usize) -> Result<Value, ToolError> {
        let target = self.sandbox.resolve(path, Intent::Read)?;

        if !target.is_file() {
            return Err(ToolError::NotFound(format!("file not found: {}", path)));
        }
        if !is_text_extension(&target) {
            if let Some(ext) = target.extension() {
                return Err(ToolError::UnsupportedType(format!(".{}", ext.to_string_lossy())));
            }
        }
        let size = target.metadata()?.len();
        if size > MAX_FILE_SIZE {
            return Err(ToolError::TooLarge { size, max: MAX_FILE_SIZE });
        }

        let content = read_lossy(&target)?;
        let lines: Vec<&str> = content.split_inclusive('\n').collect();
        let total = lines.len();

        let start = offset.saturating_sub(1);
        let end = (start + limit).min(total);
        let selected: String = lines
            .get(start..end)
            .unwrap_or(&[])
            .concat();

        Ok(json!({
            "path": self.sandbox.display_path(&target),
            "content": selected,
            "totalLines": total,
            "showing": format!("lines {}-{} of {}", start + 1, end, total),
        }))
    }

    /// Recursive directory listing, directories first, bounded in depth and
    /// total entry count.
    pub fn list(&self, path: &str, max_depth: usize) -> Result<Value, ToolError> {
        let target = self.sandbox.resolve(path, Intent::Read)?;

        if !target.is_dir() {
            return Err(ToolError::NotFound(format!("directory not found: {}", path)));
        }

        let mut files = Vec::new();
        let mut dirs = Vec::new();
        self.walk_list(&target, 0, max_depth, &mut files, &mut dirs);
        let total = files.len() + dirs.len();

        Ok(json!({
            "path": self.sandbox.display_path(&target),
            "files": files,
            "dirs": dirs,
            "total": total,
            "truncated": total >= MAX_LIST_ENTRIES,
        }))
    }

    fn walk_list(
        &self,
        dir: &Path,
        depth: usize,
        max_depth: usize,
        files: &mut Vec<String>,
        dirs: &mut Vec<String>,
    ) {
        if depth > max_depth || files.len() + dirs.len() >= MAX_LIST_ENTRIES {
            return;
        }
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        let mut entries: Vec<_> = entries.flatten().collect();
        entries.sort_by_key(|e| {
            let is_dir = e.path().is_dir();
            (!is_dir, e.file_name().to_string_lossy().to_lowercase())
        });

        for entry in entries {
            if files.len() + dirs.len() >= MAX_LIST_ENTRIES {
                return;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if is_ignored_dir(&name) {
                continue;
            }
            let entry_path = entry.path();
            let rel = self.sandbox.display_path(&entry_path);
            if entry_path.is_dir() {
                dirs.push(format!("{}/", rel));
                self.walk_list(&entry_path, depth + 1, max_depth, files, dirs);
            } else if entry_path.is_file() {
                files.push(rel);
            }
        }
    }

    /// Case-insensitive regex search over text files under `path`.
    pub fn search(&self, pattern: &str, path: &str, glob: &str) -> Result<Value, ToolError> {
        let target = self.sandbox.resolve(path, Intent::Read)?;

        if !target.is_dir() {
            return Err(ToolError::NotFound(format!("directory not found: {}", path)));
        }

        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ToolError::RegexError(e.to_string()))?;

        let mut results = Vec::new();
        self.walk_search(&target, &regex, glob, &mut results);
        let total = results.len();

        Ok(json!({
            "pattern": pattern,
            "results": results,
            "total": total,
            "truncated": total >= MAX_SEARCH_RESULTS,
        }))
    }

    fn walk_search(&self, dir: &Path, regex: &regex::Regex, glob: &str, results: &mut Vec<Value>) {
        if results.len() >= MAX_SEARCH_RESULTS {
            return;
        }
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            if results.len() >= MAX_SEARCH_RESULTS {
                return;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                if !is_ignored_dir(&name) {
                    self.walk_search(&path, regex, glob, results);
                }
                continue;
            }
            if !path.is_file() || !is_text_extension(&path) {
                continue;
            }
            if !glob.is_empty() && !glob_matches(glob, &name) {
                continue;
            }
            let Ok(meta) = path.metadata() else { continue };
            if meta.len() > MAX_SEARCH_FILE_SIZE {
                continue;
            }
            let Ok(content) = read_lossy(&path) else { continue };
            for (i, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    results.push(json!({
                        "file": self.sandbox.display_path(&path),
                        "line": i + 1,
                        "content": truncate_chars(line.trim_end(), 200),
                    }));
                    if results.len() >= MAX_SEARCH_RESULTS {
                        return;
                    }
                }
            }
        }
    }

    /// Write a full file, creating parent directories as needed.
    pub fn write(&self, path: &str, content: &str) -> Result<Value, ToolError> {
        let target = self.sandbox.resolve(path, Intent::Write)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, content)?;

        Ok(json!({
            "path": self.sandbox.display_path(&target),
            "size": content.len(),
            "message": format!("file written: {}", path),
        }))
    }

    /// Replace one exact occurrence of `old_string`. Any other occurrence
    /// count leaves the file untouched.
    pub fn edit(&self, path: &str, old_string: &str, new_string: &str) -> Result<Value, ToolError> {
        let target = self.sandbox.resolve(path, Intent::Write)?;

        if !target.is_file() {
            return Err(ToolError::NotFound(format!("file not found: {}", path)));
        }
        let content = read_lossy(&target)?;

        let count = content.matches(old_string).count();
        if count != 1 {
            return Err(ToolError::AmbiguousEdit(count));
        }

        let updated = content.replacen(old_string, new_string, 1);
        fs::write(&target, updated)?;

        Ok(json!({
            "path": self.sandbox.display_path(&target),
            "replaced": true,
            "message": format!("edit applied in {}", path),
        }))
    }
}

// ─── Helpers ─────────────────────────────────────────────────────

/// Read a file as UTF-8, replacing invalid sequences instead of failing.
fn read_lossy(path: &Path) -> Result<String, ToolError> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Truncate at a char boundary so multi-byte content never panics.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// Minimal filename glob: `*` matches any run of characters, `?` exactly
/// one. Matched against the file name only.
fn glob_matches(pattern: &str, name: &str) -> bool {
    fn inner(p: &[char], n: &[char]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some('?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    inner(&p, &n)
}

// ─── System info ─────────────────────────────────────────────────

/// Snapshot of the host: OS identity, memory, uptime, and the heaviest
/// processes. No arguments; reachable from the agent loop and over IPC.
pub fn system_info() -> Value {
    let mut sys = System::new_with_specifics(
        RefreshKind::new()
            .with_memory(MemoryRefreshKind::everything())
            .with_processes(ProcessRefreshKind::everything()),
    );
    sys.refresh_memory();
    sys.refresh_processes();

    let mut procs: Vec<(String, u32, u64)> = sys
        .processes()
        .values()
        .map(|p| (p.name().to_string(), p.pid().as_u32(), p.memory()))
        .collect();
    let total_processes = procs.len();
    procs.sort_by(|a, b| b.2.cmp(&a.2));

    let processes: Vec<Value> = procs
        .into_iter()
        .take(MAX_PROCESS_ENTRIES)
        .map(|(name, pid, mem)| {
            json!({
                "name": name,
                "pid": pid,
                "memMb": (mem as f64 / 1024.0 / 1024.0 * 10.0).round() / 10.0,
            })
        })
        .collect();

    json!({
        "os": System::name().unwrap_or_else(|| "unknown".to_string()),
        "osVersion": System::os_version().unwrap_or_default(),
        "kernel": System::kernel_version().unwrap_or_default(),
        "hostname": System::host_name().unwrap_or_default(),
        "totalRamGb": (sys.total_memory() as f64 / 1024.0 / 1024.0 / 1024.0 * 10.0).round() / 10.0,
        "usedRamMb": (sys.used_memory() as f64 / 1024.0 / 1024.0).round(),
        "uptimeSecs": System::uptime(),
        "processes": processes,
        "totalProcesses": total_processes,
    })
}
