//! Host-side directory listing and file search over a workspace.
//!
//! Everything here is blocking; [`super::Toolbox`] runs it on the blocking
//! pool.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;
use wildmatch::WildMatch;

use crate::error::{ControlError, Result};

/// Maximum entries returned by a listing or a file name search.
pub const MAX_FILE_MATCHES: usize = 50;

/// Maximum lines returned by a text search.
pub const MAX_GREP_MATCHES: usize = 20;

/// Include globs used by text search when none are given.
pub const DEFAULT_GREP_TYPES: &str = "*.py,*.js,*.json,*.md,*.txt,*.yml,*.yaml";

/// Kind of a listed entry. Ordering puts directories first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Directory,
    File,
    Unknown,
}

/// One item of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of listing a workspace directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryListing {
    pub path: String,
    pub items: Vec<DirectoryEntry>,
    /// Entries in the directory before the listing was capped
    pub total: usize,
}

/// Files whose names matched a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSearch {
    pub pattern: String,
    pub path: String,
    pub matches: Vec<String>,
}

/// One matching line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrepMatch {
    pub file: String,
    /// 1-based line number
    pub line: usize,
    pub content: String,
}

/// Lines that matched a text search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrepSearch {
    pub pattern: String,
    pub path: String,
    pub matches: Vec<GrepMatch>,
}

/// Lists `dir`, directories first, then files, each sorted by name.
pub(crate) fn list_directory(dir: &Path, display: &str) -> Result<DirectoryListing> {
    let read = fs::read_dir(dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory => {
            ControlError::not_found("directory", display)
        }
        _ => ControlError::io(format!("Failed to list {display}: {e}")),
    })?;

    let mut items: Vec<DirectoryEntry> = read
        .filter_map(|entry| match entry {
            Ok(entry) => Some(describe(&entry)),
            Err(e) => {
                // Rebind: `tracing` macros import `field::display`, shadowing the parameter.
                let shown_path: &str = display;
                warn!(path = shown_path, error = %e, "Dropped unreadable directory entry");
                None
            }
        })
        .collect();
    items.sort_by(|a, b| (a.entry_type, &a.name).cmp(&(b.entry_type, &b.name)));

    let total = items.len();
    items.truncate(MAX_FILE_MATCHES);
    Ok(DirectoryListing {
        path: display.to_string(),
        items,
        total,
    })
}

/// Symlinks are reported as what they point at.
fn describe(entry: &fs::DirEntry) -> DirectoryEntry {
    let name = entry.file_name().to_string_lossy().into_owned();
    match fs::metadata(entry.path()) {
        Ok(meta) => {
            let entry_type = if meta.is_dir() {
                EntryType::Directory
            } else {
                EntryType::File
            };
            DirectoryEntry {
                name,
                entry_type,
                size: (entry_type == EntryType::File).then(|| meta.len()),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                error: None,
            }
        }
        Err(e) => {
            debug!(name = %name, error = %e, "Cannot inspect directory entry");
            let dangling = e.kind() == std::io::ErrorKind::NotFound
                && entry.file_type().is_ok_and(|t| t.is_symlink());
            let error = if dangling { "broken link" } else { "access denied" };
            DirectoryEntry {
                name,
                entry_type: EntryType::Unknown,
                size: None,
                modified: None,
                error: Some(error.to_string()),
            }
        }
    }
}

/// Finds files under `dir` whose name matches the wildcard `pattern`.
///
/// `file_types` is `*` or a comma-separated list like `*.py,*.rs`; only the
/// extensions are compared. Matches are relative to `root`.
pub(crate) fn search_files(
    root: &Path,
    dir: &Path,
    pattern: &str,
    file_types: &str,
) -> Result<FileSearch> {
    ensure_dir(dir, root)?;
    let name_matcher = WildMatch::new(pattern);
    let extensions = extension_filter(file_types);

    let matches = walk_files(dir)
        .filter(|path| {
            let name = file_name(path);
            name_matcher.matches(&name)
                && extensions.as_ref().is_none_or(|exts| {
                    path.extension()
                        .is_some_and(|ext| exts.iter().any(|e| *e == ext.to_string_lossy()))
                })
        })
        .take(MAX_FILE_MATCHES)
        .map(|path| relative(root, &path))
        .collect();

    Ok(FileSearch {
        pattern: pattern.to_string(),
        path: relative_or_dot(root, dir),
        matches,
    })
}

/// Finds lines matching the regular expression `pattern` in files under
/// `dir` whose name matches one of the `file_types` globs.
///
/// A pattern that is not a valid regex is searched for literally. Files that
/// are not UTF-8 text are skipped.
pub(crate) fn grep_search(
    root: &Path,
    dir: &Path,
    pattern: &str,
    file_types: &str,
) -> Result<GrepSearch> {
    ensure_dir(dir, root)?;
    let regex = Regex::new(pattern).or_else(|_| Regex::new(&regex::escape(pattern)))
        .map_err(|e| ControlError::io(format!("Invalid search pattern: {e}")))?;
    let includes: Vec<WildMatch> = file_types
        .split(',')
        .map(str::trim)
        .filter(|glob| !glob.is_empty())
        .map(WildMatch::new)
        .collect();

    let mut matches = Vec::new();
    'files: for path in walk_files(dir) {
        let name = file_name(&path);
        if !includes.is_empty() && !includes.iter().any(|glob| glob.matches(&name)) {
            continue;
        }
        let Ok(text) = fs::read_to_string(&path) else {
            continue;
        };
        let file = relative(root, &path);
        for (index, line) in text.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(GrepMatch {
                    file: file.clone(),
                    line: index + 1,
                    content: line.trim().to_string(),
                });
                if matches.len() >= MAX_GREP_MATCHES {
                    break 'files;
                }
            }
        }
    }

    Ok(GrepSearch {
        pattern: pattern.to_string(),
        path: relative_or_dot(root, dir),
        matches,
    })
}

fn ensure_dir(dir: &Path, root: &Path) -> Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(ControlError::not_found("directory", relative_or_dot(root, dir)))
    }
}

/// Regular files under `dir`. Symlinks are not followed so a search never
/// leaves the workspace.
fn walk_files(dir: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipped unreadable path during search");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
}

/// Extensions from `*.py,*.rs`, or `None` when every type is allowed.
fn extension_filter(file_types: &str) -> Option<Vec<String>> {
    let exts: Vec<String> = file_types
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty() && *t != "*")
        .map(|t| t.trim_start_matches("*.").trim_start_matches('.').to_string())
        .collect();
    (!exts.is_empty()).then_some(exts)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn relative_or_dot(root: &Path, path: &Path) -> String {
    let rel = relative(root, path);
    if rel.is_empty() {
        ".".to_string()
    } else {
        rel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_list_directory_sorts_dirs_first() {
        let dir = tempdir().unwrap();
        write(dir.path(), "b.txt", "hello");
        write(dir.path(), "a.py", "");
        fs::create_dir(dir.path().join("zsrc")).unwrap();

        let listing = list_directory(dir.path(), ".").unwrap();
        let names: Vec<_> = listing.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["zsrc", "a.py", "b.txt"]);
        assert_eq!(listing.items[0].entry_type, EntryType::Directory);
        assert_eq!(listing.items[0].size, None);
        assert_eq!(listing.items[2].size, Some(5));
        assert!(listing.items[2].modified.is_some());
        assert_eq!(listing.total, 3);
    }

    #[test]
    fn test_list_directory_wire_format() {
        let dir = tempdir().unwrap();
        write(dir.path(), "app.py", "x");
        let listing = list_directory(dir.path(), ".").unwrap();
        let value = serde_json::to_value(&listing).unwrap();
        assert_eq!(value["items"][0]["type"], "file");
        assert_eq!(value["items"][0]["size"], 1);
        assert!(value["items"][0].get("error").is_none());
    }

    #[test]
    fn test_list_directory_follows_symlinks() {
        use std::os::unix::fs::symlink;

        let dir = tempdir().unwrap();
        write(dir.path(), "real/app.py", "print(1)");
        symlink(dir.path().join("real"), dir.path().join("dir_link")).unwrap();
        symlink(dir.path().join("real/app.py"), dir.path().join("file_link")).unwrap();
        symlink(dir.path().join("missing"), dir.path().join("broken")).unwrap();

        let listing = list_directory(dir.path(), ".").unwrap();
        let kinds: Vec<_> = listing
            .items
            .iter()
            .map(|i| (i.name.as_str(), i.entry_type, i.error.as_deref()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("dir_link", EntryType::Directory, None),
                ("real", EntryType::Directory, None),
                ("file_link", EntryType::File, None),
                ("broken", EntryType::Unknown, Some("broken link")),
            ]
        );
        assert_eq!(listing.items[2].size, Some(8));
    }

    #[test]
    fn test_list_missing_directory() {
        let dir = tempdir().unwrap();
        let err = list_directory(&dir.path().join("nope"), "nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_list_directory_caps_entries() {
        let dir = tempdir().unwrap();
        for i in 0..60 {
            write(dir.path(), &format!("f{i:02}.txt"), "");
        }
        let listing = list_directory(dir.path(), ".").unwrap();
        assert_eq!(listing.items.len(), MAX_FILE_MATCHES);
        assert_eq!(listing.total, 60);
    }

    #[test]
    fn test_search_files_by_name_and_type() {
        let dir = tempdir().unwrap();
        write(dir.path(), "server.py", "");
        write(dir.path(), "src/server.js", "");
        write(dir.path(), "src/client.py", "");

        let found = search_files(dir.path(), dir.path(), "server*", "*").unwrap();
        assert_eq!(found.matches, vec!["server.py", "src/server.js"]);
        assert_eq!(found.path, ".");

        let found = search_files(dir.path(), dir.path(), "*", "*.py").unwrap();
        assert_eq!(found.matches, vec!["server.py", "src/client.py"]);

        let found = search_files(dir.path(), &dir.path().join("src"), "*", "*.js, *.py").unwrap();
        assert_eq!(found.matches, vec!["src/client.py", "src/server.js"]);
        assert_eq!(found.path, "src");
    }

    #[test]
    fn test_search_files_caps_at_fifty() {
        let dir = tempdir().unwrap();
        for i in 0..60 {
            write(dir.path(), &format!("m{i:02}.txt"), "");
        }
        let found = search_files(dir.path(), dir.path(), "*.txt", "*").unwrap();
        assert_eq!(found.matches.len(), MAX_FILE_MATCHES);
    }

    #[test]
    fn test_grep_search_default_types() {
        let dir = tempdir().unwrap();
        write(dir.path(), "app.py", "import os\n    PORT = 8000\n");
        write(dir.path(), "notes.md", "port notes\n");
        write(dir.path(), "binary.bin", "PORT = 1\n");

        let found = grep_search(dir.path(), dir.path(), "PORT", DEFAULT_GREP_TYPES).unwrap();
        assert_eq!(
            found.matches,
            vec![GrepMatch {
                file: "app.py".to_string(),
                line: 2,
                content: "PORT = 8000".to_string(),
            }]
        );

        let found = grep_search(dir.path(), dir.path(), "(?i)port", "*.md").unwrap();
        assert_eq!(found.matches.len(), 1);
        assert_eq!(found.matches[0].file, "notes.md");
    }

    #[test]
    fn test_grep_invalid_regex_searches_literally() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.txt", "call foo(bar\n");
        let found = grep_search(dir.path(), dir.path(), "foo(", "*.txt").unwrap();
        assert_eq!(found.matches.len(), 1);
    }

    #[test]
    fn test_grep_caps_at_twenty() {
        let dir = tempdir().unwrap();
        let body = "needle\n".repeat(30);
        write(dir.path(), "a.txt", &body);
        write(dir.path(), "b.txt", &body);
        let found = grep_search(dir.path(), dir.path(), "needle", "*.txt").unwrap();
        assert_eq!(found.matches.len(), MAX_GREP_MATCHES);
        assert!(found.matches.iter().all(|m| m.file == "a.txt"));
    }

    #[test]
    fn test_extension_filter() {
        assert_eq!(extension_filter("*"), None);
        assert_eq!(extension_filter(""), None);
        assert_eq!(
            extension_filter("*.py, *.js"),
            Some(vec!["py".to_string(), "js".to_string()])
        );
    }
}
