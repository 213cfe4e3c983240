//! On-disk representation of logical files and their sidecars (spec.md
//! §3, §4.5).
//!
//! Every write that reaches disk goes through [`atomic_write`]: write to
//! a `mkstemp`-created temp file beside the destination, `fchmod` it,
//! write the bytes, then `rename` it into place. This is lifted nearly
//! unchanged from the teacher's `tools.rs::file_set_contents` (same
//! mkstemp-then-rename shape, generalized from a single fixed
//! permission to this crate's default). Crash-safety for the primary
//! file therefore comes from the rename being atomic at the filesystem
//! level, not from any in-process bookkeeping.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::stat::{fchmod, Mode};
use nix::unistd::{mkstemp, unlink};
use walkdir::WalkDir;

use crate::error::{SsError, SsResult};

pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn validate_filename(filename: &str) -> SsResult<()> {
    if filename.is_empty() {
        return Err(SsError::InvalidPath("empty filename".into()));
    }
    if Path::new(filename).is_absolute() {
        return Err(SsError::InvalidPath(format!("absolute path not allowed: {}", filename)));
    }
    if filename.split('/').any(|seg| seg == "..") {
        return Err(SsError::InvalidPath(format!("path escapes storage root: {}", filename)));
    }
    Ok(())
}

/// Atomically writes `data` to `path`: `mkstemp` a sibling temp file,
/// `fchmod` it, write, then `rename` over the destination.
pub fn atomic_write(path: &Path, data: &[u8]) -> SsResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut template = path.as_os_str().to_os_string();
    template.push(".tmp_XXXXXX");
    let template_path = PathBuf::from(template);

    let (fd, tmp_path) = mkstemp(&template_path)
        .map_err(|e| SsError::FileOperationFailed(format!("mkstemp {:?} failed: {}", template_path, e)))?;

    let mode = Mode::from_bits_truncate(0o640);
    if let Err(e) = fchmod(fd, mode) {
        let _ = unlink(&tmp_path);
        return Err(SsError::FileOperationFailed(format!("fchmod {:?} failed: {}", tmp_path, e)));
    }

    let mut file = unsafe { fs::File::from_raw_fd(fd) };
    if let Err(e) = file.write_all(data) {
        let _ = unlink(&tmp_path);
        return Err(SsError::Io(e));
    }
    drop(file);

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = unlink(&tmp_path);
        return Err(SsError::FileOperationFailed(format!(
            "atomic rename {:?} -> {:?} failed: {}",
            tmp_path, path, e
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FileMeta {
    pub owner: String,
    pub created: i64,
    pub modified: i64,
}

impl FileMeta {
    fn to_bytes(&self) -> Vec<u8> {
        format!(
            "owner:{}\ncreated:{}\nmodified:{}\n",
            self.owner, self.created, self.modified
        )
        .into_bytes()
    }

    fn from_bytes(data: &[u8]) -> SsResult<FileMeta> {
        let text = String::from_utf8_lossy(data);
        let mut owner = String::new();
        let mut created = 0i64;
        let mut modified = 0i64;
        for line in text.lines() {
            if let Some(v) = line.strip_prefix("owner:") {
                owner = v.to_string();
            } else if let Some(v) = line.strip_prefix("created:") {
                created = v.trim().parse().unwrap_or(0);
            } else if let Some(v) = line.strip_prefix("modified:") {
                modified = v.trim().parse().unwrap_or(0);
            }
        }
        Ok(FileMeta { owner, created, modified })
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileStats {
    pub total_edits: u64,
    pub per_user: HashMap<String, u64>,
}

impl FileStats {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("total_edits:{}\n", self.total_edits);
        let mut users: Vec<&String> = self.per_user.keys().collect();
        users.sort();
        for user in users {
            out.push_str(&format!("user:{}:{}\n", user, self.per_user[user]));
        }
        out.into_bytes()
    }

    fn from_bytes(data: &[u8]) -> FileStats {
        let text = String::from_utf8_lossy(data);
        let mut stats = FileStats::default();
        for line in text.lines() {
            if let Some(v) = line.strip_prefix("total_edits:") {
                stats.total_edits = v.trim().parse().unwrap_or(0);
            } else if let Some(rest) = line.strip_prefix("user:") {
                if let Some((name, count)) = rest.rsplit_once(':') {
                    stats.per_user.insert(name.to_string(), count.trim().parse().unwrap_or(0));
                }
            }
        }
        stats
    }

    fn increment(&mut self, user: &str) {
        self.total_edits += 1;
        *self.per_user.entry(user.to_string()).or_insert(0) += 1;
    }
}

/// Per-server storage root, e.g. `data/ss_<id>/`. Logical filenames may
/// contain `/`; parent directories are created automatically.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, filename: &str) -> SsResult<PathBuf> {
        validate_filename(filename)?;
        Ok(self.root.join(filename))
    }

    fn meta_path(&self, filename: &str) -> SsResult<PathBuf> {
        Ok(self.path(filename)?.with_extra_extension("meta"))
    }

    fn undo_path(&self, filename: &str) -> SsResult<PathBuf> {
        Ok(self.path(filename)?.with_extra_extension("undo"))
    }

    fn stats_path(&self, filename: &str) -> SsResult<PathBuf> {
        Ok(self.path(filename)?.with_extra_extension("stats"))
    }

    fn checkpoint_path(&self, filename: &str, tag: &str) -> SsResult<PathBuf> {
        Ok(self.path(filename)?.with_extra_extension(&format!("checkpoint.{}", tag)))
    }

    fn checkpoint_meta_path(&self, filename: &str, tag: &str) -> SsResult<PathBuf> {
        Ok(self.path(filename)?.with_extra_extension(&format!("checkpoint.{}.meta", tag)))
    }

    pub fn exists(&self, filename: &str) -> SsResult<bool> {
        Ok(self.path(filename)?.exists())
    }

    /// Counts primary files under the storage root, excluding `.meta`,
    /// `.undo`, `.stats`, and `.checkpoint.*` sidecars. Used to enforce
    /// spec.md §5's MAX_FILES-per-server resource bound at `CREATE`.
    pub fn count_files(&self) -> SsResult<usize> {
        const SIDECAR_MARKERS: [&str; 3] = [".meta", ".undo", ".stats"];
        let mut count = 0usize;
        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.contains(".checkpoint.") || SIDECAR_MARKERS.iter().any(|m| name.ends_with(m)) {
                continue;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Creates an empty file with an initial `.meta`. Fails with
    /// [`SsError::FileExists`] if the file is already present.
    pub fn create_file(&self, filename: &str, owner: &str) -> SsResult<()> {
        let path = self.path(filename)?;
        if path.exists() {
            return Err(SsError::FileExists(filename.to_string()));
        }
        atomic_write(&path, b"")?;
        let now = now_epoch();
        self.write_meta(
            filename,
            &FileMeta {
                owner: owner.to_string(),
                created: now,
                modified: now,
            },
        )?;
        Ok(())
    }

    pub fn delete_file(&self, filename: &str) -> SsResult<()> {
        let path = self.path(filename)?;
        if !path.exists() {
            return Err(SsError::FileNotFound(filename.to_string()));
        }
        fs::remove_file(&path)?;
        for sidecar in [
            self.meta_path(filename)?,
            self.undo_path(filename)?,
            self.stats_path(filename)?,
        ] {
            let _ = fs::remove_file(sidecar);
        }
        Ok(())
    }

    pub fn move_file(&self, filename: &str, new_filename: &str) -> SsResult<()> {
        let src = self.path(filename)?;
        let dst = self.path(new_filename)?;
        if !src.exists() {
            return Err(SsError::FileNotFound(filename.to_string()));
        }
        if dst.exists() {
            return Err(SsError::FileExists(new_filename.to_string()));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dst)?;
        for (old, new) in [
            (self.meta_path(filename)?, self.meta_path(new_filename)?),
            (self.undo_path(filename)?, self.undo_path(new_filename)?),
            (self.stats_path(filename)?, self.stats_path(new_filename)?),
        ] {
            if old.exists() {
                let _ = fs::rename(old, new);
            }
        }
        Ok(())
    }

    pub fn read_file(&self, filename: &str) -> SsResult<Vec<u8>> {
        let path = self.path(filename)?;
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SsError::FileNotFound(filename.to_string())
            } else {
                SsError::Io(e)
            }
        })
    }

    /// Atomically overwrites `filename` and bumps `.meta`'s `modified`
    /// timestamp, preserving `owner` and `created`.
    pub fn write_file_atomic(&self, filename: &str, content: &[u8]) -> SsResult<()> {
        let path = self.path(filename)?;
        atomic_write(&path, content)?;
        let mut meta = self.read_meta(filename).unwrap_or(FileMeta {
            owner: String::new(),
            created: now_epoch(),
            modified: now_epoch(),
        });
        meta.modified = now_epoch();
        self.write_meta(filename, &meta)?;
        Ok(())
    }

    pub fn read_meta(&self, filename: &str) -> SsResult<FileMeta> {
        let data = fs::read(self.meta_path(filename)?)?;
        FileMeta::from_bytes(&data)
    }

    pub fn write_meta(&self, filename: &str, meta: &FileMeta) -> SsResult<()> {
        atomic_write(&self.meta_path(filename)?, &meta.to_bytes())
    }

    /// Increments `total_edits` and the per-user counter on successful
    /// commit (spec.md §4.4 `UNLOCK` step 8).
    pub fn increment_stats(&self, filename: &str, user: &str) -> SsResult<()> {
        let path = self.stats_path(filename)?;
        let mut stats = match fs::read(&path) {
            Ok(data) => FileStats::from_bytes(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileStats::default(),
            Err(e) => return Err(SsError::Io(e)),
        };
        stats.increment(user);
        atomic_write(&path, &stats.to_bytes())
    }

    pub fn read_stats(&self, filename: &str) -> SsResult<FileStats> {
        let path = self.stats_path(filename)?;
        match fs::read(&path) {
            Ok(data) => Ok(FileStats::from_bytes(&data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileStats::default()),
            Err(e) => Err(SsError::Io(e)),
        }
    }

    /// Writes `.undo` with the current on-disk content. At most one
    /// snapshot is ever kept (single-level undo).
    pub fn save_undo(&self, filename: &str) -> SsResult<()> {
        let content = self.read_file(filename)?;
        atomic_write(&self.undo_path(filename)?, &content)
    }

    pub fn has_undo(&self, filename: &str) -> SsResult<bool> {
        Ok(self.undo_path(filename)?.exists())
    }

    /// Overwrites the primary file with `.undo`'s content. `.undo` is
    /// not itself undoable.
    pub fn undo(&self, filename: &str) -> SsResult<()> {
        let undo_path = self.undo_path(filename)?;
        if !undo_path.exists() {
            return Err(SsError::UndoNotAvailable);
        }
        let content = fs::read(&undo_path)?;
        self.write_file_atomic(filename, &content)
    }

    /// Copies the current content to `filename.checkpoint.<tag>` plus a
    /// sidecar meta with the creation timestamp.
    pub fn checkpoint(&self, filename: &str, tag: &str) -> SsResult<()> {
        let checkpoint_path = self.checkpoint_path(filename, tag)?;
        if checkpoint_path.exists() {
            return Err(SsError::CheckpointExists(tag.to_string()));
        }
        let content = self.read_file(filename)?;
        atomic_write(&checkpoint_path, &content)?;
        let meta = format!("created:{}\n", now_epoch());
        atomic_write(&self.checkpoint_meta_path(filename, tag)?, meta.as_bytes())
    }

    pub fn view_checkpoint(&self, filename: &str, tag: &str) -> SsResult<Vec<u8>> {
        let path = self.checkpoint_path(filename, tag)?;
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SsError::CheckpointNotFound(tag.to_string())
            } else {
                SsError::Io(e)
            }
        })
    }

    /// Saves current content to `.undo`, then atomically replaces the
    /// primary file with the checkpoint's content.
    pub fn revert(&self, filename: &str, tag: &str) -> SsResult<()> {
        let content = self.view_checkpoint(filename, tag)?;
        self.save_undo(filename)?;
        self.write_file_atomic(filename, &content)
    }

    /// Lists `(tag, created_ts)` pairs for every
    /// `filename.checkpoint.<tag>` sibling (excluding the `.meta` files).
    pub fn list_checkpoints(&self, filename: &str) -> SsResult<Vec<(String, i64)>> {
        let path = self.path(filename)?;
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let base_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => return Err(SsError::InvalidPath(filename.to_string())),
        };
        let prefix = format!("{}.checkpoint.", base_name);

        let mut out = Vec::new();
        if !parent.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(parent)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if !name.starts_with(&prefix) || name.ends_with(".meta") {
                continue;
            }
            let tag = &name[prefix.len()..];
            let created = fs::read(parent.join(format!("{}{}.meta", prefix, tag)))
                .ok()
                .and_then(|data| {
                    String::from_utf8_lossy(&data)
                        .lines()
                        .find_map(|line| line.strip_prefix("created:").map(|v| v.trim().to_string()))
                })
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            out.push((tag.to_string(), created));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

/// Helper trait for appending a sidecar suffix to a primary filename's
/// `PathBuf` (`F` -> `F.meta`, not `F` with its extension replaced).
trait ExtraExtension {
    fn with_extra_extension(&self, suffix: &str) -> PathBuf;
}

impl ExtraExtension for PathBuf {
    fn with_extra_extension(&self, suffix: &str) -> PathBuf {
        let mut s = self.as_os_str().to_os_string();
        s.push(".");
        s.push(suffix);
        PathBuf::from(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.create_file("a.txt", "alice").unwrap();
        assert_eq!(store.read_file("a.txt").unwrap(), b"");
        let meta = store.read_meta("a.txt").unwrap();
        assert_eq!(meta.owner, "alice");
        assert_eq!(meta.created, meta.modified);
    }

    #[test]
    fn create_existing_file_fails() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.create_file("a.txt", "alice").unwrap();
        assert!(matches!(
            store.create_file("a.txt", "bob"),
            Err(SsError::FileExists(_))
        ));
    }

    #[test]
    fn count_files_excludes_sidecars_and_checkpoints() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.create_file("a.txt", "alice").unwrap();
        store.create_file("notes/b.txt", "alice").unwrap();
        store.checkpoint("a.txt", "v1").unwrap();
        assert_eq!(store.count_files().unwrap(), 2);
    }

    #[test]
    fn nested_path_auto_creates_parents() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.create_file("notes/today.txt", "alice").unwrap();
        assert!(dir.path().join("notes/today.txt").exists());
    }

    #[test]
    fn path_traversal_rejected() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(matches!(
            store.path("../escape.txt"),
            Err(SsError::InvalidPath(_))
        ));
    }

    #[test]
    fn undo_single_level() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.create_file("a.txt", "alice").unwrap();
        store.write_file_atomic("a.txt", b"version 1").unwrap();
        store.save_undo("a.txt").unwrap();
        store.write_file_atomic("a.txt", b"version 2").unwrap();
        assert_eq!(store.read_file("a.txt").unwrap(), b"version 2");
        store.undo("a.txt").unwrap();
        assert_eq!(store.read_file("a.txt").unwrap(), b"version 1");
    }

    #[test]
    fn undo_not_available_when_missing() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.create_file("a.txt", "alice").unwrap();
        assert!(matches!(store.undo("a.txt"), Err(SsError::UndoNotAvailable)));
    }

    #[test]
    fn checkpoint_view_and_revert() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.create_file("a.txt", "alice").unwrap();
        store.write_file_atomic("a.txt", b"before").unwrap();
        store.checkpoint("a.txt", "v1").unwrap();
        assert!(matches!(
            store.checkpoint("a.txt", "v1"),
            Err(SsError::CheckpointExists(_))
        ));
        store.write_file_atomic("a.txt", b"after").unwrap();
        assert_eq!(store.view_checkpoint("a.txt", "v1").unwrap(), b"before");
        store.revert("a.txt", "v1").unwrap();
        assert_eq!(store.read_file("a.txt").unwrap(), b"before");
        // revert saved the pre-revert content to .undo
        store.undo("a.txt").unwrap();
        assert_eq!(store.read_file("a.txt").unwrap(), b"after");
    }

    #[test]
    fn list_checkpoints_excludes_meta_siblings() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.create_file("a.txt", "alice").unwrap();
        store.checkpoint("a.txt", "v1").unwrap();
        store.checkpoint("a.txt", "v2").unwrap();
        let list = store.list_checkpoints("a.txt").unwrap();
        let tags: Vec<&str> = list.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(tags, vec!["v1", "v2"]);
    }

    #[test]
    fn stats_increment_per_user() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.create_file("a.txt", "alice").unwrap();
        store.increment_stats("a.txt", "alice").unwrap();
        store.increment_stats("a.txt", "alice").unwrap();
        store.increment_stats("a.txt", "bob").unwrap();
        let stats = store.read_stats("a.txt").unwrap();
        assert_eq!(stats.total_edits, 3);
        assert_eq!(stats.per_user["alice"], 2);
        assert_eq!(stats.per_user["bob"], 1);
    }
}
