//! Local file tree store
//!
//! Layout: `<root>/<namespace>/<fqn>.json`, one pretty-printed record per file.
//! Slashes in the FQN become directories.

use crate::codec::RecordCodec;
use crate::error::{Error, Result};
use crate::record::StateRecord;
use crate::store::{StateStore, check_key};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use walkdir::WalkDir;

const EXTENSION: &str = "json";
const TMP_SUFFIX: &str = ".tmp";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    namespace: String,
    codec: RecordCodec,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>, namespace: impl Into<String>, codec: RecordCodec) -> Self {
        Self {
            root: root.into(),
            namespace: namespace.into(),
            codec,
        }
    }

    /// Directory holding this namespace's records
    pub fn dir(&self) -> PathBuf {
        if self.namespace.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&self.namespace)
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        let path = self.dir().join(format!("{key}.{EXTENSION}"));
        if !path.starts_with(&self.root) {
            return Err(Error::OutsideRoot(path));
        }
        Ok(path)
    }

    /// Write via a sibling temp file and rename, so readers never see a partial record
    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::OutsideRoot(path.to_path_buf()))?;
        fs::create_dir_all(parent)?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("record");
        let tmp = parent.join(format!(
            ".{file_name}.{}.{}{TMP_SUFFIX}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        fs::write(&tmp, bytes)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove empty directories between `path` and the namespace directory
    fn prune_empty_parents(&self, path: &Path) {
        let stop = self.dir();
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == stop || !dir.starts_with(&stop) {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            log::trace!("Pruned empty state directory {}", dir.display());
            current = dir.parent();
        }
    }

    fn key_of(dir: &Path, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(dir).ok()?;
        let mut segments = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        let last = segments.pop()?;
        let stem = last.strip_suffix(&format!(".{EXTENSION}"))?;
        segments.push(stem);
        Some(segments.join("/"))
    }
}

impl StateStore for FsStore {
    fn init(&self) -> Result<()> {
        let dir = self.dir();
        fs::create_dir_all(&dir)?;
        log::debug!("Using state directory {}", dir.display());
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StateRecord>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => {
                log::trace!("Read state record {}", path.display());
                self.codec.decode(key, &bytes).map(Some)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, record: &StateRecord) -> Result<()> {
        let path = self.path_for(key)?;
        let bytes = self.codec.encode(record)?;
        Self::write_atomic(&path, &bytes)?;
        log::debug!("Saved state record {}", path.display());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("Deleted state record {}", path.display());
                self.prune_empty_parents(&path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let dir = self.dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            // In-flight writes from `write_atomic`; record files always end in `.json`
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            match Self::key_of(&dir, entry.path()) {
                Some(key) => keys.push(key),
                None => log::debug!("Ignoring stray file {}", entry.path().display()),
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn backend(&self) -> &'static str {
        "fs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ResourceStatus;
    use crate::secret::{Passphrase, SecretCodec};
    use crate::value::Value;
    use tempfile::TempDir;

    fn store(tmp: &TempDir, namespace: &str) -> FsStore {
        let codec = RecordCodec::new(SecretCodec::new(Passphrase::new("pw")).unwrap());
        let store = FsStore::new(tmp.path(), namespace, codec);
        store.init().unwrap();
        store
    }

    fn record(fqn: &str) -> StateRecord {
        let id = fqn.rsplit('/').next().unwrap_or(fqn);
        let mut record = StateRecord::new(fqn, "bucket", id);
        record.seq = 1;
        record.status = ResourceStatus::Created;
        record.props = Value::map([("name", Value::from(id)), ("token", Value::secret("t0k"))]);
        record
    }

    #[test]
    fn test_set_get_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, "");
        let r = record("app/dev/api/bucket");

        store.set(&r.fqn, &r).unwrap();
        assert_eq!(store.get(&r.fqn).unwrap(), Some(r));

        let on_disk = fs::read_to_string(tmp.path().join("app/dev/api/bucket.json")).unwrap();
        assert!(on_disk.contains("\"bucket\""));
        assert!(!on_disk.contains("t0k"));
    }

    #[test]
    fn test_list_is_sorted_and_skips_temp_files() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, "ns");
        for fqn in ["app/dev/b", "app/dev/a", "app/dev/scope/c"] {
            store.set(fqn, &record(fqn)).unwrap();
        }
        fs::write(tmp.path().join("ns/app/dev/.a.json.1.0.tmp"), b"partial").unwrap();

        assert_eq!(
            store.list().unwrap(),
            vec!["app/dev/a", "app/dev/b", "app/dev/scope/c"]
        );
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn test_dot_prefixed_ids_are_listed() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, "");
        for fqn in ["shop/dev/.env", "shop/dev/.cache/x", "shop/dev/plain"] {
            store.set(fqn, &record(fqn)).unwrap();
        }
        fs::write(tmp.path().join("shop/dev/.env.json.7.3.tmp"), b"partial").unwrap();

        assert_eq!(
            store.list().unwrap(),
            vec!["shop/dev/.cache/x", "shop/dev/.env", "shop/dev/plain"]
        );

        for key in store.list().unwrap() {
            store.delete(&key).unwrap();
        }
        assert!(store.get("shop/dev/.env").unwrap().is_none());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_delete_is_idempotent_and_prunes() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, "ns");
        store.set("app/dev/scope/c", &record("app/dev/scope/c")).unwrap();

        store.delete("app/dev/scope/c").unwrap();
        store.delete("app/dev/scope/c").unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(!tmp.path().join("ns/app").exists());
        assert!(tmp.path().join("ns").exists());
    }

    #[test]
    fn test_corrupt_file() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, "");
        fs::create_dir_all(tmp.path().join("app/dev")).unwrap();
        fs::write(tmp.path().join("app/dev/x.json"), b"{").unwrap();
        assert!(matches!(
            store.get("app/dev/x"),
            Err(Error::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_wrong_passphrase_is_decryption_error() {
        let tmp = TempDir::new().unwrap();
        let r = record("app/dev/a");
        store(&tmp, "").set(&r.fqn, &r).unwrap();

        let other = FsStore::new(
            tmp.path(),
            "",
            RecordCodec::new(SecretCodec::new(Passphrase::new("rotated")).unwrap()),
        );
        assert!(matches!(other.get(&r.fqn), Err(Error::Decryption { .. })));
    }

    #[test]
    fn test_invalid_key() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, "");
        assert!(matches!(
            store.get("../escape"),
            Err(Error::InvalidKey(_))
        ));
    }
}
