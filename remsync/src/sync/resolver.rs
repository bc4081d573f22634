use std::path::{Path, PathBuf};

use remsync_device::RemoteObject;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use super::store::MetadataStore;

/// One object the resolver decided must be (re)transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFetch {
    pub object: RemoteObject,
    pub local_path: PathBuf,
}

/// Computes the set of remote objects requiring transfer. Pure decision
/// function: it reads local files but mutates nothing.
///
/// Per object, short-circuiting on the first hit:
///   1. no local file at the mapped path
///   2. no store record for the path (first sync)
///   3. remote mod time or size differs from the record
///   4. local content hash differs from the recorded hash
///
/// Hashing only runs once the cheap metadata checks pass, so an unchanged
/// tree costs one hash per file and a changed tree costs none. An
/// unreadable local file hashes as "different" — equivalent to corruption,
/// never fatal.
pub async fn resolve(
    remote_objects: &[RemoteObject],
    store: &MetadataStore,
    remote_root: &str,
    files_root: &Path,
) -> Vec<PlannedFetch> {
    let mut plans = Vec::new();
    for object in remote_objects {
        let Some(relative) = relative_remote_path(&object.path, remote_root) else {
            continue;
        };
        let local_path = files_root.join(relative);
        if needs_sync(object, store, &local_path).await {
            plans.push(PlannedFetch {
                object: object.clone(),
                local_path,
            });
        }
    }
    plans
}

async fn needs_sync(object: &RemoteObject, store: &MetadataStore, local_path: &Path) -> bool {
    if !local_path.exists() {
        return true;
    }
    let Some(record) = store.get(&object.path) else {
        return true;
    };
    if object.mod_time != record.mod_time || object.size != record.size {
        return true;
    }
    match hash_file(local_path).await {
        Some(hash) => hash != record.hash,
        None => true,
    }
}

/// Strips the device root from a listed path, yielding the path relative
/// to the backup files directory. Objects outside the root are ignored.
pub fn relative_remote_path<'a>(remote_path: &'a str, remote_root: &str) -> Option<&'a str> {
    let stripped = remote_path.strip_prefix(remote_root)?;
    let relative = stripped.trim_start_matches('/');
    if relative.is_empty() { None } else { Some(relative) }
}

/// Streaming SHA-256 of a local file, hex-encoded. `None` when the file
/// cannot be read.
pub async fn hash_file(path: &Path) -> Option<String> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Some(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::store::MetadataStore;

    const ROOT: &str = "/home/root/.local/share/remarkable/xochitl";

    fn object(path: &str, mod_time: i64, size: u64) -> RemoteObject {
        RemoteObject {
            path: format!("{ROOT}/{path}"),
            mod_time,
            size,
        }
    }

    #[tokio::test]
    async fn new_remote_object_is_included_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::load(dir.path().join("meta.json"));
        let objects = vec![object("abc.metadata", 100, 10)];

        let plans = resolve(&objects, &store, ROOT, dir.path()).await;
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].local_path, dir.path().join("abc.metadata"));
    }

    #[tokio::test]
    async fn unchanged_object_with_matching_hash_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("abc.metadata");
        std::fs::write(&local, b"content").unwrap();

        let obj = object("abc.metadata", 100, 7);
        let mut store = MetadataStore::load(dir.path().join("meta.json"));
        store.record(&obj, hash_file(&local).await.unwrap());

        let plans = resolve(&[obj], &store, ROOT, dir.path()).await;
        assert!(plans.is_empty());
    }

    #[tokio::test]
    async fn metadata_drift_triggers_sync_without_hashing() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("abc.metadata");
        std::fs::write(&local, b"content").unwrap();

        let mut store = MetadataStore::load(dir.path().join("meta.json"));
        store.record(&object("abc.metadata", 100, 7), "ignored".to_string());

        // Same path, newer mtime.
        let plans = resolve(&[object("abc.metadata", 200, 7)], &store, ROOT, dir.path()).await;
        assert_eq!(plans.len(), 1);
    }

    #[tokio::test]
    async fn local_corruption_is_caught_by_the_hash_tier() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("abc.metadata");
        std::fs::write(&local, b"original").unwrap();

        let obj = object("abc.metadata", 100, 8);
        let mut store = MetadataStore::load(dir.path().join("meta.json"));
        store.record(&obj, hash_file(&local).await.unwrap());

        // Tamper locally; remote metadata is unchanged.
        std::fs::write(&local, b"tampered").unwrap();
        let plans = resolve(&[obj], &store, ROOT, dir.path()).await;
        assert_eq!(plans.len(), 1);
    }

    #[tokio::test]
    async fn missing_local_file_syncs_even_with_record() {
        let dir = tempfile::tempdir().unwrap();
        let obj = object("abc.metadata", 100, 8);
        let mut store = MetadataStore::load(dir.path().join("meta.json"));
        store.record(&obj, "whatever".to_string());

        let plans = resolve(&[obj], &store, ROOT, dir.path()).await;
        assert_eq!(plans.len(), 1);
    }

    #[test]
    fn relative_path_strips_the_device_root() {
        assert_eq!(
            relative_remote_path(&format!("{ROOT}/a/b.rm"), ROOT),
            Some("a/b.rm")
        );
        assert_eq!(relative_remote_path("/elsewhere/a.rm", ROOT), None);
        assert_eq!(relative_remote_path(ROOT, ROOT), None);
    }
}
