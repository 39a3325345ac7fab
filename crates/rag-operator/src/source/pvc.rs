//! PVC source checking
//!
//! Walks the locally mounted filesystem for the PVC and fingerprints every
//! regular file. Files under the size threshold are content-hashed (MD5);
//! larger files use a synthetic `<mtime_unix>-<size>` digest to bound
//! per-tick CPU. The combined digest hashes relative paths in sorted order.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use rag_common::{RagError, Result};
use sha2::Sha256;
use tracing::debug;
use walkdir::WalkDir;

use super::SourceScan;
use crate::crd::SourceMetadata;
use crate::source::diff::digest_sorted;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// Files at or above this size fall back to the mtime-size digest. The
/// constant value keeps previously recorded hashes stable.
pub const PVC_HASH_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Parse a PVC URI of the form `pvc://<pvc-name>[/subpath]`.
pub fn parse_pvc_uri(uri: &str) -> Result<(String, String)> {
    let rest = uri
        .strip_prefix("pvc://")
        .ok_or_else(|| RagError::InvalidUri(uri.to_string()))?;
    let (name, subpath) = match rest.split_once('/') {
        Some((name, subpath)) => (name, subpath),
        None => (rest, ""),
    };
    if name.is_empty() {
        return Err(RagError::InvalidUri(uri.to_string()));
    }
    Ok((name.to_string(), subpath.to_string()))
}

/// Walk the mounted PVC and build the source fingerprint.
///
/// When the mount root is not present (the operator may run without the
/// volume attached), degrades to a digest of the PVC coordinates so the
/// check fails soft instead of erroring every tick.
pub fn check(mount_root: &Path, uri: &str) -> Result<SourceScan> {
    let (pvc_name, subpath) = parse_pvc_uri(uri)?;
    let base: PathBuf = mount_root.join(&pvc_name).join(&subpath);

    if !base.exists() {
        debug!(path = %base.display(), "PVC path not accessible, using metadata-based digest");
        let mut hasher = Sha256::new();
        hasher.update(pvc_name.as_bytes());
        hasher.update(subpath.as_bytes());
        return Ok(SourceScan {
            hash: hex::encode(hasher.finalize()),
            metadata: SourceMetadata::default(),
            file_hint: 0,
        });
    }

    let (file_hashes, total_size, latest_mtime) = scan_dir(&base)?;
    let file_count = file_hashes.len() as u32;
    debug!(path = %base.display(), file_count, "walked PVC source");

    let hash = digest_sorted(&file_hashes);
    Ok(SourceScan {
        hash,
        metadata: SourceMetadata {
            file_count,
            total_size,
            file_hashes,
            last_modified_time: latest_mtime.map(Time),
            ..Default::default()
        },
        file_hint: file_count,
    })
}

/// Collect `relative path -> digest` for every regular file under `base`,
/// plus the total size and the latest modification time observed.
fn scan_dir(base: &Path) -> Result<(BTreeMap<String, String>, i64, Option<DateTime<Utc>>)> {
    let mut file_hashes = BTreeMap::new();
    let mut total_size: i64 = 0;
    let mut latest_mtime: Option<DateTime<Utc>> = None;

    for entry in WalkDir::new(base) {
        let entry = entry.map_err(|e| RagError::Internal(format!("walk failed: {}", e)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let metadata = entry.metadata().map_err(|e| RagError::Internal(e.to_string()))?;
        let size = metadata.len();
        let mtime: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::from)
            .unwrap_or(DateTime::UNIX_EPOCH);
        if latest_mtime.map_or(true, |t| mtime > t) {
            latest_mtime = Some(mtime);
        }

        let rel_path = entry
            .path()
            .strip_prefix(base)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();

        let digest = if size < PVC_HASH_MAX_BYTES {
            hash_file(entry.path()).unwrap_or_else(|_| synthetic_digest(mtime, size))
        } else {
            synthetic_digest(mtime, size)
        };

        total_size += size as i64;
        file_hashes.insert(rel_path, digest);
    }

    Ok((file_hashes, total_size, latest_mtime))
}

fn synthetic_digest(mtime: DateTime<Utc>, size: u64) -> String {
    format!("{}-{}", mtime.timestamp(), size)
}

/// MD5 content digest of a file, streamed in fixed-size reads.
fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_pvc_uri() {
        assert_eq!(
            parse_pvc_uri("pvc://corpus/docs/en").unwrap(),
            ("corpus".to_string(), "docs/en".to_string())
        );
        assert_eq!(
            parse_pvc_uri("pvc://corpus").unwrap(),
            ("corpus".to_string(), String::new())
        );
        assert!(parse_pvc_uri("pvc://").is_err());
        assert!(parse_pvc_uri("/mnt/corpus").is_err());
    }

    #[test]
    fn test_scan_hashes_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();

        let (hashes, total_size, mtime) = scan_dir(dir.path()).unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(total_size, 10);
        assert!(mtime.is_some());
        // MD5("hello")
        assert_eq!(hashes.get("a.txt").unwrap(), "5d41402abc4b2a76b9719d911017c592");
        assert!(hashes.contains_key("sub/b.txt"));
    }

    #[test]
    fn test_scan_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x"), b"1").unwrap();
        fs::write(dir.path().join("y"), b"2").unwrap();

        let (first, _, _) = scan_dir(dir.path()).unwrap();
        let (second, _, _) = scan_dir(dir.path()).unwrap();
        assert_eq!(digest_sorted(&first), digest_sorted(&second));
    }

    #[test]
    fn test_missing_mount_degrades_to_metadata_digest() {
        let scan = check(Path::new("/nonexistent-mount"), "pvc://corpus/docs").unwrap();
        assert!(!scan.hash.is_empty());
        assert_eq!(scan.metadata.file_count, 0);
        assert_eq!(scan.file_hint, 0);

        // Stable across invocations
        let again = check(Path::new("/nonexistent-mount"), "pvc://corpus/docs").unwrap();
        assert_eq!(scan.hash, again.hash);
    }

    #[test]
    fn test_content_change_changes_digest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"before").unwrap();
        let (first, _, _) = scan_dir(dir.path()).unwrap();

        fs::write(dir.path().join("a.txt"), b"after!").unwrap();
        let (second, _, _) = scan_dir(dir.path()).unwrap();

        assert_ne!(digest_sorted(&first), digest_sorted(&second));
    }
}
