//! Versioned on-disk artifacts
//!
//! Layout under the store root:
//!
//! ```text
//! <language>/<metric>/CURRENT                  latest complete version
//! <language>/<metric>/v<version>/matrix.bin.gz  bincode, gzip
//! <language>/<metric>/v<version>/normalizer.json
//! <language>/<metric>/v<version>/manifest.json  sha256 of both files
//! ```
//!
//! A version directory is assembled under `.staging-<uuid>` and renamed into
//! place, then `CURRENT` is rewritten atomically. A crash at any point leaves
//! `CURRENT` naming a complete version or nothing.

use atomicwrites::{AllowOverwrite, AtomicFile};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use semrel_core::{Concept, ConceptId, Error, FeatureMatrix, FeatureVector, MatrixKey, Normalizer, NormalizerType, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MATRIX_FILE: &str = "matrix.bin.gz";
pub const NORMALIZER_FILE: &str = "normalizer.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const CURRENT_FILE: &str = "CURRENT";
const STAGING_PREFIX: &str = ".staging-";

/// Persisted matrix payload
#[derive(Debug, Serialize, Deserialize)]
struct MatrixData {
    metric: String,
    language: String,
    version: u64,
    entries: Vec<EntryData>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryData {
    id: u32,
    label: Option<String>,
    dims: Vec<u32>,
    weights: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

/// Description of one published version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub key: MatrixKey,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub concepts: usize,
    pub normalizer: NormalizerType,
    pub files: Vec<FileChecksum>,
}

impl Manifest {
    fn checksum(&self, name: &str) -> Option<&FileChecksum> {
        self.files.iter().find(|f| f.name == name)
    }
}

/// A loaded, checksum-verified version
#[derive(Debug)]
pub struct Artifact {
    pub manifest: Manifest,
    pub matrix: FeatureMatrix,
    pub normalizer: Normalizer,
}

/// Versioned artifact directories under one root
///
/// Publishing and pruning the same key are mutually exclusive, so a prune
/// never removes the staging directory of a publish in progress. Clones share
/// these locks.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    writers: Arc<Mutex<HashMap<MatrixKey, Arc<Mutex<()>>>>>,
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            writers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn writer(&self, key: &MatrixKey) -> Arc<Mutex<()>> {
        self.writers.lock().entry(key.clone()).or_default().clone()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: &MatrixKey) -> PathBuf {
        self.root.join(&key.language).join(&key.metric)
    }

    fn version_dir(&self, key: &MatrixKey, version: u64) -> PathBuf {
        self.key_dir(key).join(format!("v{}", version))
    }

    /// Millisecond timestamp, bumped past every version already on disk
    pub fn next_version(&self, key: &MatrixKey) -> Result<u64> {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let latest = self.list_versions(key)?.last().copied().unwrap_or(0);
        Ok(now.max(latest + 1))
    }

    /// Write `matrix` and `normalizer` as a new version and make it current
    pub fn publish(&self, matrix: &FeatureMatrix, normalizer: &Normalizer) -> Result<Manifest> {
        let key = matrix.key();
        let writer = self.writer(key);
        let _guard = writer.lock();
        let key_dir = self.key_dir(key);
        fs::create_dir_all(&key_dir)?;

        let target = self.version_dir(key, matrix.version());
        if target.exists() {
            return Err(Error::config(format!(
                "version {} of {} is already published",
                matrix.version(),
                key
            )));
        }

        let staging = key_dir.join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4()));
        fs::create_dir(&staging)?;
        let manifest = match Self::write_version(&staging, matrix, normalizer) {
            Ok(manifest) => manifest,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    warn!("Failed to remove staging directory {:?}: {}", staging, cleanup);
                }
                return Err(e);
            }
        };

        fs::rename(&staging, &target)?;
        self.write_current(key, matrix.version())?;

        info!(
            "Published {} version {} ({} concepts)",
            key,
            manifest.version,
            manifest.concepts
        );
        Ok(manifest)
    }

    fn write_version(dir: &Path, matrix: &FeatureMatrix, normalizer: &Normalizer) -> Result<Manifest> {
        let data = MatrixData {
            metric: matrix.key().metric.clone(),
            language: matrix.key().language.clone(),
            version: matrix.version(),
            entries: matrix
                .entries()
                .map(|(id, label, vector)| EntryData {
                    id: id.0,
                    label: label.map(str::to_string),
                    dims: vector.dims().to_vec(),
                    weights: vector.weights().to_vec(),
                })
                .collect(),
        };
        let payload = bincode::serialize(&data).map_err(|e| Error::Serialization(e.to_string()))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload)?;
        let matrix_bytes = encoder.finish()?;
        let normalizer_bytes = serde_json::to_vec_pretty(normalizer)?;

        let files = vec![
            write_file(dir, MATRIX_FILE, &matrix_bytes)?,
            write_file(dir, NORMALIZER_FILE, &normalizer_bytes)?,
        ];
        let manifest = Manifest {
            key: matrix.key().clone(),
            version: matrix.version(),
            created_at: Utc::now(),
            concepts: matrix.len(),
            normalizer: normalizer.kind(),
            files,
        };
        write_file(dir, MANIFEST_FILE, &serde_json::to_vec_pretty(&manifest)?)?;
        Ok(manifest)
    }

    fn write_current(&self, key: &MatrixKey, version: u64) -> Result<()> {
        let file = AtomicFile::new(self.key_dir(key).join(CURRENT_FILE), AllowOverwrite);
        file.write(|f| f.write_all(version.to_string().as_bytes()))
            .map_err(|e| match e {
                atomicwrites::Error::Internal(e) | atomicwrites::Error::User(e) => Error::Io(e),
            })
    }

    /// Version named by `CURRENT`, if any
    pub fn current_version(&self, key: &MatrixKey) -> Result<Option<u64>> {
        let path = self.key_dir(key).join(CURRENT_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        text.trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Corrupt(format!("{:?} does not name a version", path)))
    }

    /// Published version directories, oldest first
    pub fn list_versions(&self, key: &MatrixKey) -> Result<Vec<u64>> {
        let dir = self.key_dir(key);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(version) = name.to_str().and_then(|n| n.strip_prefix('v')).and_then(|v| v.parse().ok())
            else {
                continue;
            };
            if entry.path().join(MANIFEST_FILE).exists() {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Load and verify one version
    pub fn load(&self, key: &MatrixKey, version: u64) -> Result<Artifact> {
        let dir = self.version_dir(key, version);
        let manifest: Manifest = serde_json::from_slice(&fs::read(dir.join(MANIFEST_FILE))?)?;
        if manifest.key != *key || manifest.version != version {
            return Err(Error::Corrupt(format!(
                "manifest in {:?} describes {} version {}",
                dir, manifest.key, manifest.version
            )));
        }

        let matrix_bytes = read_verified(&dir, &manifest, MATRIX_FILE)?;
        let normalizer_bytes = read_verified(&dir, &manifest, NORMALIZER_FILE)?;

        let mut payload = Vec::new();
        GzDecoder::new(matrix_bytes.as_slice()).read_to_end(&mut payload)?;
        let data: MatrixData = bincode::deserialize(&payload).map_err(|e| Error::Corrupt(e.to_string()))?;
        let entries = data
            .entries
            .into_iter()
            .map(|e| {
                let vector = FeatureVector::from_sorted_parts(e.dims, e.weights)?;
                let concept = Concept {
                    id: ConceptId(e.id),
                    label: e.label,
                };
                Ok((concept, vector))
            })
            .collect::<Result<Vec<_>>>()?;
        let matrix = FeatureMatrix::new(key.clone(), data.version, entries)?;
        let normalizer: Normalizer = serde_json::from_slice(&normalizer_bytes)?;

        debug!("Loaded {} version {}", key, version);
        Ok(Artifact {
            manifest,
            matrix,
            normalizer,
        })
    }

    /// Load the version named by `CURRENT`
    pub fn load_latest(&self, key: &MatrixKey) -> Result<Option<Artifact>> {
        match self.current_version(key)? {
            Some(version) => self.load(key, version).map(Some),
            None => Ok(None),
        }
    }

    /// Delete all but the newest `keep` versions and any leftover staging
    /// directories; the current version is always kept
    pub fn prune(&self, key: &MatrixKey, keep: usize) -> Result<Vec<u64>> {
        let writer = self.writer(key);
        let _guard = writer.lock();
        let dir = self.key_dir(key);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let current = self.current_version(key)?;

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                fs::remove_dir_all(entry.path())?;
            }
        }

        let versions = self.list_versions(key)?;
        let cutoff = versions.len().saturating_sub(keep);
        let mut removed = Vec::new();
        for &version in &versions[..cutoff] {
            if Some(version) == current {
                continue;
            }
            fs::remove_dir_all(self.version_dir(key, version))?;
            removed.push(version);
        }
        if !removed.is_empty() {
            info!("Pruned {} old versions of {}", removed.len(), key);
        }
        Ok(removed)
    }
}

fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> Result<FileChecksum> {
    let mut file = fs::File::create(dir.join(name))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(FileChecksum {
        name: name.to_string(),
        size: bytes.len() as u64,
        sha256: format!("{:x}", Sha256::digest(bytes)),
    })
}

fn read_verified(dir: &Path, manifest: &Manifest, name: &str) -> Result<Vec<u8>> {
    let expected = manifest
        .checksum(name)
        .ok_or_else(|| Error::Corrupt(format!("manifest in {:?} has no entry for {}", dir, name)))?;
    let bytes = fs::read(dir.join(name))?;
    let actual = format!("{:x}", Sha256::digest(&bytes));
    if actual != expected.sha256 {
        return Err(Error::Corrupt(format!(
            "checksum mismatch for {:?}: expected {}, got {}",
            dir.join(name),
            expected.sha256,
            actual
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn matrix(version: u64) -> FeatureMatrix {
        FeatureMatrix::new(
            MatrixKey::new("esa", "simple"),
            version,
            vec![
                (Concept::new(1u32).with_label("Jazz"), FeatureVector::new([(1, 1.0), (2, 1.0)])),
                (Concept::new(2u32), FeatureVector::new([(1, 1.0), (2, 0.5)])),
                (Concept::new(3u32), FeatureVector::new([(3, 1.0)])),
            ],
        )
        .unwrap()
    }

    fn fitted() -> Normalizer {
        Normalizer::new(NormalizerType::Percentile).fit(&[0.0, 0.5, 0.9]).unwrap()
    }

    #[test]
    fn test_publish_and_load_latest() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let key = MatrixKey::new("esa", "simple");
        assert!(store.load_latest(&key).unwrap().is_none());

        let manifest = store.publish(&matrix(10), &fitted()).unwrap();
        assert_eq!(manifest.version, 10);
        assert_eq!(manifest.concepts, 3);
        assert_eq!(manifest.files.len(), 2);

        let artifact = store.load_latest(&key).unwrap().unwrap();
        assert_eq!(artifact.matrix.version(), 10);
        assert_eq!(artifact.matrix.ids(), &[ConceptId(1), ConceptId(2), ConceptId(3)]);
        assert_eq!(artifact.matrix.label(ConceptId(1)), Some("Jazz"));
        assert_eq!(artifact.matrix.get(ConceptId(2)).unwrap().get(2), 0.5);
        assert_eq!(artifact.normalizer, fitted());
    }

    #[test]
    fn test_versions_increase_and_current_moves() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let key = MatrixKey::new("esa", "simple");

        let first = store.next_version(&key).unwrap();
        store.publish(&matrix(first), &Normalizer::identity()).unwrap();
        let second = store.next_version(&key).unwrap();
        assert!(second > first);
        store.publish(&matrix(second), &Normalizer::identity()).unwrap();

        assert_eq!(store.list_versions(&key).unwrap(), vec![first, second]);
        assert_eq!(store.current_version(&key).unwrap(), Some(second));
        assert!(store.publish(&matrix(second), &Normalizer::identity()).is_err());
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let key = MatrixKey::new("esa", "simple");
        store.publish(&matrix(5), &fitted()).unwrap();

        let path = dir.path().join("simple").join("esa").join("v5").join(NORMALIZER_FILE);
        fs::write(&path, b"{\"kind\":\"identity\",\"model\":{\"type\":\"identity\"}}").unwrap();
        assert!(matches!(store.load(&key, 5), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_staging_is_ignored_and_pruned() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let key = MatrixKey::new("esa", "simple");
        for version in [1, 2, 3] {
            store.publish(&matrix(version), &Normalizer::identity()).unwrap();
        }
        let stale = dir.path().join("simple").join("esa").join(".staging-crashed");
        fs::create_dir_all(&stale).unwrap();
        assert_eq!(store.list_versions(&key).unwrap(), vec![1, 2, 3]);

        let removed = store.prune(&key, 1).unwrap();
        assert_eq!(removed, vec![1, 2]);
        assert!(!stale.exists());
        assert_eq!(store.list_versions(&key).unwrap(), vec![3]);
        assert!(store.load_latest(&key).unwrap().is_some());
    }

    #[test]
    fn test_prune_waits_for_staged_publish() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let key = MatrixKey::new("esa", "simple");
        store.publish(&matrix(1), &Normalizer::identity()).unwrap();

        // Hold the key as a publish would while its staging directory exists
        let staging = dir.path().join("simple").join("esa").join(".staging-in-flight");
        fs::create_dir_all(&staging).unwrap();
        let writer = store.writer(&key);
        let guard = writer.lock();

        let pruner = {
            let store = store.clone();
            let key = key.clone();
            std::thread::spawn(move || store.prune(&key, 1).unwrap())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(staging.exists());
        assert!(!pruner.is_finished());

        drop(guard);
        pruner.join().unwrap();
        assert!(!staging.exists());
    }

    #[test]
    fn test_concurrent_publish_and_prune() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let key = MatrixKey::new("esa", "simple");

        let workers: Vec<_> = (0..2u64)
            .map(|parity| {
                let store = store.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    for round in 0..20u64 {
                        let version = 1 + round * 2 + parity;
                        store.publish(&matrix(version), &Normalizer::identity()).unwrap();
                        store.prune(&key, 2).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(store.load_latest(&key).unwrap().is_some());
    }

    #[test]
    fn test_prune_never_removes_current() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let key = MatrixKey::new("esa", "simple");
        store.publish(&matrix(1), &Normalizer::identity()).unwrap();
        assert!(store.prune(&key, 0).unwrap().is_empty());
        assert_eq!(store.current_version(&key).unwrap(), Some(1));
    }
}
