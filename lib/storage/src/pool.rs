// Bounded pool of build workers
// Jobs wait in a FIFO queue; builds of the same matrix key never overlap.

use crate::builder::{BuildReport, CancellationToken, FeatureMatrixBuilder};
use parking_lot::{Condvar, Mutex};
use semrel_core::{Error, MatrixKey, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

struct BuildJob {
    builder: FeatureMatrixBuilder,
    token: CancellationToken,
    done: mpsc::Sender<Result<BuildReport>>,
}

struct Shared {
    jobs: Mutex<VecDeque<BuildJob>>,
    condvar: Condvar,
    running: AtomicBool,
    key_locks: Mutex<HashMap<MatrixKey, Arc<Mutex<()>>>>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn key_lock(&self, key: &MatrixKey) -> Arc<Mutex<()>> {
        self.key_locks.lock().entry(key.clone()).or_default().clone()
    }

    fn run(&self, job: BuildJob) {
        let key = job.builder.key();
        let lock = self.key_lock(&key);
        let _guard = lock.lock();

        let result = if job.token.is_cancelled() {
            Err(Error::Cancelled(key.to_string()))
        } else {
            job.builder.build(&job.token)
        };
        match &result {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Build of {} failed: {}", key, e);
            }
        }
        // The caller may have dropped its handle
        let _ = job.done.send(result);
    }
}

/// Handle to a submitted build
pub struct BuildHandle {
    key: MatrixKey,
    token: CancellationToken,
    result: mpsc::Receiver<Result<BuildReport>>,
}

impl BuildHandle {
    pub fn key(&self) -> &MatrixKey {
        &self.key
    }

    /// Request cancellation; a queued build never starts, a running one stops
    /// at its next check
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Block until the build finishes
    pub fn wait(self) -> Result<BuildReport> {
        self.result
            .recv()
            .unwrap_or_else(|_| Err(Error::Cancelled(format!("{} (pool shut down)", self.key))))
    }
}

pub struct BuildPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl BuildPool {
    pub fn new(workers: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            jobs: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            running: AtomicBool::new(true),
            key_locks: Mutex::new(HashMap::new()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let count = workers.max(1);
        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("build-worker-{}", worker_id))
                .spawn(move || worker_loop(&shared))?;
            handles.push(handle);
        }
        info!("Build pool started with {} workers", count);

        Ok(Self {
            shared,
            workers: handles,
        })
    }

    pub fn submit(&self, builder: FeatureMatrixBuilder) -> BuildHandle {
        let key = builder.key();
        let token = CancellationToken::new();
        let (done, result) = mpsc::channel();
        {
            let mut jobs = self.shared.jobs.lock();
            jobs.push_back(BuildJob {
                builder,
                token: token.clone(),
                done,
            });
        }
        self.shared.condvar.notify_one();
        debug!("Queued build of {}", key);
        BuildHandle { key, token, result }
    }

    pub fn pending(&self) -> usize {
        self.shared.jobs.lock().len()
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work, drain the queue and join every worker
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.condvar.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Build worker panicked");
            }
        }
    }
}

impl Drop for BuildPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut jobs = shared.jobs.lock();
            while jobs.is_empty() && shared.running.load(Ordering::Acquire) {
                shared.condvar.wait(&mut jobs);
            }
            match jobs.pop_front() {
                Some(job) => job,
                None => break,
            }
        };
        shared.run(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ArtifactStore;
    use semrel_core::{Concept, ConceptId, FeatureSource, FeatureVector, MetricKind, Normalizer, NormalizerType, Registry};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Source that records how many builds read it at once
    struct SlowSource {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl FeatureSource for SlowSource {
        fn concepts(&self) -> Result<Vec<Concept>> {
            Ok((1..=3u32).map(Concept::new).collect())
        }

        fn contribution(&self, id: ConceptId) -> Result<Option<FeatureVector>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(FeatureVector::new([(id.0, 1.0)])))
        }
    }

    fn setup() -> (TempDir, Arc<ArtifactStore>, Registry) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let registry = Registry::new();
        for name in ["esa", "links"] {
            registry
                .register_matrix_metric(
                    MatrixKey::new(name, "simple"),
                    MetricKind::Vector,
                    None,
                    Normalizer::new(NormalizerType::Identity),
                    None,
                )
                .unwrap();
        }
        (dir, store, registry)
    }

    #[test]
    fn test_same_key_builds_are_serialized() {
        let (_dir, store, registry) = setup();
        let pool = BuildPool::new(4).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let source = Arc::new(SlowSource {
                    active: active.clone(),
                    peak: peak.clone(),
                });
                let entry = registry.get("simple", "esa").unwrap();
                pool.submit(FeatureMatrixBuilder::new(entry, source, store.clone()))
            })
            .collect();

        let mut versions: Vec<u64> = handles.into_iter().map(|h| h.wait().unwrap().version).collect();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        versions.sort_unstable();
        versions.dedup();
        assert_eq!(versions.len(), 3);
        assert_eq!(pool.completed(), 3);
    }

    #[test]
    fn test_independent_keys_both_complete() {
        let (_dir, store, registry) = setup();
        let pool = BuildPool::new(2).unwrap();
        let handles: Vec<_> = ["esa", "links"]
            .into_iter()
            .map(|name| {
                let source = Arc::new(SlowSource {
                    active: Arc::new(AtomicUsize::new(0)),
                    peak: Arc::new(AtomicUsize::new(0)),
                });
                let entry = registry.get("simple", name).unwrap();
                pool.submit(FeatureMatrixBuilder::new(entry, source, store.clone()))
            })
            .collect();

        for handle in handles {
            let key = handle.key().clone();
            assert_eq!(handle.wait().unwrap().key, key);
        }
        assert!(registry.get("simple", "links").unwrap().metric().is_built());
    }

    #[test]
    fn test_cancel_before_start() {
        let (_dir, store, registry) = setup();
        let pool = BuildPool::new(1).unwrap();
        let slow = |registry: &Registry| {
            let source = Arc::new(SlowSource {
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            });
            FeatureMatrixBuilder::new(registry.get("simple", "esa").unwrap(), source, store.clone())
        };

        let first = pool.submit(slow(&registry));
        let second = pool.submit(slow(&registry));
        second.cancel();

        assert!(first.wait().is_ok());
        assert!(matches!(second.wait(), Err(Error::Cancelled(_))));
        assert_eq!(store.list_versions(&MatrixKey::new("esa", "simple")).unwrap().len(), 1);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let (_dir, store, registry) = setup();
        let mut pool = BuildPool::new(1).unwrap();
        let source: Arc<dyn FeatureSource> =
            Arc::new(semrel_core::StaticFeatureSource::new().with(1, &[(1, 1.0)]).with(2, &[(2, 1.0)]));
        let handle = pool.submit(FeatureMatrixBuilder::new(
            registry.get("simple", "esa").unwrap(),
            source,
            store.clone(),
        ));
        pool.shutdown();
        assert_eq!(pool.pending(), 0);
        assert!(handle.wait().is_ok());
    }
}
