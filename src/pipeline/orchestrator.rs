//! Drives one job from delivery to a terminal state.
//!
//! `Preparing → Downloading → Encoding(1..=N) → Packaging → Uploading → Done`,
//! with `Failed` reachable from every non-terminal stage. The workspace is
//! created in `Preparing` and removed exactly once on the way out, whichever
//! way that is.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::infrastructure::broker::JobBroker;
use crate::infrastructure::storage::{StorageClient, StorageError};
use crate::modules::jobs::model::{JobDescriptor, JobId, JobOutcome};
use crate::pipeline::encoder::{EncodeError, Encoder, OutputSpec};
use crate::pipeline::ladder::Ladder;
use crate::pipeline::manifest::{self, MASTER_MANIFEST_NAME, RENDITION_MANIFEST_NAME, RenditionResult};
use crate::pipeline::progress::ProgressAggregator;
use crate::pipeline::workspace::{Workspace, collect_files};

/// Aggregated progress values buffered between the encode and the broker.
const PROGRESS_BUFFER: usize = 32;
/// Raw encoder progress buffered per rendition.
const ENCODER_PROGRESS_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preparing,
    Downloading,
    Encoding { index: usize, total: usize },
    Packaging,
    Uploading,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Preparing => write!(f, "preparing"),
            Stage::Downloading => write!(f, "downloading"),
            Stage::Encoding { index, total } => write!(f, "encoding {}/{}", index, total),
            Stage::Packaging => write!(f, "packaging"),
            Stage::Uploading => write!(f, "uploading"),
            Stage::Done => write!(f, "done"),
            Stage::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("workspace unavailable: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("source unavailable")]
    SourceUnavailable(#[source] StorageError),

    #[error("{rendition}: {source}")]
    Encode {
        rendition: String,
        #[source]
        source: EncodeError,
    },

    #[error("failed to write manifest: {0}")]
    Packaging(#[source] std::io::Error),

    #[error("upload of {key} failed: {source}")]
    Upload {
        key: String,
        #[source]
        source: StorageError,
    },
}

pub struct Orchestrator {
    storage: StorageClient,
    encoder: Arc<dyn Encoder>,
    broker: Arc<dyn JobBroker>,
    ladder: Arc<Ladder>,
    work_root: PathBuf,
    package_prefix: String,
}

impl Orchestrator {
    pub fn new(
        storage: StorageClient,
        encoder: Arc<dyn Encoder>,
        broker: Arc<dyn JobBroker>,
        ladder: Arc<Ladder>,
        work_root: PathBuf,
    ) -> Self {
        Self {
            storage,
            encoder,
            broker,
            ladder,
            work_root,
            package_prefix: super::PACKAGE_PREFIX.to_string(),
        }
    }

    /// Runs the job and reports its terminal state to the broker. Never fails
    /// itself: every error ends up as `JobOutcome::Failed`.
    pub async fn run(&self, job: &JobDescriptor) -> JobOutcome {
        info!("♻️  Processing job {} ({})", job.id, job.source_key);
        enter(&job.id, Stage::Preparing);

        let workspace = match Workspace::prepare(&self.work_root, &job.id, &job.source_key).await {
            Ok(ws) => ws,
            Err(e) => return self.finish(&job.id, Err(TranscodeError::Workspace(e))).await,
        };

        let (progress_tx, forwarder) = self.spawn_progress_forwarder(&job.id);
        let result = self.process(job, &workspace, &progress_tx).await;

        // Every queued progress value reaches the broker before the terminal event.
        drop(progress_tx);
        if let Err(e) = forwarder.await {
            warn!("Progress forwarder for {} ended abnormally: {}", job.id, e);
        }

        workspace.remove().await;
        self.finish(&job.id, result).await
    }

    async fn process(
        &self,
        job: &JobDescriptor,
        workspace: &Workspace,
        progress: &mpsc::Sender<u8>,
    ) -> Result<(), TranscodeError> {
        enter(&job.id, Stage::Downloading);
        self.storage
            .get(&job.source_key, workspace.input_path())
            .await
            .map_err(|e| {
                warn!("Source {} of job {} unavailable: {}", job.source_key, job.id, e);
                TranscodeError::SourceUnavailable(e)
            })?;

        let results = self.encode_all(&job.id, workspace, progress).await?;

        enter(&job.id, Stage::Packaging);
        let master = manifest::build(&results);
        tokio::fs::write(workspace.output_root().join(MASTER_MANIFEST_NAME), master)
            .await
            .map_err(TranscodeError::Packaging)?;

        enter(&job.id, Stage::Uploading);
        self.upload_package(&job.id, workspace).await
    }

    async fn encode_all(
        &self,
        job_id: &JobId,
        workspace: &Workspace,
        progress: &mpsc::Sender<u8>,
    ) -> Result<Vec<RenditionResult>, TranscodeError> {
        let total = self.ladder.len();
        let mut aggregator = ProgressAggregator::new(total);
        let mut results = Vec::with_capacity(total);

        for (i, rendition) in self.ladder.renditions().iter().enumerate() {
            enter(job_id, Stage::Encoding { index: i + 1, total });

            let output_dir = workspace.rendition_dir(&rendition.name);
            tokio::fs::create_dir_all(&output_dir)
                .await
                .map_err(TranscodeError::Workspace)?;
            let spec = OutputSpec::for_rendition(rendition, self.ladder.codecs(), &output_dir);

            let (encoder_tx, mut encoder_rx) = mpsc::channel::<f64>(ENCODER_PROGRESS_BUFFER);
            let encode = self.encoder.transcode(workspace.input_path(), &spec, encoder_tx);
            tokio::pin!(encode);

            let outcome = loop {
                tokio::select! {
                    res = &mut encode => break res,
                    Some(p) = encoder_rx.recv() => {
                        if let Some(v) = aggregator.update(p) {
                            let _ = progress.try_send(v);
                        }
                    }
                }
            };
            while let Ok(p) = encoder_rx.try_recv() {
                if let Some(v) = aggregator.update(p) {
                    let _ = progress.try_send(v);
                }
            }

            outcome.map_err(|source| TranscodeError::Encode {
                rendition: rendition.name.clone(),
                source,
            })?;

            if let Some(v) = aggregator.complete_rendition() {
                let _ = progress.try_send(v);
            }
            results.push(RenditionResult {
                name: rendition.name.clone(),
                relative_manifest_path: format!("{}/{}", rendition.name, RENDITION_MANIFEST_NAME),
                bitrate_bps: rendition.bitrate_bps,
                resolution: rendition.resolution(),
                codecs: self.ladder.codecs().to_string(),
            });
            info!("🎞️  Rendition {} of job {} encoded", rendition.name, job_id);
        }

        Ok(results)
    }

    async fn upload_package(&self, job_id: &JobId, workspace: &Workspace) -> Result<(), TranscodeError> {
        let mut files = collect_files(workspace.output_root())
            .await
            .map_err(TranscodeError::Workspace)?;

        // Ladder order, master playlist last.
        let rank = |relative: &str| {
            let top = relative.split('/').next().unwrap_or_default();
            self.ladder
                .renditions()
                .iter()
                .position(|r| r.name == top)
                .unwrap_or(usize::MAX)
        };
        files.sort_by_cached_key(|(_, relative)| (rank(relative), relative.clone()));

        info!("⬆️  Uploading {} files for job {}", files.len(), job_id);
        for (path, relative) in files {
            let key = format!("{}/{}/{}", self.package_prefix, job_id, relative);
            self.storage
                .put(&path, &key)
                .await
                .map_err(|source| TranscodeError::Upload { key, source })?;
        }
        Ok(())
    }

    fn spawn_progress_forwarder(&self, job_id: &JobId) -> (mpsc::Sender<u8>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<u8>(PROGRESS_BUFFER);
        let broker = self.broker.clone();
        let job_id = job_id.clone();

        let handle = tokio::spawn(async move {
            while let Some(percent) = rx.recv().await {
                if let Err(e) = broker.publish_progress(&job_id, percent).await {
                    debug!("Dropped progress {} for {}: {}", percent, job_id, e);
                }
            }
        });
        (tx, handle)
    }

    async fn finish(&self, job_id: &JobId, result: Result<(), TranscodeError>) -> JobOutcome {
        let outcome = match result {
            Ok(()) => {
                if let Err(e) = self.broker.publish_progress(job_id, 100).await {
                    debug!("Dropped final progress for {}: {}", job_id, e);
                }
                enter(job_id, Stage::Done);
                info!("✅ Job {} completed", job_id);
                JobOutcome::Completed
            }
            Err(e) => {
                enter(job_id, Stage::Failed);
                error!("❌ Job {} failed: {:?}", job_id, e);
                JobOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        if let Err(e) = self.broker.publish_terminal(job_id, &outcome).await {
            error!("Could not record terminal state of {}: {}", job_id, e);
        }
        outcome
    }
}

fn enter(job_id: &JobId, stage: Stage) {
    debug!(job_id = %job_id, stage = %stage, "stage");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::broker::MemoryBroker;
    use crate::infrastructure::storage::{ObjectStore, RetryPolicy};
    use crate::modules::jobs::model::{JobEvent, JobEventKind, JobState};
    use crate::pipeline::ladder::{DEFAULT_CODECS, RenditionSpec};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryStore {
        sources: HashMap<String, Vec<u8>>,
        objects: Mutex<HashMap<String, Vec<u8>>>,
        put_attempts: Mutex<HashMap<String, usize>>,
        /// Keys containing this fragment always fail to upload.
        failing_fragment: Option<String>,
    }

    impl MemoryStore {
        fn with_source(key: &str) -> Self {
            Self {
                sources: HashMap::from([(key.to_string(), b"raw video".to_vec())]),
                ..Self::default()
            }
        }

        fn keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
            keys.sort();
            keys
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put_file(&self, local_path: &Path, key: &str) -> Result<(), StorageError> {
            *self.put_attempts.lock().unwrap().entry(key.to_string()).or_default() += 1;
            let body = std::fs::read(local_path)?;
            if self.failing_fragment.as_deref().is_some_and(|f| key.contains(f)) {
                return Err(StorageError::Transport("503 Slow Down".to_string()));
            }
            self.objects.lock().unwrap().insert(key.to_string(), body);
            Ok(())
        }

        async fn get_file(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
            let body = self
                .sources
                .get(key)
                .ok_or_else(|| StorageError::NotFound { key: key.to_string() })?;
            std::fs::write(local_path, body)?;
            Ok(())
        }

        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            Ok(self.keys().into_iter().filter(|k| k.starts_with(prefix)).collect())
        }
    }

    /// Writes a one-segment playlist per rendition; can fail on the n-th call.
    #[derive(Default)]
    struct FakeEncoder {
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
    }

    #[async_trait]
    impl Encoder for FakeEncoder {
        async fn transcode(
            &self,
            input: &Path,
            spec: &OutputSpec,
            progress: mpsc::Sender<f64>,
        ) -> Result<(), EncodeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert!(input.exists(), "encoder ran without a downloaded source");

            for p in [0.0, 50.0] {
                let _ = progress.try_send(p);
                tokio::task::yield_now().await;
            }
            if self.fail_on_call == Some(call) {
                return Err(EncodeError::failed("Invalid data found when processing input"));
            }
            let _ = progress.try_send(100.0);

            tokio::fs::write(spec.output_dir.join("index0.ts"), b"segment").await?;
            tokio::fs::write(
                spec.manifest_path(),
                "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10.0,\nindex0.ts\n#EXT-X-ENDLIST\n",
            )
            .await?;
            Ok(())
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        encoder: Arc<FakeEncoder>,
        broker: Arc<MemoryBroker>,
        orchestrator: Orchestrator,
        work_root: tempfile::TempDir,
    }

    fn harness(store: MemoryStore, encoder: FakeEncoder) -> Harness {
        let store = Arc::new(store);
        let encoder = Arc::new(encoder);
        let broker = Arc::new(MemoryBroker::new());
        let work_root = tempfile::tempdir().unwrap();
        let ladder = Ladder::new(
            vec![
                RenditionSpec::new("360p", 640, 360, 800_000),
                RenditionSpec::new("720p", 1280, 720, 2_500_000),
                RenditionSpec::new("1080p", 1920, 1080, 5_000_000),
            ],
            DEFAULT_CODECS,
        )
        .unwrap();
        let storage = StorageClient::with_retry(
            store.clone(),
            RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(1),
            },
        );
        let orchestrator = Orchestrator::new(
            storage,
            encoder.clone(),
            broker.clone(),
            Arc::new(ladder),
            work_root.path().to_path_buf(),
        );
        Harness {
            store,
            encoder,
            broker,
            orchestrator,
            work_root,
        }
    }

    impl Harness {
        /// Enqueues, runs and returns the outcome plus every event up to the terminal one.
        async fn run(&self, source_key: &str) -> (JobDescriptor, JobOutcome, Vec<JobEvent>) {
            let mut events = self.broker.subscribe().await.unwrap();
            self.broker.enqueue(source_key).await.unwrap();
            let delivery = self.broker.dequeue().await.unwrap().unwrap();

            let outcome = self.orchestrator.run(&delivery.job).await;

            let mut seen = Vec::new();
            while let Some(event) = events.next().await {
                let terminal = event.is_terminal();
                seen.push(event);
                if terminal {
                    break;
                }
            }
            (delivery.job, outcome, seen)
        }

        fn workspace_exists(&self, job: &JobDescriptor) -> bool {
            self.work_root.path().join(job.id.as_str()).exists()
        }
    }

    fn progress_values(events: &[JobEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e.kind {
                JobEventKind::Progress { percent } => Some(percent),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_successful_job_publishes_package() {
        let h = harness(MemoryStore::with_source("uploads/clip.mp4"), FakeEncoder::default());
        let (job, outcome, events) = h.run("uploads/clip.mp4").await;

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(events.last().unwrap().kind, JobEventKind::Completed);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let progress = progress_values(&events);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
        assert_eq!(progress.last(), Some(&100));
        assert!(progress[..progress.len() - 1].iter().all(|p| *p < 100));

        let prefix = format!("hls/{}", job.id);
        let keys = h.store.keys();
        for rel in [
            "master.m3u8",
            "360p/index.m3u8",
            "360p/index0.ts",
            "720p/index.m3u8",
            "1080p/index0.ts",
        ] {
            assert!(keys.contains(&format!("{prefix}/{rel}")), "missing {rel} in {keys:?}");
        }

        let objects = h.store.objects.lock().unwrap();
        let master = String::from_utf8(objects[&format!("{prefix}/master.m3u8")].clone()).unwrap();
        let streams: Vec<&str> = master.lines().filter(|l| l.starts_with("#EXT-X-STREAM-INF")).collect();
        assert_eq!(streams.len(), 3);
        assert!(streams[0].contains("BANDWIDTH=800000,RESOLUTION=640x360"));
        assert!(streams[1].contains("BANDWIDTH=2500000,RESOLUTION=1280x720"));
        assert!(streams[2].contains("BANDWIDTH=5000000,RESOLUTION=1920x1080"));
        drop(objects);

        let status = h.broker.job_status(&job.id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.progress, 100);
        assert!(!h.workspace_exists(&job));
    }

    #[tokio::test]
    async fn test_missing_source_fails_before_encoding() {
        let h = harness(MemoryStore::default(), FakeEncoder::default());
        let (job, outcome, events) = h.run("uploads/gone.mp4").await;

        assert_eq!(
            outcome,
            JobOutcome::Failed {
                reason: "source unavailable".to_string()
            }
        );
        assert_eq!(h.encoder.calls.load(Ordering::SeqCst), 0);
        assert!(h.store.keys().is_empty());
        assert!(progress_values(&events).is_empty());
        assert!(!h.workspace_exists(&job));
    }

    #[tokio::test]
    async fn test_encode_failure_abandons_remaining_renditions() {
        let encoder = FakeEncoder {
            fail_on_call: Some(2),
            ..FakeEncoder::default()
        };
        let h = harness(MemoryStore::with_source("uploads/clip.mp4"), encoder);
        let (job, outcome, events) = h.run("uploads/clip.mp4").await;

        let JobOutcome::Failed { reason } = &outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.starts_with("720p:"), "{reason}");
        assert!(reason.contains("Invalid data found"));
        assert_eq!(h.encoder.calls.load(Ordering::SeqCst), 2);
        assert!(h.store.keys().is_empty(), "nothing may be uploaded");
        assert!(matches!(events.last().unwrap().kind, JobEventKind::Failed { .. }));
        assert!(progress_values(&events).iter().all(|p| *p < 100));
        assert!(!h.workspace_exists(&job));
    }

    #[tokio::test]
    async fn test_exhausted_upload_fails_job() {
        let store = MemoryStore {
            failing_fragment: Some("1080p/index0.ts".to_string()),
            ..MemoryStore::with_source("uploads/clip.mp4")
        };
        let h = harness(store, FakeEncoder::default());
        let (job, outcome, events) = h.run("uploads/clip.mp4").await;

        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        let failing_key = format!("hls/{}/1080p/index0.ts", job.id);
        assert_eq!(h.store.put_attempts.lock().unwrap()[&failing_key], 3);

        // lower renditions made it, the package as a whole did not
        let keys = h.store.keys();
        assert!(keys.contains(&format!("hls/{}/360p/index0.ts", job.id)));
        assert!(keys.contains(&format!("hls/{}/720p/index0.ts", job.id)));
        assert!(!keys.contains(&format!("hls/{}/master.m3u8", job.id)));
        assert!(!progress_values(&events).contains(&100));

        let status = h.broker.job_status(&job.id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert!(status.reason.unwrap().contains("1080p/index0.ts"));
        assert!(!h.workspace_exists(&job));
    }

    struct PanickingEncoder;

    #[async_trait]
    impl Encoder for PanickingEncoder {
        async fn transcode(&self, _: &Path, _: &OutputSpec, _: mpsc::Sender<f64>) -> Result<(), EncodeError> {
            panic!("encoder blew up");
        }
    }

    #[tokio::test]
    async fn test_workspace_removed_when_run_panics() {
        let store = Arc::new(MemoryStore::with_source("uploads/clip.mp4"));
        let broker = Arc::new(MemoryBroker::new());
        let work_root = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            StorageClient::new(store),
            Arc::new(PanickingEncoder),
            broker,
            Arc::new(Ladder::standard(DEFAULT_CODECS)),
            work_root.path().to_path_buf(),
        );
        let job = JobDescriptor {
            id: JobId::from("boom"),
            source_key: "uploads/clip.mp4".to_string(),
        };

        let handle = tokio::spawn(async move { orchestrator.run(&job).await });
        assert!(handle.await.unwrap_err().is_panic());
        assert!(!work_root.path().join("boom").exists());
    }
}
