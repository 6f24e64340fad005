use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::infrastructure::broker::{Delivery, JobBroker};
use crate::modules::jobs::model::JobOutcome;
use crate::pipeline::orchestrator::Orchestrator;

const DEQUEUE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Runs `concurrency` worker slots until the broker stops delivering.
pub async fn start_transcoder_worker(
    orchestrator: Arc<Orchestrator>,
    broker: Arc<dyn JobBroker>,
    concurrency: usize,
) {
    info!("🎥 Starting transcoder worker with {} slot(s)", concurrency);

    let mut slots = JoinSet::new();
    for slot in 0..concurrency.max(1) {
        slots.spawn(run_slot(slot, orchestrator.clone(), broker.clone()));
    }
    while let Some(res) = slots.join_next().await {
        if let Err(e) = res {
            error!("Worker slot ended abnormally: {}", e);
        }
    }

    info!("🎥 Transcoder worker stopped");
}

async fn run_slot(slot: usize, orchestrator: Arc<Orchestrator>, broker: Arc<dyn JobBroker>) {
    loop {
        let delivery = match broker.dequeue().await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => break,
            Err(e) => {
                warn!("Slot {} could not dequeue: {}. Retrying in {:?}", slot, e, DEQUEUE_RETRY_DELAY);
                tokio::time::sleep(DEQUEUE_RETRY_DELAY).await;
                continue;
            }
        };

        info!("📦 Slot {} picked up job {}", slot, delivery.job.id);
        process(&orchestrator, broker.as_ref(), &delivery).await;

        if let Err(e) = broker.acknowledge(&delivery).await {
            error!("Failed to ack job {}: {}", delivery.job.id, e);
        }
    }
}

/// Runs the job on its own task so a panic fails the job instead of the slot.
async fn process(orchestrator: &Arc<Orchestrator>, broker: &dyn JobBroker, delivery: &Delivery) -> JobOutcome {
    let orchestrator = orchestrator.clone();
    let job = delivery.job.clone();

    match tokio::spawn(async move { orchestrator.run(&job).await }).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("💥 Job {} aborted: {}", delivery.job.id, e);
            let outcome = JobOutcome::Failed {
                reason: "transcoder crashed".to_string(),
            };
            if let Err(e) = broker.publish_terminal(&delivery.job.id, &outcome).await {
                error!("Could not record terminal state of {}: {}", delivery.job.id, e);
            }
            outcome
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::broker::MemoryBroker;
    use crate::infrastructure::storage::StorageClient;
    use crate::modules::jobs::model::JobState;
    use crate::pipeline::ffmpeg::FfmpegEncoder;
    use crate::pipeline::ladder::{DEFAULT_CODECS, Ladder};
    use crate::testing::KeyListStore;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_slots_drain_queue_and_finish_every_job() {
        let broker = Arc::new(MemoryBroker::new());
        let work_root = tempfile::tempdir().unwrap();
        let orchestrator = Arc::new(Orchestrator::new(
            StorageClient::new(Arc::new(KeyListStore::new(&[]))),
            Arc::new(FfmpegEncoder::new(PathBuf::from("ffmpeg"), PathBuf::from("ffprobe"))),
            broker.clone(),
            Arc::new(Ladder::standard(DEFAULT_CODECS)),
            work_root.path().to_path_buf(),
        ));

        let first = broker.enqueue("uploads/missing-1.mp4").await.unwrap();
        let second = broker.enqueue("uploads/missing-2.mp4").await.unwrap();
        broker.close();

        start_transcoder_worker(orchestrator, broker.clone(), 2).await;

        for id in [first, second] {
            let status = broker.job_status(&id).await.unwrap().unwrap();
            assert_eq!(status.state, JobState::Failed);
            assert_eq!(status.reason.as_deref(), Some("source unavailable"));
        }
        assert_eq!(std::fs::read_dir(work_root.path()).unwrap().count(), 0);
    }
}
