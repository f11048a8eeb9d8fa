//! Wiring: builds every component from one `AppConfig`.

use crate::{
    config::AppConfig,
    routes::routes::routes,
    services::{
        background::{BackgroundTasks, TaskFailure},
        blob_store::{LocalBlobStore, UrlSigner},
        cleanup::CleanupReconciler,
        mailer::SpoolMailer,
        notification_worker::{NotificationWorker, WorkerSettings},
        notifier::{NotificationPublisher, QueueTopic},
        object_gateway::ObjectGateway,
        queue::{MessageQueue, SqliteQueue},
        transfer_service::TransferService,
        transfer_store::TransferStore,
    },
    state::AppState,
};
use axum::Router;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Components {
    pub state: AppState,
    /// Present only when notifications are configured.
    pub worker: Option<NotificationWorker>,
    pub tasks: BackgroundTasks,
    pub failures: mpsc::UnboundedReceiver<TaskFailure>,
}

pub fn assemble(cfg: &AppConfig, db: SqlitePool) -> Components {
    let signer = match &cfg.signing_seed {
        Some(seed) => UrlSigner::from_seed(&seed.0),
        None => {
            tracing::warn!("no signing seed configured; presigned URLs will not survive a restart");
            UrlSigner::random()
        }
    };
    let blobs = LocalBlobStore::new(
        db.clone(),
        cfg.blob_dir.clone(),
        cfg.public_url.clone(),
        signer,
    );
    let gateway: Arc<dyn ObjectGateway> = Arc::new(blobs.clone());
    let store = TransferStore::new(db.clone());

    let notify = &cfg.notifications;
    let (tasks, failures) =
        BackgroundTasks::new(notify.publish_concurrency, cfg.policy.upstream_timeout);

    let (publisher, worker) = match &notify.mail_from {
        Some(from) => {
            let queue: Arc<dyn MessageQueue> =
                Arc::new(SqliteQueue::new(db.clone(), notify.visibility_timeout));
            let publisher: Arc<dyn NotificationPublisher> =
                Arc::new(QueueTopic::new(queue.clone()));
            let worker = NotificationWorker::new(
                queue,
                Arc::new(SpoolMailer::new(notify.spool_dir.clone())),
                WorkerSettings {
                    from: from.clone(),
                    batch: notify.queue_batch,
                    wait: notify.queue_wait,
                    backoff: notify.receive_backoff,
                    send_timeout: cfg.policy.upstream_timeout,
                },
            );
            (Some(publisher), Some(worker))
        }
        None => (None, None),
    };

    let transfers = TransferService::new(
        store.clone(),
        gateway.clone(),
        cfg.policy.clone(),
        publisher,
        tasks.clone(),
    );
    let cleanup = CleanupReconciler::new(
        store,
        gateway,
        cfg.cleanup.batch,
        cfg.cleanup.timeout,
        cfg.policy.upstream_timeout,
    );

    Components {
        state: AppState {
            transfers,
            cleanup,
            blobs,
            db,
        },
        worker,
        tasks,
        failures,
    }
}

/// The full HTTP application for `state`.
pub fn router(state: AppState) -> Router {
    routes().with_state(state)
}
