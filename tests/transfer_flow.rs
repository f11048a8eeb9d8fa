use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use std::time::Duration as StdDuration;
use tempfile::TempDir;
use tower::ServiceExt;
use transfer_hub::{
    app::{self, Components},
    config::{AppConfig, Args},
    db,
    services::{background::BackgroundTasks, notification_worker::NotificationWorker},
};

const PUBLIC_URL: &str = "http://files.test";

struct TestApp {
    router: Router,
    tasks: BackgroundTasks,
    worker: Option<NotificationWorker>,
    spool: std::path::PathBuf,
    _dir: TempDir,
}

async fn spawn_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let args = Args {
        blob_dir: Some(dir.path().join("blobs").display().to_string()),
        public_url: Some(PUBLIC_URL.into()),
        mail_from: Some("noreply@files.test".into()),
        ..Default::default()
    };
    let mut cfg = AppConfig::from_sources(args, |_| None).unwrap();
    cfg.notifications.spool_dir = dir.path().join("outbox");
    cfg.notifications.queue_wait = StdDuration::from_millis(50);

    let pool = db::connect_in_memory().await.unwrap();
    db::migrate(&pool).await.unwrap();

    let Components {
        state,
        worker,
        tasks,
        failures: _,
    } = app::assemble(&cfg, pool);

    TestApp {
        router: app::router(state),
        tasks,
        worker,
        spool: cfg.notifications.spool_dir.clone(),
        _dir: dir,
    }
}

impl TestApp {
    async fn send(&self, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn json(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let (status, bytes) = self.send(req).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Create a transfer and upload `payload` through its presigned URL.
    async fn ready_transfer(&self, max_downloads: i64, payload: &'static str) -> String {
        let expires_at = Utc::now() + Duration::hours(1);
        let (status, created) = self
            .json(
                "POST",
                "/transfers",
                Some(json!({ "expires_at": expires_at, "max_downloads": max_downloads })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "INIT");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, ticket) = self
            .json(
                "POST",
                &format!("/transfers/{}/upload-url", id),
                Some(json!({ "filename": "notes.txt", "content_type": "text/plain" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let upload = local_path(ticket["upload_url"].as_str().unwrap());

        let (status, _) = self
            .send(
                Request::builder()
                    .method("PUT")
                    .uri(upload)
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, completed) = self
            .json("POST", &format!("/transfers/{}/complete", id), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(completed["status"], "READY");
        assert_eq!(completed["filename"], "notes.txt");
        assert_eq!(completed["file_type"], "text/plain");
        assert_eq!(completed["file_size"], payload.len() as i64);
        id
    }
}

fn local_path(url: &str) -> String {
    url.strip_prefix(PUBLIC_URL).unwrap().to_string()
}

#[tokio::test]
async fn upload_then_download_until_quota_runs_out() {
    let app = spawn_app().await;
    let id = app.ready_transfer(2, "hello world").await;

    let (status, first) = app
        .json("GET", &format!("/transfers/{}/download-url", id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["download_count"], 1);
    assert_eq!(first["max_downloads"], 2);

    let (status, body) = app
        .send(
            Request::builder()
                .uri(local_path(first["download_url"].as_str().unwrap()))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello world");

    let (status, second) = app
        .json("GET", &format!("/transfers/{}/download-url", id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["download_count"], 2);

    let (status, refused) = app
        .json("GET", &format!("/transfers/{}/download-url", id), None)
        .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(refused["error"], "transfer_limit_reached");

    let (status, fetched) = app.json("GET", &format!("/transfers/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["download_count"], 2);
    assert_eq!(fetched["status"], "READY");
}

#[tokio::test]
async fn tampered_download_url_is_forbidden() {
    let app = spawn_app().await;
    let id = app.ready_transfer(3, "secret").await;

    let (_, ticket) = app
        .json("GET", &format!("/transfers/{}/download-url", id), None)
        .await;
    let url = local_path(ticket["download_url"].as_str().unwrap());
    let (path, _) = url.split_once("X-Signature=").unwrap();
    let forged = format!("{}X-Signature=AAAA", path);

    let (status, _) = app
        .send(Request::builder().uri(forged).body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let unsigned = url.split('?').next().unwrap().to_string();
    let (status, _) = app
        .send(Request::builder().uri(unsigned).body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn deleted_transfer_stays_deleted() {
    let app = spawn_app().await;
    let id = app.ready_transfer(1, "bye").await;

    let (status, _) = app
        .json("DELETE", &format!("/transfers/{}", id), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app
        .json("DELETE", &format!("/transfers/{}", id), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, fetched) = app.json("GET", &format!("/transfers/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["status"], "DELETED");

    let (status, _) = app
        .json("GET", &format!("/transfers/{}/download-url", id), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn share_is_spooled_per_recipient() {
    let mut app = spawn_app().await;
    let id = app.ready_transfer(1, "shared").await;

    let (status, accepted) = app
        .json(
            "POST",
            &format!("/transfers/{}/share-download", id),
            Some(json!({ "emails": ["a@example.com", "b@example.com"] })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["status"], "accepted");

    app.tasks.wait_idle().await;
    let worker = app.worker.take().unwrap();
    assert_eq!(worker.poll_once().await.unwrap(), 1);

    let spooled = std::fs::read_dir(&app.spool).unwrap().count();
    assert_eq!(spooled, 2);

    // Sharing does not consume quota.
    let (_, fetched) = app.json("GET", &format!("/transfers/{}", id), None).await;
    assert_eq!(fetched["download_count"], 0);
}

#[tokio::test]
async fn list_filters_and_validates() {
    let app = spawn_app().await;
    let ready = app.ready_transfer(1, "x").await;
    let (_, _pending) = app
        .json(
            "POST",
            "/transfers",
            Some(json!({ "expires_at": Utc::now() + Duration::hours(2) })),
        )
        .await;

    let (status, page) = app.json("GET", "/transfers?status=ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total_count"], 1);
    assert_eq!(page["items"][0]["id"], ready.as_str());

    let (status, page) = app
        .json("GET", "/transfers?sort_by=expires_at&order=desc&limit=1", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total_count"], 2);
    assert_eq!(page["items"].as_array().unwrap().len(), 1);

    let (status, _) = app.json("GET", "/transfers?limit=0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.json("GET", "/transfers?sort_by=owner", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
