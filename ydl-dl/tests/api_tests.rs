//! HTTP API integration tests

mod helpers;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use helpers::{fake_audio, Harness, LONG_ID, UNKNOWN_ID};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use ydl_dl::db::tasks;
use ydl_dl::models::{Owner, TaskKind, TaskStatus};

fn post_json(uri: &str, user: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", "203.0.113.9, 10.0.0.1");
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, user: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(uri)
        .header("x-forwarded-for", "203.0.113.9");
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let harness = Harness::new().await;
    let response = harness.app().oneshot(get("/health", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "ydl-dl");
    assert_eq!(json["execution"], "inline");
    assert_eq!(json["running_tasks"], 0);
    assert_eq!(json["ready_archives"], 0);
    assert!(json.get("last_error").is_none());
}

#[tokio::test]
async fn test_single_download_streams_mp3() {
    let harness = Harness::new().await;
    let response = harness
        .app()
        .oneshot(post_json(
            "/download",
            None,
            json!({"url": "https://youtu.be/vid00000001", "quality": 320}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"vid00000001.mp3\""
    );
    assert_eq!(body_bytes(response).await, fake_audio("vid00000001"));

    // Anonymous owner is the first forwarded hop
    let owner = Owner::Ip("203.0.113.9".to_string());
    let task = tasks::find_latest_task(&harness.db, &owner).await.unwrap().unwrap();
    assert_eq!(task.kind, TaskKind::Single);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, "Done");
}

#[tokio::test]
async fn test_single_download_errors_map_to_status_codes() {
    let harness = Harness::new().await;

    let cases = [
        (json!({"url": "https://vimeo.com/123"}), StatusCode::BAD_REQUEST),
        (
            json!({"url": format!("https://www.youtube.com/watch?v={}", UNKNOWN_ID)}),
            StatusCode::BAD_REQUEST,
        ),
        (
            json!({"url": format!("https://www.youtube.com/watch?v={}", LONG_ID)}),
            StatusCode::BAD_REQUEST,
        ),
        (
            json!({"url": "https://youtu.be/vid00000001", "quality": 100}),
            StatusCode::BAD_REQUEST,
        ),
    ];

    for (body, expected) in cases {
        let response = harness
            .app()
            .oneshot(post_json("/download", Some("21"), body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), expected, "for {}", body);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "BAD_REQUEST");
    }

    // Failed attempts end in ERROR with the reason as progress
    let task = tasks::find_latest_task(&harness.db, &Owner::User(21))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert!(task.progress.contains("longer than 20 minutes"));
    assert_eq!(harness.downloader.total_calls(), 0);
}

#[tokio::test]
async fn test_batch_requires_user() {
    let harness = Harness::new().await;
    let response = harness
        .app()
        .oneshot(post_json("/batch", None, json!({"items": ["vid00000001"]})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_batch_rejects_ambiguous_source() {
    let harness = Harness::new().await;
    let response = harness
        .app()
        .oneshot(post_json(
            "/batch",
            Some("1"),
            json!({"items": ["vid00000001"], "playlist_url": helpers::PLAYLIST_URL}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = harness
        .app()
        .oneshot(post_json("/batch", Some("1"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_batch_progress_and_archive_pickup() {
    let harness = Harness::new().await;
    let app = harness.app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/batch",
            Some("42"),
            json!({"items": ["vid00000001", UNKNOWN_ID, "vid00000002"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let submitted = body_json(response).await;
    let task_id = submitted["task_id"].as_i64().unwrap();
    assert_eq!(submitted["status_code"], TaskStatus::WaitingOnUser.code());

    let response = app
        .clone()
        .oneshot(get("/batch/progress", Some("42")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let progress = body_json(response).await;
    assert_eq!(progress["task_id"], task_id);
    assert_eq!(progress["progress"], "Files downloaded(3) with 1 fails");
    assert_eq!(progress["items"], json!([1, 2, 1]));

    let response = app
        .clone()
        .oneshot(get("/progress", Some("42")))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["task_id"], task_id);

    let health = body_json(app.clone().oneshot(get("/health", None)).await.unwrap()).await;
    assert_eq!(health["ready_archives"], 1);

    let response = app
        .clone()
        .oneshot(get("/batch/archive", Some("42")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
    let bytes = body_bytes(response).await;
    assert_eq!(&bytes[..2], b"PK");

    let response = app
        .clone()
        .oneshot(get("/batch/archive", Some("42")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(get("/progress", Some("42")))
        .await
        .unwrap();
    let status = body_json(response).await;
    assert_eq!(status["status_code"], TaskStatus::Completed.code());
    assert_eq!(status["progress"], "Done");
}

#[tokio::test]
async fn test_second_task_while_running_conflicts() {
    let harness = Harness::new().await;
    let owner = Owner::User(77);
    tasks::create_task(&harness.db, &owner, TaskKind::Batch)
        .await
        .unwrap()
        .unwrap();

    let response = harness
        .app()
        .oneshot(post_json("/batch", Some("77"), json!({"items": ["vid00000001"]})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = harness
        .app()
        .oneshot(post_json(
            "/download",
            Some("77"),
            json!({"url": "https://youtu.be/vid00000001"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(harness.downloader.total_calls(), 0);
}

#[tokio::test]
async fn test_owner_required() {
    let harness = Harness::new().await;

    // No user header, no forwarded address, no connection info
    let request = Request::builder().uri("/progress").body(Body::empty()).unwrap();
    let response = harness.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = harness
        .app()
        .oneshot(get("/progress", Some("not-a-number")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = harness
        .app()
        .oneshot(get("/progress", Some("5")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
