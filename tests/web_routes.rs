mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{harness, Harness, ADMIN};
use serde_json::Value;
use std::time::Duration;
use tempfile::TempDir;
use tg_enrollbot::db;
use tg_enrollbot::model::ApprovalStatus;
use tg_enrollbot::web::{router, WebState, CALLER_HEADER};
use tower::ServiceExt;

async fn app() -> (Router, Harness, TempDir) {
    let h = harness(Duration::from_secs(10)).await;
    let uploads = tempfile::tempdir().unwrap();
    let router = router(WebState {
        engine: h.engine.clone(),
        uploads_dir: uploads.path().to_path_buf(),
    });
    (router, h, uploads)
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn upload(query: &str, body: &'static [u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/payment/upload?{}", query))
        .body(Body::from(body))
        .unwrap()
}

fn admin_post(uri: &str, caller: i64) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(CALLER_HEADER, caller.to_string())
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, _h, _dir) = app().await;
    let resp = app
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["status"], "ok");
}

#[tokio::test]
async fn upload_stores_the_receipt_and_creates_a_pending_request() {
    let (app, h, dir) = app().await;
    let resp = app
        .oneshot(upload(
            "telegram_id=42&course_id=excel&payment_method=Sham",
            b"\x89PNG fake",
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = json_body(resp).await;
    assert_eq!(body["approval_status"], "pending");
    assert_eq!(body["payment_method"], "sham");

    let stored = db::find_enrollment(&h.pool, 42, "excel").await.unwrap().unwrap();
    let receipt = stored.payment_receipt.unwrap();
    let file = receipt.strip_prefix("upload:").unwrap();
    let saved = std::fs::read(dir.path().join(file)).unwrap();
    assert_eq!(saved, b"\x89PNG fake");

    let admin = h.notifier.sent_to(ADMIN).await;
    assert_eq!(admin.len(), 1);
    assert!(admin[0].text.contains(&receipt));
}

#[tokio::test]
async fn upload_rejects_bad_input() {
    let (app, h, _dir) = app().await;
    for (query, body) in [
        ("telegram_id=42&course_id=excel&payment_method=bitcoin", &b"x"[..]),
        ("telegram_id=abc&course_id=excel&payment_method=sham", &b"x"[..]),
        ("telegram_id=42&course_id=no%20spaces&payment_method=sham", &b"x"[..]),
        ("telegram_id=42&course_id=excel&payment_method=sham", &b""[..]),
    ] {
        let resp = app.clone().oneshot(upload(query, body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "query {}", query);
    }
    assert!(db::list_enrollments(&h.pool, 42).await.unwrap().is_empty());
}

#[tokio::test]
async fn admin_routes_require_the_admin_header() {
    let (app, h, _dir) = app().await;
    h.engine
        .submit(42, "excel", tg_enrollbot::model::PaymentMethod::Sham, None)
        .await
        .unwrap();

    let resp = app
        .clone()
        .oneshot(Request::get("/admin/pending").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app
        .clone()
        .oneshot(admin_post("/admin/enrollments/42/excel/approve", 42))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app
        .oneshot(
            Request::get("/admin/pending")
                .header(CALLER_HEADER, ADMIN.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["course_id"], "excel");
}

#[tokio::test]
async fn admin_decisions_go_through_the_engine() {
    let (app, h, _dir) = app().await;
    h.engine
        .submit(42, "excel", tg_enrollbot::model::PaymentMethod::Haram, None)
        .await
        .unwrap();

    let resp = app
        .clone()
        .oneshot(admin_post("/admin/enrollments/42/excel/approve", ADMIN))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["approval_status"], "approved");
    assert_eq!(h.batcher.open_courses(42), vec!["excel"]);

    let stored = db::find_enrollment(&h.pool, 42, "excel").await.unwrap().unwrap();
    assert_eq!(stored.approval_status, ApprovalStatus::Approved);

    let resp = app
        .clone()
        .oneshot(admin_post("/admin/enrollments/42/python_beginner/reject", ADMIN))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app
        .oneshot(admin_post("/admin/enrollments/42/excel/maybe", ADMIN))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

fn json_post(uri: &str, caller: Option<i64>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(caller) = caller {
        builder = builder.header(CALLER_HEADER, caller.to_string());
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn failed_submission_removes_the_stored_receipt() {
    let (app, h, dir) = app().await;
    h.pool.close().await;

    let resp = app
        .oneshot(upload(
            "telegram_id=42&course_id=excel&payment_method=sham",
            b"receipt",
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn messaging_routes() {
    let (app, h, _dir) = app().await;
    for (id, name) in [(1, "Lina"), (2, "Omar")] {
        h.engine
            .register_student(id, name, "", "", None, None)
            .await
            .unwrap();
    }
    h.notifier.fail_for(2).await;

    let resp = app
        .clone()
        .oneshot(json_post(
            "/admin/broadcast",
            Some(ADMIN),
            serde_json::json!({ "title": "Holiday", "body": "No class on Friday" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let report = json_body(resp).await;
    assert_eq!(report["recipients"], 2);
    assert_eq!(report["delivered"], 1);
    assert_eq!(
        h.notifier.sent_to(1).await[0].text,
        "Holiday\n\nNo class on Friday"
    );

    let resp = app
        .clone()
        .oneshot(json_post(
            "/admin/broadcast",
            Some(1),
            serde_json::json!({ "title": "x" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app
        .clone()
        .oneshot(json_post(
            "/admin/students/1/message",
            Some(ADMIN),
            serde_json::json!({ "body": "See you tomorrow" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["delivered"], true);

    let resp = app
        .clone()
        .oneshot(json_post(
            "/admin/students/99/message",
            Some(ADMIN),
            serde_json::json!({ "body": "hi" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app
        .clone()
        .oneshot(
            Request::get("/admin/students")
                .header(CALLER_HEADER, ADMIN.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["total"], 2);

    h.notifier.clear().await;
    let resp = app
        .oneshot(json_post(
            "/contact",
            None,
            serde_json::json!({ "telegram_id": 1, "message": "Is the link still valid?" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let admin = h.notifier.sent_to(ADMIN).await;
    assert_eq!(admin.len(), 1);
    assert!(admin[0].text.contains("Lina (1)"));
}

#[tokio::test]
async fn server_stops_when_shutdown_resolves() {
    let (_app, h, dir) = app().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let state = WebState {
        engine: h.engine.clone(),
        uploads_dir: dir.path().to_path_buf(),
    };
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(tg_enrollbot::web::serve(listener, state, async move {
        let _ = stopped.await;
    }));

    stop.send(()).unwrap();
    let finished = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop");
    assert!(finished.unwrap().is_ok());
}
