mod common;

use common::{setup_pool, RecordingNotifier, ADMIN};
use std::sync::Arc;
use std::time::Duration;
use tg_enrollbot::batcher::ApprovalBatcher;
use tg_enrollbot::db;
use tg_enrollbot::notifier::Notifier;
use tokio::time::sleep;

async fn batcher(window: Duration) -> (ApprovalBatcher, RecordingNotifier, db::Pool) {
    let pool = setup_pool().await;
    let notifier = RecordingNotifier::default();
    let shared: Arc<dyn Notifier> = Arc::new(notifier.clone());
    (
        ApprovalBatcher::new(pool.clone(), shared, ADMIN, window),
        notifier,
        pool,
    )
}

#[tokio::test]
async fn each_registration_pushes_the_deadline_back() {
    let (b, notifier, _pool) = batcher(Duration::from_millis(300)).await;

    b.register(1, "a", "Alpha", None);
    sleep(Duration::from_millis(180)).await;
    b.register(1, "b", "Beta", Some("https://t.me/+b"));
    sleep(Duration::from_millis(200)).await;
    assert!(
        notifier.sent().await.is_empty(),
        "first timer must not fire after a re-arm"
    );
    assert_eq!(b.open_courses(1), vec!["a", "b"]);

    sleep(Duration::from_millis(300)).await;
    let student = notifier.sent_to(1).await;
    assert_eq!(student.len(), 1);
    assert!(student[0].text.contains("• Alpha\n• Beta"));
    assert!(student[0].text.contains("Beta: https://t.me/+b"));
    assert_eq!(notifier.sent_to(ADMIN).await.len(), 1);
    assert!(b.open_students().is_empty());
}

#[tokio::test]
async fn flushing_twice_sends_once() {
    let (b, notifier, _pool) = batcher(Duration::from_millis(100)).await;
    b.register(1, "a", "Alpha", None);

    assert!(b.flush(1).await);
    assert!(!b.flush(1).await);
    sleep(Duration::from_millis(250)).await;

    assert_eq!(notifier.sent_to(1).await.len(), 1);
    assert_eq!(notifier.sent_to(ADMIN).await.len(), 1);
}

#[tokio::test]
async fn racing_flushes_deliver_at_most_once() {
    let (b, notifier, _pool) = batcher(Duration::from_secs(10)).await;
    b.register(1, "a", "Alpha", None);

    let (first, second) = tokio::join!(b.flush(1), b.flush(1));
    assert!(first ^ second);
    assert_eq!(notifier.sent_to(1).await.len(), 1);
}

#[tokio::test]
async fn students_are_batched_independently() {
    let (b, notifier, _pool) = batcher(Duration::from_secs(10)).await;
    b.register(1, "a", "Alpha", None);
    b.register(2, "b", "Beta", None);
    b.register(1, "c", "Gamma", None);

    assert!(b.flush(1).await);
    assert_eq!(b.open_students(), vec![2]);
    assert_eq!(b.open_courses(2), vec!["b"]);

    let first = notifier.sent_to(1).await;
    assert_eq!(first.len(), 1);
    assert!(first[0].text.contains("Alpha") && first[0].text.contains("Gamma"));
    assert!(!first[0].text.contains("Beta"));
    assert!(notifier.sent_to(2).await.is_empty());
}

#[tokio::test]
async fn the_same_course_is_listed_once() {
    let (b, notifier, _pool) = batcher(Duration::from_secs(10)).await;
    b.register(1, "a", "Alpha", Some("https://t.me/+a"));
    b.register(1, "a", "Alpha", Some("https://t.me/+a"));
    assert_eq!(b.open_courses(1), vec!["a"]);

    b.flush(1).await;
    let sent = notifier.sent_to(1).await;
    assert_eq!(
        sent[0].ack.as_deref(),
        Some("notification_course_approved_a")
    );
}

#[tokio::test]
async fn retracting_the_last_course_cancels_the_batch() {
    let (b, notifier, _pool) = batcher(Duration::from_millis(100)).await;
    b.register(1, "a", "Alpha", None);

    assert!(!b.retract(1, "zzz"));
    assert!(b.retract(1, "a"));
    assert!(b.open_students().is_empty());

    sleep(Duration::from_millis(250)).await;
    assert!(notifier.sent().await.is_empty());
}

#[tokio::test]
async fn drain_flushes_every_open_batch() {
    let (b, notifier, _pool) = batcher(Duration::from_secs(10)).await;
    b.register(1, "a", "Alpha", None);
    b.register(2, "b", "Beta", None);
    b.register(3, "c", "Gamma", None);

    assert_eq!(b.drain().await, 3);
    assert!(b.open_students().is_empty());
    assert_eq!(notifier.sent_to(ADMIN).await.len(), 3);
    assert_eq!(b.drain().await, 0);
}

#[tokio::test]
async fn admin_summary_uses_the_stored_name() {
    let (b, notifier, pool) = batcher(Duration::from_secs(10)).await;
    db::upsert_student(&pool, 5, "Omar Khaled", "", "", None, None)
        .await
        .unwrap();
    b.register(5, "a", "Alpha", None);
    b.register(6, "a", "Alpha", None);
    b.drain().await;

    let admin: Vec<String> = notifier
        .sent_to(ADMIN)
        .await
        .into_iter()
        .map(|s| s.text)
        .collect();
    assert!(admin.iter().any(|t| t.contains("Omar Khaled (5)")));
    assert!(admin.iter().any(|t| t.contains("6 (6)")));
}

#[tokio::test]
async fn admin_summary_is_sent_even_if_the_student_is_unreachable() {
    let (b, notifier, _pool) = batcher(Duration::from_secs(10)).await;
    notifier.fail_for(1).await;
    b.register(1, "a", "Alpha", None);

    assert!(b.flush(1).await);
    assert_eq!(notifier.sent_to(1).await.len(), 1);
    assert_eq!(notifier.sent_to(ADMIN).await.len(), 1);
    assert!(b.open_students().is_empty());
}
