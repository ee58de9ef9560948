#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tg_enrollbot::batcher::ApprovalBatcher;
use tg_enrollbot::catalog::{Catalog, CourseMeta};
use tg_enrollbot::db;
use tg_enrollbot::engine::ApprovalEngine;
use tg_enrollbot::notifier::{Notifier, NotifyOptions};
use tokio::sync::Mutex;

pub const ADMIN: i64 = 1000;

#[derive(Debug, Clone)]
pub struct Sent {
    pub recipient: i64,
    pub text: String,
    pub ack: Option<String>,
}

/// Records every outbound message. Recipients listed in `failing` get an error
/// instead, after the attempt has been recorded.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Sent>>>,
    failing: Arc<Mutex<Vec<i64>>>,
    fail_all: Arc<AtomicBool>,
}

impl RecordingNotifier {
    pub async fn fail_for(&self, recipient: i64) {
        self.failing.lock().await.push(recipient);
    }

    pub fn fail_everything(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<Sent> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, recipient: i64) -> Vec<Sent> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|s| s.recipient == recipient)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipient: i64, text: &str, options: NotifyOptions) -> Result<()> {
        self.sent.lock().await.push(Sent {
            recipient,
            text: text.to_string(),
            ack: options.ack_callback,
        });
        if self.fail_all.load(Ordering::SeqCst) || self.failing.lock().await.contains(&recipient) {
            return Err(anyhow!("chat {} unreachable", recipient));
        }
        Ok(())
    }
}

pub async fn setup_pool() -> db::Pool {
    // One connection: every new connection to sqlite::memory: is a fresh database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn catalog() -> Catalog {
    Catalog::new(vec![
        (
            CourseMeta {
                id: "python_beginner".into(),
                name: "Python for beginners".into(),
                group_link: Some("https://t.me/+python".into()),
            },
            vec![],
        ),
        (
            CourseMeta {
                id: "year3_sem1_os".into(),
                name: "Operating Systems".into(),
                group_link: None,
            },
            vec!["y3_s1_os1".into()],
        ),
        (
            CourseMeta {
                id: "excel".into(),
                name: "Excel".into(),
                group_link: Some("https://t.me/+excel".into()),
            },
            vec![],
        ),
    ])
}

pub struct Harness {
    pub pool: db::Pool,
    pub notifier: RecordingNotifier,
    pub batcher: ApprovalBatcher,
    pub engine: ApprovalEngine,
}

pub async fn harness(window: Duration) -> Harness {
    let pool = setup_pool().await;
    let notifier = RecordingNotifier::default();
    let shared: Arc<dyn Notifier> = Arc::new(notifier.clone());
    let batcher = ApprovalBatcher::new(pool.clone(), shared.clone(), ADMIN, window);
    let engine = ApprovalEngine::new(pool.clone(), catalog(), shared, batcher.clone(), ADMIN);
    Harness {
        pool,
        notifier,
        batcher,
        engine,
    }
}
