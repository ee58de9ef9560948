//! Per-student coalescing of approval notifications.
//!
//! Every approval for a student lands in that student's open batch and pushes
//! the flush deadline back by one quiet window (trailing debounce). When the
//! window finally elapses the student gets one message listing every course
//! approved in the burst, and the admin gets one summary.
//!
//! Batches live in memory only. The enrollment rows are already durable by the
//! time anything is registered here, so losing a batch loses a message, never
//! a decision.
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::{self, Pool};
use crate::notifier::{Notifier, NotifyOptions};

pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_secs(3);

/// Ack callback used when a batch message covers several courses.
pub const BATCH_ACK_CALLBACK: &str = "notification_course_approved_batch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedCourse {
    pub course_id: String,
    pub course_name: String,
    pub group_link: Option<String>,
}

struct OpenBatch {
    items: Vec<ApprovedCourse>,
    /// Identifies the armed timer; a timer whose generation is stale does nothing.
    generation: u64,
    timer: JoinHandle<()>,
}

struct Shared {
    pool: Pool,
    notifier: Arc<dyn Notifier>,
    admin_id: i64,
    window: Duration,
    batches: Mutex<HashMap<i64, OpenBatch>>,
    generations: AtomicU64,
}

#[derive(Clone)]
pub struct ApprovalBatcher {
    shared: Arc<Shared>,
}

impl ApprovalBatcher {
    pub fn new(pool: Pool, notifier: Arc<dyn Notifier>, admin_id: i64, window: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                notifier,
                admin_id,
                window,
                batches: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    fn batches(&self) -> MutexGuard<'_, HashMap<i64, OpenBatch>> {
        self.shared
            .batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an approved course to the student's batch and (re)arm its flush timer.
    ///
    /// Must be called from within a Tokio runtime. The check-and-mutate on the
    /// student's slot happens under one lock with no await in between.
    pub fn register(
        &self,
        student_id: i64,
        course_id: &str,
        course_name: &str,
        group_link: Option<&str>,
    ) {
        let item = ApprovedCourse {
            course_id: course_id.to_string(),
            course_name: course_name.to_string(),
            group_link: group_link.map(str::to_string),
        };
        let generation = self.shared.generations.fetch_add(1, Ordering::Relaxed) + 1;

        let mut batches = self.batches();
        let timer = self.arm(student_id, generation);
        match batches.entry(student_id) {
            Entry::Occupied(mut slot) => {
                let batch = slot.get_mut();
                if !batch.items.iter().any(|c| c.course_id == item.course_id) {
                    batch.items.push(item);
                }
                batch.generation = generation;
                let stale = std::mem::replace(&mut batch.timer, timer);
                stale.abort();
                debug!(student_id, course_id, items = batch.items.len(), "re-armed approval batch");
            }
            Entry::Vacant(slot) => {
                slot.insert(OpenBatch {
                    items: vec![item],
                    generation,
                    timer,
                });
                debug!(student_id, course_id, "opened approval batch");
            }
        }
    }

    fn arm(&self, student_id: i64, generation: u64) -> JoinHandle<()> {
        let this = self.clone();
        let window = self.shared.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            this.flush_generation(student_id, generation).await;
        })
    }

    async fn flush_generation(&self, student_id: i64, generation: u64) {
        let batch = {
            let mut batches = self.batches();
            match batches.get(&student_id) {
                Some(open) if open.generation == generation => batches.remove(&student_id),
                _ => None,
            }
        };
        if let Some(batch) = batch {
            self.deliver(student_id, batch.items).await;
        }
    }

    /// Send the student's batch now. Returns `false` when no batch was open,
    /// so repeated or racing flushes send at most once.
    pub async fn flush(&self, student_id: i64) -> bool {
        let batch = self.batches().remove(&student_id);
        match batch {
            Some(batch) => {
                batch.timer.abort();
                self.deliver(student_id, batch.items).await
            }
            None => false,
        }
    }

    /// Drop a course from the student's open batch. An emptied batch is
    /// discarded together with its timer.
    pub fn retract(&self, student_id: i64, course_id: &str) -> bool {
        let mut batches = self.batches();
        let Some(batch) = batches.get_mut(&student_id) else {
            return false;
        };
        let before = batch.items.len();
        batch.items.retain(|c| c.course_id != course_id);
        let removed = batch.items.len() < before;
        if batch.items.is_empty() {
            if let Some(batch) = batches.remove(&student_id) {
                batch.timer.abort();
            }
        }
        if removed {
            debug!(student_id, course_id, "retracted course from approval batch");
        }
        removed
    }

    /// Courses waiting in the student's open batch, in registration order.
    pub fn open_courses(&self, student_id: i64) -> Vec<String> {
        self.batches()
            .get(&student_id)
            .map(|b| b.items.iter().map(|c| c.course_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn open_students(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.batches().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Flush every open batch immediately. Used on shutdown.
    pub async fn drain(&self) -> usize {
        let open: Vec<(i64, OpenBatch)> = self.batches().drain().collect();
        let mut flushed = 0;
        for (student_id, batch) in open {
            batch.timer.abort();
            if self.deliver(student_id, batch.items).await {
                flushed += 1;
            }
        }
        if flushed > 0 {
            info!(flushed, "drained approval batches");
        }
        flushed
    }

    async fn deliver(&self, student_id: i64, items: Vec<ApprovedCourse>) -> bool {
        if items.is_empty() {
            return false;
        }

        let (text, ack) = compose_student_message(&items);
        if let Err(err) = self
            .shared
            .notifier
            .notify(student_id, &text, NotifyOptions::with_ack(ack))
            .await
        {
            warn!(?err, student_id, "failed to deliver approval notification");
        }

        let student_name = match db::get_student(&self.shared.pool, student_id).await {
            Ok(Some(student)) => student.display_name(),
            Ok(None) => student_id.to_string(),
            Err(err) => {
                warn!(?err, student_id, "failed to load student for approval summary");
                student_id.to_string()
            }
        };
        let summary = compose_admin_summary(&student_name, student_id, &items);
        if let Err(err) = self
            .shared
            .notifier
            .notify(self.shared.admin_id, &summary, NotifyOptions::default())
            .await
        {
            warn!(?err, student_id, "failed to deliver approval summary to admin");
        }

        info!(student_id, courses = items.len(), "flushed approval batch");
        true
    }
}

/// Student-facing text plus the callback data of its ack button.
pub fn compose_student_message(items: &[ApprovedCourse]) -> (String, String) {
    if let [only] = items {
        let mut text = format!("Your enrollment in {} has been approved ✅", only.course_name);
        if let Some(link) = &only.group_link {
            text.push_str(&format!("\n\nGroup link: {}", link));
        }
        return (text, format!("notification_course_approved_{}", only.course_id));
    }

    let mut text = String::from("Your enrollment in the following courses has been approved ✅\n\n");
    for course in items {
        text.push_str(&format!("• {}\n", course.course_name));
    }
    let linked: Vec<&ApprovedCourse> = items.iter().filter(|c| c.group_link.is_some()).collect();
    if !linked.is_empty() {
        text.push_str("\nGroup links:\n");
        for course in linked {
            if let Some(link) = &course.group_link {
                text.push_str(&format!("• {}: {}\n", course.course_name, link));
            }
        }
    }
    (text, BATCH_ACK_CALLBACK.to_string())
}

pub fn compose_admin_summary(student_name: &str, student_id: i64, items: &[ApprovedCourse]) -> String {
    if let [only] = items {
        return format!(
            "✅ Approval completed\n\n👤 Student: {} ({})\n📘 Course: {}",
            student_name, student_id, only.course_name
        );
    }
    let courses = items
        .iter()
        .map(|c| format!("• {}", c.course_name))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "✅ Approvals completed\n\n👤 Student: {} ({})\n📚 Courses:\n{}",
        student_name, student_id, courses
    )
}
