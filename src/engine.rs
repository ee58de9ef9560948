//! Enrollment approval state machine.
//!
//! Both front-ends call into [`ApprovalEngine`]. Every transition is persisted
//! before any message goes out; message delivery is best-effort and never
//! undoes a persisted decision.
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::batcher::ApprovalBatcher;
use crate::catalog::{is_valid_course_id, Catalog, CourseMeta};
use crate::db::{self, PendingRequest, Pool, StatusCounts};
use crate::model::{
    ApprovalStatus, Decision, Enrollment, NotificationEntry, NotificationKind, PaymentMethod,
    Student,
};
use crate::notifier::{Notifier, NotifyOptions};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no enrollment for student {student_id} in course {course_id}")]
    NotFound { student_id: i64, course_id: String },
    #[error("student {0} is not registered")]
    StudentNotFound(i64),
    #[error("caller {0} is not allowed to perform admin actions")]
    Unauthorized(i64),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// The single administrator is whoever the configuration names.
pub fn authorize(caller_id: i64, admin_id: i64) -> EngineResult<()> {
    if admin_id > 0 && caller_id == admin_id {
        Ok(())
    } else {
        Err(EngineError::Unauthorized(caller_id))
    }
}

/// Parse a Telegram account id coming from callback data, a URL or a form field.
pub fn parse_student_id(raw: &str) -> EngineResult<i64> {
    match raw.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(EngineError::Validation(format!("'{}' is not a student id", raw))),
    }
}

pub fn validate_course_id(raw: &str) -> EngineResult<&str> {
    if is_valid_course_id(raw) {
        Ok(raw)
    } else {
        Err(EngineError::Validation(format!("'{}' is not a course id", raw)))
    }
}

fn validate_student_id(student_id: i64) -> EngineResult<i64> {
    if student_id > 0 {
        Ok(student_id)
    } else {
        Err(EngineError::Validation(format!("'{}' is not a student id", student_id)))
    }
}

/// Longest free-text message accepted for relays and broadcasts (Telegram's limit).
pub const MAX_MESSAGE_CHARS: usize = 4096;

fn validate_message(text: &str) -> EngineResult<&str> {
    let text = text.trim();
    if text.is_empty() {
        return Err(EngineError::Validation("message must not be empty".into()));
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(EngineError::Validation(format!(
            "message longer than {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    Ok(text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub delivered: usize,
}

/// Everything the admin sees about one student.
#[derive(Debug, Clone, Serialize)]
pub struct StudentOverview {
    pub student: Student,
    pub enrollments: Vec<Enrollment>,
    pub notifications: Vec<NotificationEntry>,
}

#[derive(Clone)]
pub struct ApprovalEngine {
    pool: Pool,
    catalog: Arc<Catalog>,
    notifier: Arc<dyn Notifier>,
    batcher: ApprovalBatcher,
    admin_id: i64,
}

impl ApprovalEngine {
    pub fn new(
        pool: Pool,
        catalog: Catalog,
        notifier: Arc<dyn Notifier>,
        batcher: ApprovalBatcher,
        admin_id: i64,
    ) -> Self {
        Self {
            pool,
            catalog: Arc::new(catalog),
            notifier,
            batcher,
            admin_id,
        }
    }

    pub fn is_admin(&self, caller_id: i64) -> bool {
        authorize(caller_id, self.admin_id).is_ok()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Validate a course id and resolve catalog aliases, so one course is
    /// always stored and batched under a single id.
    pub fn canonical_course_id(&self, raw: &str) -> EngineResult<String> {
        let id = validate_course_id(raw)?;
        Ok(self
            .catalog
            .get(id)
            .map(|meta| meta.id.clone())
            .unwrap_or_else(|| id.to_string()))
    }

    /// Record or refresh a student's profile. Used by the registration flow.
    #[instrument(skip_all, fields(student_id = telegram_id))]
    pub async fn register_student(
        &self,
        telegram_id: i64,
        full_name: &str,
        phone: &str,
        email: &str,
        study_year: Option<i64>,
        specialization: Option<&str>,
    ) -> EngineResult<()> {
        validate_student_id(telegram_id)?;
        db::upsert_student(
            &self.pool,
            telegram_id,
            full_name.trim(),
            phone.trim(),
            email.trim(),
            study_year,
            specialization,
        )
        .await?;
        Ok(())
    }

    /// Make sure a Telegram user has a student row; an existing profile is only
    /// marked active, never overwritten.
    pub async fn ensure_registered(&self, telegram_id: i64, full_name: &str) -> EngineResult<Student> {
        validate_student_id(telegram_id)?;
        if let Some(student) = db::get_student(&self.pool, telegram_id).await? {
            db::touch_student(&self.pool, telegram_id).await?;
            return Ok(student);
        }
        db::upsert_student(&self.pool, telegram_id, full_name.trim(), "", "", None, None).await?;
        db::get_student(&self.pool, telegram_id)
            .await?
            .ok_or(EngineError::StudentNotFound(telegram_id))
    }

    /// Create the enrollment in `pending`, or put an existing one back to
    /// `pending` with the new proof. Any earlier decision is discarded.
    #[instrument(skip_all, fields(student_id = student_id, course_id = %course_id))]
    pub async fn submit(
        &self,
        student_id: i64,
        course_id: &str,
        payment_method: PaymentMethod,
        receipt_ref: Option<&str>,
    ) -> EngineResult<Enrollment> {
        validate_student_id(student_id)?;
        let course_id = self.canonical_course_id(course_id)?;
        let course_id = course_id.as_str();
        let receipt_ref = receipt_ref.map(str::trim).filter(|r| !r.is_empty());
        let meta = self.catalog.lookup(course_id);

        let record = db::record_submission(
            &self.pool,
            student_id,
            course_id,
            payment_method,
            receipt_ref,
            &format!("Payment proof submitted for {}", meta.name),
        )
        .await?;
        self.batcher.retract(student_id, course_id);
        info!(method = payment_method.as_str(), "enrollment pending review");

        let student_name = self.student_name(student_id).await;
        let text = format!(
            "🧾 New payment proof\n\n👤 Student: {} ({})\n📘 Course: {}\n💳 Method: {}\n🧷 Receipt: {}",
            student_name,
            student_id,
            meta.name,
            payment_method.as_str(),
            receipt_ref.unwrap_or("-"),
        );
        if let Err(err) = self
            .notifier
            .notify(self.admin_id, &text, NotifyOptions::default())
            .await
        {
            warn!(?err, "failed to tell admin about new payment proof");
        }

        Ok(record)
    }

    /// Approve or reject an existing enrollment on behalf of `caller_id`.
    ///
    /// Approvals are announced through the batcher after the quiet window;
    /// rejections are announced immediately.
    #[instrument(skip_all, fields(student_id = student_id, course_id = %course_id, decision = ?decision))]
    pub async fn decide(
        &self,
        caller_id: i64,
        student_id: i64,
        course_id: &str,
        decision: Decision,
    ) -> EngineResult<ApprovalStatus> {
        authorize(caller_id, self.admin_id)?;
        validate_student_id(student_id)?;
        let course_id = self.canonical_course_id(course_id)?;
        let course_id = course_id.as_str();

        let status = decision.resulting_status();
        let log_message = match decision {
            Decision::Approve => format!("Enrollment approved for {}", course_id),
            Decision::Reject => format!("Enrollment request rejected for {}", course_id),
        };
        let changed = db::record_decision(
            &self.pool,
            student_id,
            course_id,
            status,
            NotificationKind::from(decision),
            &log_message,
        )
        .await?;
        if !changed {
            return Err(EngineError::NotFound {
                student_id,
                course_id: course_id.to_string(),
            });
        }
        info!(status = status.as_str(), "enrollment decided");

        let meta = self.catalog.lookup(course_id);
        match decision {
            Decision::Approve => {
                self.batcher
                    .register(student_id, course_id, &meta.name, meta.group_link.as_deref());
            }
            Decision::Reject => {
                self.batcher.retract(student_id, course_id);
                self.announce_rejection(student_id, &meta).await;
            }
        }
        Ok(status)
    }

    async fn announce_rejection(&self, student_id: i64, meta: &CourseMeta) {
        let text = format!(
            "Your enrollment request for {} was rejected ❌\nPlease contact the administration.",
            meta.name
        );
        if let Err(err) = self
            .notifier
            .notify(student_id, &text, NotifyOptions::default())
            .await
        {
            warn!(?err, student_id, "failed to deliver rejection");
        }

        let student_name = self.student_name(student_id).await;
        let audit = format!(
            "❌ Rejection recorded\n\n👤 Student: {} ({})\n📘 Course: {}",
            student_name, student_id, meta.name
        );
        if let Err(err) = self
            .notifier
            .notify(self.admin_id, &audit, NotifyOptions::default())
            .await
        {
            warn!(?err, student_id, "failed to deliver rejection audit to admin");
        }
    }

    async fn student_name(&self, student_id: i64) -> String {
        match db::get_student(&self.pool, student_id).await {
            Ok(Some(student)) => student.display_name(),
            Ok(None) => student_id.to_string(),
            Err(err) => {
                warn!(?err, student_id, "failed to load student name");
                student_id.to_string()
            }
        }
    }

    pub async fn pending_requests(&self, caller_id: i64) -> EngineResult<Vec<PendingRequest>> {
        authorize(caller_id, self.admin_id)?;
        Ok(db::list_pending(&self.pool).await?)
    }

    pub async fn enrollment_detail(
        &self,
        caller_id: i64,
        student_id: i64,
        course_id: &str,
    ) -> EngineResult<(Student, Enrollment)> {
        authorize(caller_id, self.admin_id)?;
        let course_id = self.canonical_course_id(course_id)?;
        let course_id = course_id.as_str();
        let student = db::get_student(&self.pool, student_id)
            .await?
            .ok_or(EngineError::StudentNotFound(student_id))?;
        let enrollment = db::find_enrollment(&self.pool, student_id, course_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                student_id,
                course_id: course_id.to_string(),
            })?;
        Ok((student, enrollment))
    }

    pub async fn student_overview(
        &self,
        caller_id: i64,
        student_id: i64,
    ) -> EngineResult<StudentOverview> {
        authorize(caller_id, self.admin_id)?;
        let student = db::get_student(&self.pool, student_id)
            .await?
            .ok_or(EngineError::StudentNotFound(student_id))?;
        Ok(StudentOverview {
            enrollments: db::list_enrollments(&self.pool, student_id).await?,
            notifications: db::list_notifications(&self.pool, student_id).await?,
            student,
        })
    }

    pub async fn stats(&self, caller_id: i64) -> EngineResult<StatusCounts> {
        authorize(caller_id, self.admin_id)?;
        Ok(db::status_counts(&self.pool).await?)
    }

    pub async fn list_students(&self, caller_id: i64) -> EngineResult<Vec<Student>> {
        authorize(caller_id, self.admin_id)?;
        Ok(db::list_students(&self.pool).await?)
    }

    /// Send `text` to every registered student. Unreachable students are
    /// skipped; the report counts who actually got it.
    #[instrument(skip_all)]
    pub async fn broadcast(&self, caller_id: i64, text: &str) -> EngineResult<BroadcastReport> {
        authorize(caller_id, self.admin_id)?;
        let text = validate_message(text)?;
        let students = db::list_students(&self.pool).await?;

        let mut report = BroadcastReport {
            recipients: students.len(),
            delivered: 0,
        };
        for student in &students {
            match self
                .notifier
                .notify(student.telegram_id, text, NotifyOptions::default())
                .await
            {
                Ok(()) => report.delivered += 1,
                Err(err) => warn!(?err, student_id = student.telegram_id, "broadcast not delivered"),
            }
        }
        info!(recipients = report.recipients, delivered = report.delivered, "broadcast sent");
        Ok(report)
    }

    /// Direct message from the admin to one registered student. Returns
    /// whether the message was delivered.
    #[instrument(skip_all, fields(student_id = student_id))]
    pub async fn message_student(
        &self,
        caller_id: i64,
        student_id: i64,
        text: &str,
    ) -> EngineResult<bool> {
        authorize(caller_id, self.admin_id)?;
        let text = validate_message(text)?;
        if db::get_student(&self.pool, student_id).await?.is_none() {
            return Err(EngineError::StudentNotFound(student_id));
        }
        let body = format!("📩 Message from the administration\n\n{}", text);
        match self
            .notifier
            .notify(student_id, &body, NotifyOptions::default())
            .await
        {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(?err, "direct message not delivered");
                Ok(false)
            }
        }
    }

    /// Relay a student's message to the admin. Returns whether it was delivered.
    #[instrument(skip_all, fields(student_id = sender_id))]
    pub async fn contact_admin(&self, sender_id: i64, text: &str) -> EngineResult<bool> {
        validate_student_id(sender_id)?;
        let text = validate_message(text)?;
        let name = self.student_name(sender_id).await;
        let body = format!(
            "📨 New message from a student\n\n👤 Student: {} ({})\n\n{}",
            name, sender_id, text
        );
        match self
            .notifier
            .notify(self.admin_id, &body, NotifyOptions::default())
            .await
        {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(?err, "contact message not delivered");
                Ok(false)
            }
        }
    }

    /// A student's own enrollments, for the "my courses" view.
    pub async fn my_enrollments(&self, student_id: i64) -> EngineResult<Vec<Enrollment>> {
        Ok(db::list_enrollments(&self.pool, student_id).await?)
    }
}
