use super::model::{PendingRequest, StatusCounts};
use crate::model::{
    ApprovalStatus, Enrollment, NotificationEntry, NotificationKind, PaymentMethod, Student,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{}&mode=rwc", q),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{}?{}", expanded_path, query)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn parse_status(raw: &str) -> Result<ApprovalStatus> {
    ApprovalStatus::parse_status(raw).ok_or_else(|| anyhow!("unknown approval status {}", raw))
}

fn parse_method(raw: &str) -> Result<PaymentMethod> {
    PaymentMethod::parse_method(raw).ok_or_else(|| anyhow!("unknown payment method {}", raw))
}

fn enrollment_from_row(row: &SqliteRow) -> Result<Enrollment> {
    let status: String = row.get("approval_status");
    let method: String = row.get("payment_method");
    Ok(Enrollment {
        course_id: row.get("course_id"),
        approval_status: parse_status(&status)?,
        payment_method: parse_method(&method)?,
        payment_receipt: row.get("payment_receipt"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn student_from_row(row: &SqliteRow) -> Student {
    Student {
        telegram_id: row.get("telegram_id"),
        full_name: row.get("full_name"),
        phone: row.get("phone"),
        email: row.get("email"),
        study_year: row.get("study_year"),
        specialization: row.get("specialization"),
        registered_at: row.get("registered_at"),
        last_active: row.get("last_active"),
    }
}

/// Insert or refresh a student's profile. `registered_at` is kept on update.
#[instrument(skip_all)]
pub async fn upsert_student(
    pool: &Pool,
    telegram_id: i64,
    full_name: &str,
    phone: &str,
    email: &str,
    study_year: Option<i64>,
    specialization: Option<&str>,
) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO students (telegram_id, full_name, phone, email, study_year, specialization, registered_at, last_active) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(telegram_id) DO UPDATE SET \
            full_name = excluded.full_name, phone = excluded.phone, email = excluded.email, \
            study_year = excluded.study_year, specialization = excluded.specialization, \
            last_active = excluded.last_active",
    )
    .bind(telegram_id)
    .bind(full_name)
    .bind(phone)
    .bind(email)
    .bind(study_year)
    .bind(specialization)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to upsert student")?;
    Ok(())
}

/// Create a placeholder row for a student known only by id. No-op if present.
async fn ensure_student_tx(tx: &mut Transaction<'_, Sqlite>, telegram_id: i64) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT OR IGNORE INTO students (telegram_id, registered_at, last_active) VALUES (?, ?, ?)",
    )
    .bind(telegram_id)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn touch_student(pool: &Pool, telegram_id: i64) -> Result<()> {
    sqlx::query("UPDATE students SET last_active = ? WHERE telegram_id = ?")
        .bind(Utc::now())
        .bind(telegram_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_student(pool: &Pool, telegram_id: i64) -> Result<Option<Student>> {
    let row = sqlx::query(
        "SELECT telegram_id, full_name, phone, email, study_year, specialization, registered_at, last_active \
         FROM students WHERE telegram_id = ?",
    )
    .bind(telegram_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(student_from_row))
}

#[instrument(skip_all)]
pub async fn find_enrollment(
    pool: &Pool,
    student_id: i64,
    course_id: &str,
) -> Result<Option<Enrollment>> {
    let row = sqlx::query(
        "SELECT course_id, approval_status, payment_method, payment_receipt, created_at, updated_at \
         FROM enrollments WHERE student_id = ? AND course_id = ?",
    )
    .bind(student_id)
    .bind(course_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(enrollment_from_row).transpose()
}

async fn save_enrollment_tx(
    tx: &mut Transaction<'_, Sqlite>,
    student_id: i64,
    record: &Enrollment,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO enrollments (student_id, course_id, approval_status, payment_method, payment_receipt, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(student_id, course_id) DO UPDATE SET \
            approval_status = excluded.approval_status, payment_method = excluded.payment_method, \
            payment_receipt = excluded.payment_receipt, updated_at = excluded.updated_at",
    )
    .bind(student_id)
    .bind(&record.course_id)
    .bind(record.approval_status.as_str())
    .bind(record.payment_method.as_str())
    .bind(record.payment_receipt.as_deref())
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Upsert by `(student_id, course_id)`. An existing pair is overwritten in place;
/// its original `created_at` survives.
#[instrument(skip_all)]
pub async fn save_enrollment(pool: &Pool, student_id: i64, record: &Enrollment) -> Result<()> {
    let mut tx = pool.begin().await?;
    ensure_student_tx(&mut tx, student_id).await?;
    save_enrollment_tx(&mut tx, student_id, record).await?;
    tx.commit().await.context("failed to persist enrollment")?;
    Ok(())
}

async fn append_notification_tx(
    tx: &mut Transaction<'_, Sqlite>,
    student_id: i64,
    kind: NotificationKind,
    message: &str,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO notifications (student_id, kind, message, created_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(student_id)
    .bind(kind.as_str())
    .bind(message)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn append_notification(
    pool: &Pool,
    student_id: i64,
    kind: NotificationKind,
    message: &str,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = append_notification_tx(&mut tx, student_id, kind, message).await?;
    tx.commit().await?;
    Ok(id)
}

/// Put `(student_id, course_id)` back to `pending` with the given proof and log it,
/// in one transaction. Returns the stored record.
#[instrument(skip_all, fields(student_id = student_id, course_id = %course_id))]
pub async fn record_submission(
    pool: &Pool,
    student_id: i64,
    course_id: &str,
    payment_method: PaymentMethod,
    payment_receipt: Option<&str>,
    log_message: &str,
) -> Result<Enrollment> {
    let now = Utc::now();
    let record = Enrollment {
        course_id: course_id.to_string(),
        approval_status: ApprovalStatus::Pending,
        payment_method,
        payment_receipt: payment_receipt.map(str::to_string),
        created_at: now,
        updated_at: now,
    };

    let mut tx = pool.begin().await?;
    ensure_student_tx(&mut tx, student_id).await?;
    save_enrollment_tx(&mut tx, student_id, &record).await?;
    append_notification_tx(&mut tx, student_id, NotificationKind::Submitted, log_message).await?;
    let row = sqlx::query(
        "SELECT course_id, approval_status, payment_method, payment_receipt, created_at, updated_at \
         FROM enrollments WHERE student_id = ? AND course_id = ?",
    )
    .bind(student_id)
    .bind(course_id)
    .fetch_one(&mut *tx)
    .await?;
    let stored = enrollment_from_row(&row)?;
    tx.commit().await.context("failed to persist submission")?;
    Ok(stored)
}

/// Set the status of an existing enrollment and append the audit entry, in one
/// transaction. Returns `false` (and writes nothing) when the pair does not exist.
#[instrument(skip_all, fields(student_id = student_id, course_id = %course_id))]
pub async fn record_decision(
    pool: &Pool,
    student_id: i64,
    course_id: &str,
    status: ApprovalStatus,
    kind: NotificationKind,
    log_message: &str,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        "UPDATE enrollments SET approval_status = ?, updated_at = ? WHERE student_id = ? AND course_id = ?",
    )
    .bind(status.as_str())
    .bind(Utc::now())
    .bind(student_id)
    .bind(course_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        tx.rollback().await?;
        return Ok(false);
    }
    append_notification_tx(&mut tx, student_id, kind, log_message).await?;
    tx.commit().await.context("failed to persist decision")?;
    Ok(true)
}

/// Every registered student, oldest registration first.
#[instrument(skip_all)]
pub async fn list_students(pool: &Pool) -> Result<Vec<Student>> {
    let rows = sqlx::query(
        "SELECT telegram_id, full_name, phone, email, study_year, specialization, registered_at, last_active \
         FROM students ORDER BY registered_at ASC, telegram_id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(student_from_row).collect())
}

#[instrument(skip_all)]
pub async fn list_enrollments(pool: &Pool, student_id: i64) -> Result<Vec<Enrollment>> {
    let rows = sqlx::query(
        "SELECT course_id, approval_status, payment_method, payment_receipt, created_at, updated_at \
         FROM enrollments WHERE student_id = ? ORDER BY id ASC",
    )
    .bind(student_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(enrollment_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_pending(pool: &Pool) -> Result<Vec<PendingRequest>> {
    let rows = sqlx::query(
        "SELECT e.student_id, s.full_name, e.course_id, e.payment_method, e.payment_receipt, e.updated_at \
         FROM enrollments e JOIN students s ON s.telegram_id = e.student_id \
         WHERE e.approval_status = 'pending' \
         ORDER BY e.updated_at ASC, e.id ASC",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let student_id: i64 = row.get("student_id");
            let full_name: String = row.get("full_name");
            let method: String = row.get("payment_method");
            let created_at: DateTime<Utc> = row.get("updated_at");
            Ok(PendingRequest {
                student_id,
                student_name: if full_name.trim().is_empty() {
                    student_id.to_string()
                } else {
                    full_name
                },
                course_id: row.get("course_id"),
                payment_method: parse_method(&method)?,
                payment_receipt: row.get("payment_receipt"),
                created_at,
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn list_notifications(pool: &Pool, student_id: i64) -> Result<Vec<NotificationEntry>> {
    let rows = sqlx::query(
        "SELECT id, student_id, kind, message, created_at FROM notifications WHERE student_id = ? ORDER BY id ASC",
    )
    .bind(student_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let kind: String = row.get("kind");
            Ok(NotificationEntry {
                id: row.get("id"),
                student_id: row.get("student_id"),
                kind: NotificationKind::parse_kind(&kind)
                    .ok_or_else(|| anyhow!("unknown notification kind {}", kind))?,
                message: row.get("message"),
                created_at: row.get("created_at"),
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn status_counts(pool: &Pool) -> Result<StatusCounts> {
    let students: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM students")
        .fetch_one(pool)
        .await?;
    let rows = sqlx::query(
        "SELECT approval_status, COUNT(*) AS cnt FROM enrollments GROUP BY approval_status",
    )
    .fetch_all(pool)
    .await?;

    let mut counts = StatusCounts {
        students,
        ..StatusCounts::default()
    };
    for row in rows {
        let status: String = row.get("approval_status");
        let cnt: i64 = row.get("cnt");
        match parse_status(&status)? {
            ApprovalStatus::Pending => counts.pending = cnt,
            ApprovalStatus::Approved => counts.approved = cnt,
            ApprovalStatus::Rejected => counts.rejected = cnt,
        }
    }
    Ok(counts)
}
