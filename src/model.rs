use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Approval lifecycle of one enrollment. The lowercase literals are the
/// persisted vocabulary and are read directly by both front-ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    pub fn parse_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }
}

/// The two payment channels a student can pay through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Sham,
    Haram,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Sham => "sham",
            PaymentMethod::Haram => "haram",
        }
    }

    pub fn parse_method(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sham" => Some(PaymentMethod::Sham),
            "haram" => Some(PaymentMethod::Haram),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn resulting_status(&self) -> ApprovalStatus {
        match self {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
        }
    }
}

/// Kind tag of an audit-log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Submitted,
    Approved,
    Rejected,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Submitted => "submitted",
            NotificationKind::Approved => "approved",
            NotificationKind::Rejected => "rejected",
        }
    }

    pub fn parse_kind(value: &str) -> Option<Self> {
        match value {
            "submitted" => Some(NotificationKind::Submitted),
            "approved" => Some(NotificationKind::Approved),
            "rejected" => Some(NotificationKind::Rejected),
            _ => None,
        }
    }
}

impl From<Decision> for NotificationKind {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Approve => NotificationKind::Approved,
            Decision::Reject => NotificationKind::Rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub telegram_id: i64,
    pub full_name: String,
    pub phone: String,
    pub email: String,
    pub study_year: Option<i64>,
    pub specialization: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Student {
    /// Name to show in admin-facing text; falls back to the numeric id.
    pub fn display_name(&self) -> String {
        let name = self.full_name.trim();
        if name.is_empty() {
            self.telegram_id.to_string()
        } else {
            name.to_string()
        }
    }
}

/// One course a student has engaged with. Unique per `(student, course_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Enrollment {
    pub course_id: String,
    pub approval_status: ApprovalStatus,
    pub payment_method: PaymentMethod,
    pub payment_receipt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEntry {
    pub id: i64,
    pub student_id: i64,
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
