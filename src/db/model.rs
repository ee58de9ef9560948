//! View models used by listing repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::PaymentMethod;

/// One row of the admin review queue.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    pub student_id: i64,
    pub student_name: String,
    pub course_id: String,
    pub payment_method: PaymentMethod,
    pub payment_receipt: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Totals shown on the admin stats screen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub students: i64,
    pub pending: i64,
    pub approved: i64,
    pub rejected: i64,
}
