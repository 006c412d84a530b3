use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct BeltDefinition {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub position: i32,
    pub color: String,
    pub secondary_color: Option<String>,
    pub special: Option<String>,
    pub classes_req_total: i32,
    pub classes_per_stripe: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Paid,
    Pending,
    Overdue,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Paid => "paid",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Overdue => "overdue",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "paid" => Ok(PaymentStatus::Paid),
            "" | "pending" => Ok(PaymentStatus::Pending),
            "overdue" => Ok(PaymentStatus::Overdue),
            other => Err(Error::InvalidInput(format!("unknown payment status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Student {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub belt_id: Option<Uuid>,
    pub stripes: i32,
    pub total_classes_attended: i32,
    pub last_attendance: Option<NaiveDate>,
    pub active: bool,
    pub is_instructor: bool,
    pub payment_status: PaymentStatus,
}

/// The derived attendance state the synchronizer reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StudentCounters {
    pub total_classes_attended: i32,
    pub last_attendance: Option<NaiveDate>,
}

/// A counter update that did not land after the attendance log changed.
#[derive(Debug, Clone)]
pub struct CounterFailure {
    pub student_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ClassSession {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub title: String,
    pub weekday: i16,
    pub start_time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Belt,
    Stripe,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::Belt => "belt",
            HistoryKind::Stripe => "stripe",
        }
    }
}

impl FromStr for HistoryKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "belt" => Ok(HistoryKind::Belt),
            "stripe" => Ok(HistoryKind::Stripe),
            other => Err(Error::InvalidInput(format!("unknown history kind '{other}'"))),
        }
    }
}

impl fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StudentHistoryRecord {
    pub student_id: Uuid,
    pub kind: HistoryKind,
    pub item: String,
    pub date: NaiveDate,
}

/// New counters and ladder position written together with a history record.
#[derive(Debug, Clone)]
pub struct PromotionUpdate {
    pub belt_id: Uuid,
    pub stripes: i32,
    pub total_classes_attended: i32,
    pub record: StudentHistoryRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressionSummary {
    pub display_goal: i32,
    pub current_progress: i32,
    pub remaining_for_stripe: i32,
    pub remaining_for_graduation: i32,
    pub classes_req_total: i32,
    pub virtual_total_classes: i32,
    pub progress_percent: f64,
    pub ready_for_belt: bool,
}

#[derive(Debug, Clone)]
pub struct BeltCount {
    pub belt_name: String,
    pub count: usize,
}
