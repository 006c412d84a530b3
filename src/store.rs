//! Persistence seams for the synchronizer and promotion code.
//!
//! Every call carries the tenant (academy) id explicitly; implementations
//! must never read or write rows belonging to another tenant.

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{BeltDefinition, PromotionUpdate, Student, StudentCounters, StudentHistoryRecord};

#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn find_attendance_logs(&self, tenant_id: Uuid, class_id: Uuid, date: NaiveDate) -> Result<Vec<Uuid>>;

    /// Inserts log rows and returns the students whose row is new.
    ///
    /// Fails without inserting anything when the class or any student is not
    /// owned by the tenant.
    async fn insert_attendance_logs(
        &self,
        tenant_id: Uuid,
        class_id: Uuid,
        date: NaiveDate,
        student_ids: &[Uuid],
    ) -> Result<Vec<Uuid>>;

    /// Deletes log rows and returns the students whose row was removed.
    async fn delete_attendance_logs(
        &self,
        tenant_id: Uuid,
        class_id: Uuid,
        date: NaiveDate,
        student_ids: &[Uuid],
    ) -> Result<Vec<Uuid>>;

    /// Most recent log date strictly before `date`.
    async fn find_attendance_log_before(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<NaiveDate>>;

    async fn count_attendance_logs_on(&self, tenant_id: Uuid, student_id: Uuid, date: NaiveDate) -> Result<i64>;

    async fn get_student_counters(&self, tenant_id: Uuid, student_id: Uuid) -> Result<StudentCounters>;

    async fn set_student_counters(&self, tenant_id: Uuid, student_id: Uuid, counters: StudentCounters) -> Result<()>;

    async fn get_belt_definitions(&self, tenant_id: Uuid) -> Result<Vec<BeltDefinition>>;

    /// Number of log rows per student referencing the class.
    async fn tally_class_attendance(&self, tenant_id: Uuid, class_id: Uuid) -> Result<Vec<(Uuid, i64)>>;

    async fn delete_class_attendance_logs(&self, tenant_id: Uuid, class_id: Uuid) -> Result<u64>;

    /// Returns false when no such class exists for the tenant.
    async fn delete_class(&self, tenant_id: Uuid, class_id: Uuid) -> Result<bool>;

    async fn latest_attendance_log(&self, tenant_id: Uuid, student_id: Uuid) -> Result<Option<NaiveDate>>;

    /// Log rows dated strictly after `after`, or all rows when `after` is None.
    async fn count_attendance_logs_after(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
        after: Option<NaiveDate>,
    ) -> Result<i64>;

    // The three counter adjustments below default to read-then-write over the
    // primitives above. Stores shared between processes override them with a
    // single atomic statement that applies the same rule.

    /// Counts one class fewer after the student's log row on `date` was
    /// removed. `last_attendance` falls back to the latest earlier log when
    /// no other row on `date` survives.
    async fn record_attendance_removed(&self, tenant_id: Uuid, student_id: Uuid, date: NaiveDate) -> Result<()> {
        let counters = self.get_student_counters(tenant_id, student_id).await?;
        let total_classes_attended = counters.total_classes_attended.saturating_sub(1).max(0);

        let last_attendance = if counters.last_attendance == Some(date) {
            // Another class on the same day keeps the date alive.
            if self.count_attendance_logs_on(tenant_id, student_id, date).await? > 0 {
                Some(date)
            } else {
                self.find_attendance_log_before(tenant_id, student_id, date).await?
            }
        } else {
            counters.last_attendance
        };

        self.set_student_counters(
            tenant_id,
            student_id,
            StudentCounters {
                total_classes_attended,
                last_attendance,
            },
        )
        .await
    }

    /// Counts one class more. Backfilling an older session never moves
    /// `last_attendance` backwards.
    async fn record_attendance_added(&self, tenant_id: Uuid, student_id: Uuid, date: NaiveDate) -> Result<()> {
        let counters = self.get_student_counters(tenant_id, student_id).await?;
        let last_attendance = match counters.last_attendance {
            Some(last) if date < last => Some(last),
            _ => Some(date),
        };

        self.set_student_counters(
            tenant_id,
            student_id,
            StudentCounters {
                total_classes_attended: counters.total_classes_attended.saturating_add(1),
                last_attendance,
            },
        )
        .await
    }

    /// Takes `count` classes off the counter, floored at zero, leaving
    /// `last_attendance` as is.
    async fn record_class_removed(&self, tenant_id: Uuid, student_id: Uuid, count: i64) -> Result<()> {
        let counters = self.get_student_counters(tenant_id, student_id).await?;
        let count = i32::try_from(count).unwrap_or(i32::MAX);

        self.set_student_counters(
            tenant_id,
            student_id,
            StudentCounters {
                total_classes_attended: counters.total_classes_attended.saturating_sub(count).max(0),
                last_attendance: counters.last_attendance,
            },
        )
        .await
    }
}

#[async_trait]
pub trait RosterStore: Send + Sync {
    async fn list_students(&self, tenant_id: Uuid) -> Result<Vec<Student>>;

    async fn get_student(&self, tenant_id: Uuid, student_id: Uuid) -> Result<Student>;

    async fn latest_promotion_date(&self, tenant_id: Uuid, student_id: Uuid) -> Result<Option<NaiveDate>>;

    /// Writes the new ladder position and appends the history record together.
    async fn apply_promotion(&self, tenant_id: Uuid, student_id: Uuid, update: &PromotionUpdate) -> Result<()>;

    async fn student_history(&self, tenant_id: Uuid, student_id: Uuid) -> Result<Vec<StudentHistoryRecord>>;
}
