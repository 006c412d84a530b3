use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::NaiveDate;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{CounterFailure, StudentCounters};
use crate::store::{AttendanceStore, RosterStore};

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub added: Vec<Uuid>,
    pub removed: Vec<Uuid>,
    pub unchanged: usize,
    pub failures: Vec<CounterFailure>,
}

impl ReconcileOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassDeletionOutcome {
    pub logs_deleted: u64,
    pub students_adjusted: usize,
    pub failures: Vec<CounterFailure>,
}

type SessionKey = (Uuid, Uuid, NaiveDate);

/// One async mutex per (tenant, class, date), created on demand.
///
/// Only serializes callers sharing one `Synchronizer`. Across processes the
/// log's unique key decides which call owns a row change, and the store
/// applies the matching counter adjustment.
#[derive(Default)]
struct SessionLocks {
    inner: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, key: SessionKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries nobody holds or waits on only have the map's reference.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

fn collect_failure(failures: &mut Vec<CounterFailure>, student_id: Uuid, err: Error) {
    failures.push(CounterFailure {
        student_id,
        reason: err.to_string(),
    });
}

pub struct Synchronizer<S> {
    store: Arc<S>,
    locks: SessionLocks,
}

impl<S: AttendanceStore> Synchronizer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            locks: SessionLocks::default(),
        }
    }

    /// Makes the attendance log and student counters for one class session
    /// match `desired_present`.
    ///
    /// Counters only move for log rows this call actually removed or
    /// inserted, so a concurrent reconcile of the same session cannot count
    /// a student twice. Counter failures never abort the call; each failing
    /// student is reported in [`ReconcileOutcome::failures`]. If the insert
    /// fails after removals were committed, the removed students' counters
    /// are still rolled back and [`Error::PartialLogWrite`] names them.
    pub async fn reconcile(
        &self,
        tenant_id: Uuid,
        class_id: Uuid,
        date: NaiveDate,
        desired_present: &[Uuid],
    ) -> Result<ReconcileOutcome> {
        let _guard = self.locks.acquire((tenant_id, class_id, date)).await;

        let existing: BTreeSet<Uuid> = self
            .store
            .find_attendance_logs(tenant_id, class_id, date)
            .await?
            .into_iter()
            .collect();
        let desired: BTreeSet<Uuid> = desired_present.iter().copied().collect();

        let to_add: Vec<Uuid> = desired.difference(&existing).copied().collect();
        let to_remove: Vec<Uuid> = existing.difference(&desired).copied().collect();
        let unchanged = desired.intersection(&existing).count();

        debug!(
            %class_id, %date,
            add = to_add.len(),
            remove = to_remove.len(),
            unchanged,
            "attendance diff"
        );

        let removed = if to_remove.is_empty() {
            Vec::new()
        } else {
            self.store
                .delete_attendance_logs(tenant_id, class_id, date, &to_remove)
                .await?
        };

        let mut failures = Vec::new();

        for &student_id in &removed {
            if let Err(err) = self.store.record_attendance_removed(tenant_id, student_id, date).await {
                warn!(%student_id, %class_id, %date, "failed to decrement counters: {err}");
                collect_failure(&mut failures, student_id, err);
            }
        }

        let added = if to_add.is_empty() {
            Vec::new()
        } else {
            match self
                .store
                .insert_attendance_logs(tenant_id, class_id, date, &to_add)
                .await
            {
                Ok(added) => added,
                Err(err) if removed.is_empty() => return Err(err),
                Err(err) => {
                    warn!(%class_id, %date, removed = removed.len(), "attendance insert failed after removals: {err}");
                    return Err(Error::PartialLogWrite {
                        source: Box::new(err),
                        removed,
                        failures,
                    });
                }
            }
        };

        for &student_id in &added {
            if let Err(err) = self.store.record_attendance_added(tenant_id, student_id, date).await {
                warn!(%student_id, %class_id, %date, "failed to increment counters: {err}");
                collect_failure(&mut failures, student_id, err);
            }
        }

        info!(
            %class_id, %date,
            added = added.len(),
            removed = removed.len(),
            failures = failures.len(),
            "attendance reconciled"
        );

        Ok(ReconcileOutcome {
            added,
            removed,
            unchanged,
            failures,
        })
    }

    /// Removes a class, its attendance log rows, and the classes it
    /// contributed to each student's counter.
    ///
    /// `last_attendance` is left as is for affected students.
    pub async fn delete_class(&self, tenant_id: Uuid, class_id: Uuid) -> Result<ClassDeletionOutcome> {
        let tally = self.store.tally_class_attendance(tenant_id, class_id).await?;
        let mut failures = Vec::new();
        let mut students_adjusted = 0;

        for &(student_id, count) in &tally {
            match self.store.record_class_removed(tenant_id, student_id, count).await {
                Ok(()) => students_adjusted += 1,
                Err(err) => {
                    warn!(%student_id, %class_id, "failed to adjust counters for deleted class: {err}");
                    collect_failure(&mut failures, student_id, err);
                }
            }
        }

        let logs_deleted = self
            .store
            .delete_class_attendance_logs(tenant_id, class_id)
            .await?;

        if !self.store.delete_class(tenant_id, class_id).await? {
            warn!(%class_id, "class row was already gone");
        }

        info!(%class_id, logs_deleted, students_adjusted, "class deleted");

        Ok(ClassDeletionOutcome {
            logs_deleted,
            students_adjusted,
            failures,
        })
    }
}

impl<S: AttendanceStore + RosterStore> Synchronizer<S> {
    /// Rebuilds a student's counters from the attendance log.
    ///
    /// Only classes after the most recent promotion count toward the total.
    pub async fn recompute_counters(&self, tenant_id: Uuid, student_id: Uuid) -> Result<StudentCounters> {
        let promoted_on = self.store.latest_promotion_date(tenant_id, student_id).await?;
        let count = self
            .store
            .count_attendance_logs_after(tenant_id, student_id, promoted_on)
            .await?;
        let counters = StudentCounters {
            total_classes_attended: i32::try_from(count).unwrap_or(i32::MAX),
            last_attendance: self.store.latest_attendance_log(tenant_id, student_id).await?,
        };

        let previous = self.store.get_student_counters(tenant_id, student_id).await?;
        if previous != counters {
            info!(
                %student_id,
                from = previous.total_classes_attended,
                to = counters.total_classes_attended,
                "repaired drifted counters"
            );
            self.store
                .set_student_counters(tenant_id, student_id, counters)
                .await?;
        }

        Ok(counters)
    }
}
