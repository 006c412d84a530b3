//! In-process store backing the synchronizer and promotion tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    BeltDefinition, PaymentStatus, PromotionUpdate, Student, StudentCounters, StudentHistoryRecord,
};
use crate::progression;
use crate::store::{AttendanceStore, RosterStore};

// (tenant, class, date, student)
type LogKey = (Uuid, Uuid, NaiveDate, Uuid);

#[derive(Default)]
struct State {
    belts: Vec<BeltDefinition>,
    students: HashMap<Uuid, Student>,
    classes: HashSet<(Uuid, Uuid)>,
    logs: BTreeSet<LogKey>,
    history: Vec<(Uuid, StudentHistoryRecord)>,
    failing: HashSet<Uuid>,
    fail_log_inserts: bool,
    yield_on_log_reads: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn seed_default_belts(&self, tenant_id: Uuid) {
        self.with_state(|s| s.belts.extend(progression::default_ladder(tenant_id)));
    }

    pub fn add_class(&self, tenant_id: Uuid, _title: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.with_state(|s| s.classes.insert((tenant_id, id)));
        id
    }

    pub fn has_class(&self, tenant_id: Uuid, class_id: Uuid) -> bool {
        self.with_state(|s| s.classes.contains(&(tenant_id, class_id)))
    }

    pub fn add_student(&self, tenant_id: Uuid, name: &str, total: i32, last: Option<NaiveDate>) -> Uuid {
        let id = Uuid::new_v4();
        self.with_state(|s| {
            let belt_id = s
                .belts
                .iter()
                .filter(|b| b.tenant_id == tenant_id)
                .min_by_key(|b| b.position)
                .map(|b| b.id);
            s.students.insert(
                id,
                Student {
                    id,
                    tenant_id,
                    name: name.to_string(),
                    belt_id,
                    stripes: 0,
                    total_classes_attended: total,
                    last_attendance: last,
                    active: true,
                    is_instructor: false,
                    payment_status: PaymentStatus::Paid,
                },
            );
        });
        id
    }

    pub fn set_stripes(&self, student_id: Uuid, stripes: i32) {
        self.with_state(|s| {
            if let Some(student) = s.students.get_mut(&student_id) {
                student.stripes = stripes;
            }
        });
    }

    pub fn insert_log(&self, tenant_id: Uuid, class_id: Uuid, date: NaiveDate, student_id: Uuid) {
        self.with_state(|s| s.logs.insert((tenant_id, class_id, date, student_id)));
    }

    pub fn log_count(&self, tenant_id: Uuid) -> usize {
        self.with_state(|s| s.logs.iter().filter(|k| k.0 == tenant_id).count())
    }

    pub fn fail_counter_updates_for(&self, student_id: Uuid) {
        self.with_state(|s| s.failing.insert(student_id));
    }

    pub fn fail_log_inserts(&self) {
        self.with_state(|s| s.fail_log_inserts = true);
    }

    /// Makes every session read hand control back to the scheduler, so
    /// concurrent callers interleave between reading and writing the log.
    pub fn yield_on_log_reads(&self) {
        self.with_state(|s| s.yield_on_log_reads = true);
    }

    fn owns_student(state: &State, tenant_id: Uuid, student_id: Uuid) -> bool {
        state
            .students
            .get(&student_id)
            .is_some_and(|st| st.tenant_id == tenant_id)
    }

    fn student_logs(state: &State, tenant_id: Uuid, student_id: Uuid) -> impl Iterator<Item = &LogKey> {
        state
            .logs
            .iter()
            .filter(move |k| k.0 == tenant_id && k.3 == student_id)
    }
}

fn missing_student(student_id: Uuid) -> Error {
    Error::NotFound(format!("student {student_id}"))
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn find_attendance_logs(&self, tenant_id: Uuid, class_id: Uuid, date: NaiveDate) -> Result<Vec<Uuid>> {
        if self.with_state(|s| s.yield_on_log_reads) {
            tokio::task::yield_now().await;
        }
        Ok(self.with_state(|s| {
            s.logs
                .iter()
                .filter(|k| k.0 == tenant_id && k.1 == class_id && k.2 == date)
                .map(|k| k.3)
                .collect()
        }))
    }

    async fn insert_attendance_logs(
        &self,
        tenant_id: Uuid,
        class_id: Uuid,
        date: NaiveDate,
        student_ids: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        self.with_state(|s| {
            if s.fail_log_inserts {
                return Err(Error::InvalidInput("simulated log insert failure".to_string()));
            }
            if !s.classes.contains(&(tenant_id, class_id)) {
                return Err(Error::NotFound(format!("class {class_id}")));
            }
            if let Some(&unknown) = student_ids.iter().find(|&&id| !Self::owns_student(s, tenant_id, id)) {
                return Err(missing_student(unknown));
            }
            Ok(student_ids
                .iter()
                .copied()
                .filter(|&student_id| s.logs.insert((tenant_id, class_id, date, student_id)))
                .collect())
        })
    }

    async fn delete_attendance_logs(
        &self,
        tenant_id: Uuid,
        class_id: Uuid,
        date: NaiveDate,
        student_ids: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        Ok(self.with_state(|s| {
            student_ids
                .iter()
                .copied()
                .filter(|&student_id| s.logs.remove(&(tenant_id, class_id, date, student_id)))
                .collect()
        }))
    }

    async fn find_attendance_log_before(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<NaiveDate>> {
        Ok(self.with_state(|s| {
            Self::student_logs(s, tenant_id, student_id)
                .map(|k| k.2)
                .filter(|d| *d < date)
                .max()
        }))
    }

    async fn count_attendance_logs_on(&self, tenant_id: Uuid, student_id: Uuid, date: NaiveDate) -> Result<i64> {
        Ok(self.with_state(|s| {
            Self::student_logs(s, tenant_id, student_id)
                .filter(|k| k.2 == date)
                .count() as i64
        }))
    }

    async fn get_student_counters(&self, tenant_id: Uuid, student_id: Uuid) -> Result<StudentCounters> {
        self.with_state(|s| {
            s.students
                .get(&student_id)
                .filter(|st| st.tenant_id == tenant_id)
                .map(|st| StudentCounters {
                    total_classes_attended: st.total_classes_attended,
                    last_attendance: st.last_attendance,
                })
                .ok_or_else(|| missing_student(student_id))
        })
    }

    async fn set_student_counters(&self, tenant_id: Uuid, student_id: Uuid, counters: StudentCounters) -> Result<()> {
        self.with_state(|s| {
            if s.failing.contains(&student_id) {
                return Err(Error::InvalidInput("simulated write failure".to_string()));
            }
            let student = s
                .students
                .get_mut(&student_id)
                .filter(|st| st.tenant_id == tenant_id)
                .ok_or_else(|| missing_student(student_id))?;
            student.total_classes_attended = counters.total_classes_attended;
            student.last_attendance = counters.last_attendance;
            Ok(())
        })
    }

    async fn get_belt_definitions(&self, tenant_id: Uuid) -> Result<Vec<BeltDefinition>> {
        Ok(self.with_state(|s| {
            let mut belts: Vec<BeltDefinition> =
                s.belts.iter().filter(|b| b.tenant_id == tenant_id).cloned().collect();
            belts.sort_by_key(|b| b.position);
            belts
        }))
    }

    async fn tally_class_attendance(&self, tenant_id: Uuid, class_id: Uuid) -> Result<Vec<(Uuid, i64)>> {
        Ok(self.with_state(|s| {
            let mut tally: HashMap<Uuid, i64> = HashMap::new();
            for key in s.logs.iter().filter(|k| k.0 == tenant_id && k.1 == class_id) {
                *tally.entry(key.3).or_insert(0) += 1;
            }
            tally.into_iter().collect()
        }))
    }

    async fn delete_class_attendance_logs(&self, tenant_id: Uuid, class_id: Uuid) -> Result<u64> {
        Ok(self.with_state(|s| {
            let before = s.logs.len();
            s.logs.retain(|k| !(k.0 == tenant_id && k.1 == class_id));
            (before - s.logs.len()) as u64
        }))
    }

    async fn delete_class(&self, tenant_id: Uuid, class_id: Uuid) -> Result<bool> {
        Ok(self.with_state(|s| s.classes.remove(&(tenant_id, class_id))))
    }

    async fn latest_attendance_log(&self, tenant_id: Uuid, student_id: Uuid) -> Result<Option<NaiveDate>> {
        Ok(self.with_state(|s| Self::student_logs(s, tenant_id, student_id).map(|k| k.2).max()))
    }

    async fn count_attendance_logs_after(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
        after: Option<NaiveDate>,
    ) -> Result<i64> {
        Ok(self.with_state(|s| {
            Self::student_logs(s, tenant_id, student_id)
                .filter(|k| after.map_or(true, |cutoff| k.2 > cutoff))
                .count() as i64
        }))
    }
}

#[async_trait]
impl RosterStore for MemoryStore {
    async fn list_students(&self, tenant_id: Uuid) -> Result<Vec<Student>> {
        Ok(self.with_state(|s| {
            let mut students: Vec<Student> = s
                .students
                .values()
                .filter(|st| st.tenant_id == tenant_id)
                .cloned()
                .collect();
            students.sort_by(|a, b| a.name.cmp(&b.name));
            students
        }))
    }

    async fn get_student(&self, tenant_id: Uuid, student_id: Uuid) -> Result<Student> {
        self.with_state(|s| {
            s.students
                .get(&student_id)
                .filter(|st| st.tenant_id == tenant_id)
                .cloned()
                .ok_or_else(|| missing_student(student_id))
        })
    }

    async fn latest_promotion_date(&self, tenant_id: Uuid, student_id: Uuid) -> Result<Option<NaiveDate>> {
        Ok(self.with_state(|s| {
            s.history
                .iter()
                .filter(|(tenant, record)| *tenant == tenant_id && record.student_id == student_id)
                .map(|(_, record)| record.date)
                .max()
        }))
    }

    async fn apply_promotion(&self, tenant_id: Uuid, student_id: Uuid, update: &PromotionUpdate) -> Result<()> {
        self.with_state(|s| {
            if !Self::owns_student(s, tenant_id, student_id) {
                return Err(missing_student(student_id));
            }
            if !s.belts.iter().any(|b| b.id == update.belt_id && b.tenant_id == tenant_id) {
                return Err(Error::NotFound(format!("belt {}", update.belt_id)));
            }
            let student = s
                .students
                .get_mut(&student_id)
                .ok_or_else(|| missing_student(student_id))?;
            student.belt_id = Some(update.belt_id);
            student.stripes = update.stripes;
            student.total_classes_attended = update.total_classes_attended;
            s.history.push((tenant_id, update.record.clone()));
            Ok(())
        })
    }

    async fn student_history(&self, tenant_id: Uuid, student_id: Uuid) -> Result<Vec<StudentHistoryRecord>> {
        Ok(self.with_state(|s| {
            s.history
                .iter()
                .filter(|(tenant, record)| *tenant == tenant_id && record.student_id == student_id)
                .map(|(_, record)| record.clone())
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HistoryKind;

    #[tokio::test]
    async fn promotion_to_another_tenants_belt_is_rejected() {
        let store = MemoryStore::default();
        let (tenant, other_tenant) = (Uuid::new_v4(), Uuid::new_v4());
        store.seed_default_belts(tenant);
        store.seed_default_belts(other_tenant);
        let ana = store.add_student(tenant, "Ana Lima", 12, None);
        let foreign_belt = store.get_belt_definitions(other_tenant).await.unwrap()[1].id;
        let date = NaiveDate::from_ymd_opt(2024, 9, 2).unwrap();

        let err = store
            .apply_promotion(
                tenant,
                ana,
                &PromotionUpdate {
                    belt_id: foreign_belt,
                    stripes: 0,
                    total_classes_attended: 0,
                    record: StudentHistoryRecord {
                        student_id: ana,
                        kind: HistoryKind::Belt,
                        item: "Faixa Azul".to_string(),
                        date,
                    },
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{err}");

        let student = store.get_student(tenant, ana).await.unwrap();
        assert_ne!(student.belt_id, Some(foreign_belt));
        assert_eq!(student.total_classes_attended, 12);
        assert!(store.student_history(tenant, ana).await.unwrap().is_empty());
    }
}
