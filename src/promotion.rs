use chrono::NaiveDate;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{HistoryKind, PromotionUpdate, Student, StudentHistoryRecord};
use crate::progression::{self, MAX_STRIPES};
use crate::store::{AttendanceStore, RosterStore};

#[derive(Debug, Clone)]
pub struct PromotionResult {
    pub student: Student,
    pub record: StudentHistoryRecord,
    pub was_eligible: bool,
}

pub fn stripe_label(belt_name: &str, stripe: i32) -> String {
    format!("{belt_name} - {stripe}º Grau")
}

/// Awards the next stripe on the student's current belt and restarts the
/// class counter.
pub async fn promote_stripe<S>(store: &S, tenant_id: Uuid, student_id: Uuid, date: NaiveDate) -> Result<PromotionResult>
where
    S: AttendanceStore + RosterStore,
{
    let student = store.get_student(tenant_id, student_id).await?;
    let ladder = store.get_belt_definitions(tenant_id).await?;
    let belt = progression::resolve_belt(&ladder, student.belt_id);

    let stripes = student.stripes.clamp(0, MAX_STRIPES);
    if stripes >= MAX_STRIPES {
        return Err(Error::InvalidInput(format!(
            "{} already has {MAX_STRIPES} stripes on {}; promote the belt instead",
            student.name, belt.name
        )));
    }

    let was_eligible = progression::is_eligible(&belt, student.stripes, student.total_classes_attended);
    if !was_eligible {
        warn!(%student_id, "promoting stripe before the class requirement is met");
    }

    let record = StudentHistoryRecord {
        student_id,
        kind: HistoryKind::Stripe,
        item: stripe_label(&belt.name, stripes + 1),
        date,
    };
    let update = PromotionUpdate {
        belt_id: belt.id,
        stripes: stripes + 1,
        total_classes_attended: 0,
        record: record.clone(),
    };
    store.apply_promotion(tenant_id, student_id, &update).await?;
    info!(%student_id, item = %record.item, "stripe promotion recorded");

    Ok(PromotionResult {
        student: store.get_student(tenant_id, student_id).await?,
        record,
        was_eligible,
    })
}

/// Moves the student to the next belt on the ladder with no stripes and a
/// fresh class counter.
pub async fn promote_belt<S>(store: &S, tenant_id: Uuid, student_id: Uuid, date: NaiveDate) -> Result<PromotionResult>
where
    S: AttendanceStore + RosterStore,
{
    let student = store.get_student(tenant_id, student_id).await?;
    let ladder = store.get_belt_definitions(tenant_id).await?;
    let current = progression::resolve_belt(&ladder, student.belt_id);

    let next = progression::next_belt(&ladder, &current).ok_or_else(|| {
        Error::InvalidInput(format!("{} is not followed by another belt", current.name))
    })?;

    let was_eligible = progression::is_eligible(&current, student.stripes, student.total_classes_attended);
    if !was_eligible {
        warn!(%student_id, "promoting belt before the class requirement is met");
    }

    let record = StudentHistoryRecord {
        student_id,
        kind: HistoryKind::Belt,
        item: next.name.clone(),
        date,
    };
    let update = PromotionUpdate {
        belt_id: next.id,
        stripes: 0,
        total_classes_attended: 0,
        record: record.clone(),
    };
    store.apply_promotion(tenant_id, student_id, &update).await?;
    info!(%student_id, belt = %next.name, "belt promotion recorded");

    Ok(PromotionResult {
        student: store.get_student(tenant_id, student_id).await?,
        record,
        was_eligible,
    })
}
