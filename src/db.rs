use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    BeltDefinition, ClassSession, PromotionUpdate, Student, StudentCounters, StudentHistoryRecord,
};
use crate::progression::{self, MAX_STRIPES};
use crate::store::{AttendanceStore, RosterStore};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Inserts the default ladder for a tenant that has no belts yet.
pub async fn ensure_default_belts(pool: &PgPool, tenant_id: Uuid) -> Result<usize> {
    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM academy.belts WHERE tenant_id = $1")
        .bind(tenant_id)
        .fetch_one(pool)
        .await?;
    if existing > 0 {
        return Ok(0);
    }

    let ladder = progression::default_ladder(tenant_id);
    for belt in &ladder {
        sqlx::query(
            r#"
            INSERT INTO academy.belts
            (id, tenant_id, name, position, color, secondary_color, special,
             classes_req_total, classes_per_stripe)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, name) DO NOTHING
            "#,
        )
        .bind(belt.id)
        .bind(belt.tenant_id)
        .bind(&belt.name)
        .bind(belt.position)
        .bind(&belt.color)
        .bind(&belt.secondary_color)
        .bind(&belt.special)
        .bind(belt.classes_req_total)
        .bind(belt.classes_per_stripe)
        .execute(pool)
        .await?;
    }

    info!(%tenant_id, belts = ladder.len(), "seeded default belt ladder");
    Ok(ladder.len())
}

pub async fn seed(pool: &PgPool, tenant_id: Uuid) -> anyhow::Result<()> {
    ensure_default_belts(pool, tenant_id).await?;
    let belts = PgStore::new(pool.clone()).get_belt_definitions(tenant_id).await?;
    let belt_id = |name: &str| belts.iter().find(|b| b.name == name).map(|b| b.id);

    let students = vec![
        ("Lucas Ferreira", "Faixa Branca", 3, 18, false),
        ("Marina Alves", "Faixa Azul", 1, 12, false),
        ("Tiago Rocha", "Faixa Roxa", 4, 9, false),
        ("Helena Prado", "Faixa Preta", 2, 30, true),
    ];

    for (name, belt, stripes, total, is_instructor) in students {
        sqlx::query(
            r#"
            INSERT INTO academy.students
            (id, tenant_id, name, belt_id, stripes, total_classes_attended, is_instructor, payment_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'paid')
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(name)
        .bind(belt_id(belt))
        .bind(stripes)
        .bind(total)
        .bind(is_instructor)
        .execute(pool)
        .await?;
    }

    let classes = vec![
        ("Fundamentos", 1, "19:00"),
        ("Avançado", 3, "20:00"),
        ("Open Mat", 6, "10:00"),
    ];
    for (title, weekday, start_time) in classes {
        add_class(pool, tenant_id, title, weekday, start_time).await?;
    }

    Ok(())
}

pub async fn add_class(
    pool: &PgPool,
    tenant_id: Uuid,
    title: &str,
    weekday: i16,
    start_time: &str,
) -> Result<ClassSession> {
    if !(0..=6).contains(&weekday) {
        return Err(Error::InvalidInput(format!("weekday {weekday} is outside 0..=6")));
    }

    let class = ClassSession {
        id: Uuid::new_v4(),
        tenant_id,
        title: title.to_string(),
        weekday,
        start_time: start_time.to_string(),
    };

    sqlx::query(
        r#"
        INSERT INTO academy.classes (id, tenant_id, title, weekday, start_time)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(class.id)
    .bind(class.tenant_id)
    .bind(&class.title)
    .bind(class.weekday)
    .bind(&class.start_time)
    .execute(pool)
    .await?;

    Ok(class)
}

pub async fn import_roster_csv(pool: &PgPool, tenant_id: Uuid, csv_path: &std::path::Path) -> Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        name: String,
        belt: String,
        stripes: Option<i32>,
        total_classes_attended: Option<i32>,
        last_attendance: Option<NaiveDate>,
        is_instructor: Option<bool>,
        payment_status: Option<String>,
    }

    ensure_default_belts(pool, tenant_id).await?;
    let belts = PgStore::new(pool.clone()).get_belt_definitions(tenant_id).await?;

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result?;
        let belt = belts
            .iter()
            .find(|b| b.name == row.belt.trim())
            .ok_or_else(|| {
                Error::InvalidInput(format!("row {}: unknown belt '{}'", line + 1, row.belt))
            })?;

        let stripes = row.stripes.unwrap_or(0);
        let total = row.total_classes_attended.unwrap_or(0);
        if !(0..=MAX_STRIPES).contains(&stripes) || total < 0 {
            warn!(name = %row.name, stripes, total, "coercing out-of-range progression counters");
        }
        let payment_status: crate::models::PaymentStatus =
            row.payment_status.as_deref().unwrap_or("pending").parse()?;

        sqlx::query(
            r#"
            INSERT INTO academy.students
            (id, tenant_id, name, belt_id, stripes, total_classes_attended,
             last_attendance, is_instructor, payment_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(row.name.trim())
        .bind(belt.id)
        .bind(stripes.clamp(0, MAX_STRIPES))
        .bind(total.max(0))
        .bind(row.last_attendance)
        .bind(row.is_instructor.unwrap_or(false))
        .bind(payment_status.as_str())
        .execute(pool)
        .await?;

        inserted += 1;
    }

    Ok(inserted)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn student_from_row(row: &PgRow) -> Result<Student> {
    let payment_status: String = row.get("payment_status");
    Ok(Student {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        belt_id: row.get("belt_id"),
        stripes: row.get("stripes"),
        total_classes_attended: row.get("total_classes_attended"),
        last_attendance: row.get("last_attendance"),
        active: row.get("active"),
        is_instructor: row.get("is_instructor"),
        payment_status: payment_status.parse()?,
    })
}

const STUDENT_COLUMNS: &str = "id, tenant_id, name, belt_id, stripes, total_classes_attended, \
     last_attendance, active, is_instructor, payment_status";

#[async_trait]
impl AttendanceStore for PgStore {
    async fn find_attendance_logs(&self, tenant_id: Uuid, class_id: Uuid, date: NaiveDate) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT student_id FROM academy.attendance_logs
            WHERE tenant_id = $1 AND class_id = $2 AND attendance_date = $3
            "#,
        )
        .bind(tenant_id)
        .bind(class_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn insert_attendance_logs(
        &self,
        tenant_id: Uuid,
        class_id: Uuid,
        date: NaiveDate,
        student_ids: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let class_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM academy.classes WHERE tenant_id = $1 AND id = $2)",
        )
        .bind(tenant_id)
        .bind(class_id)
        .fetch_one(&mut *tx)
        .await?;
        if !class_exists {
            return Err(Error::NotFound(format!("class {class_id}")));
        }

        let owned: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM academy.students WHERE tenant_id = $1 AND id = ANY($2)",
        )
        .bind(tenant_id)
        .bind(student_ids)
        .fetch_all(&mut *tx)
        .await?;
        if let Some(unknown) = student_ids.iter().find(|id| !owned.contains(id)) {
            return Err(Error::NotFound(format!("student {unknown}")));
        }

        let inserted = sqlx::query_scalar(
            r#"
            INSERT INTO academy.attendance_logs (tenant_id, class_id, attendance_date, student_id)
            SELECT $1, $2, $3, student_id FROM UNNEST($4::uuid[]) AS student_id
            ON CONFLICT (class_id, attendance_date, student_id) DO NOTHING
            RETURNING student_id
            "#,
        )
        .bind(tenant_id)
        .bind(class_id)
        .bind(date)
        .bind(student_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn delete_attendance_logs(
        &self,
        tenant_id: Uuid,
        class_id: Uuid,
        date: NaiveDate,
        student_ids: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        let removed = sqlx::query_scalar(
            r#"
            DELETE FROM academy.attendance_logs
            WHERE tenant_id = $1 AND class_id = $2 AND attendance_date = $3
              AND student_id = ANY($4)
            RETURNING student_id
            "#,
        )
        .bind(tenant_id)
        .bind(class_id)
        .bind(date)
        .bind(student_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(removed)
    }

    async fn find_attendance_log_before(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<NaiveDate>> {
        let latest = sqlx::query_scalar(
            r#"
            SELECT MAX(attendance_date) FROM academy.attendance_logs
            WHERE tenant_id = $1 AND student_id = $2 AND attendance_date < $3
            "#,
        )
        .bind(tenant_id)
        .bind(student_id)
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn count_attendance_logs_on(&self, tenant_id: Uuid, student_id: Uuid, date: NaiveDate) -> Result<i64> {
        let count = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM academy.attendance_logs
            WHERE tenant_id = $1 AND student_id = $2 AND attendance_date = $3
            "#,
        )
        .bind(tenant_id)
        .bind(student_id)
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn get_student_counters(&self, tenant_id: Uuid, student_id: Uuid) -> Result<StudentCounters> {
        let row = sqlx::query(
            r#"
            SELECT total_classes_attended, last_attendance FROM academy.students
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("student {student_id}")))?;

        Ok(StudentCounters {
            total_classes_attended: row.get("total_classes_attended"),
            last_attendance: row.get("last_attendance"),
        })
    }

    async fn set_student_counters(&self, tenant_id: Uuid, student_id: Uuid, counters: StudentCounters) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE academy.students
            SET total_classes_attended = $3, last_attendance = $4
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(student_id)
        .bind(counters.total_classes_attended.max(0))
        .bind(counters.last_attendance)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("student {student_id}")));
        }
        Ok(())
    }

    async fn get_belt_definitions(&self, tenant_id: Uuid) -> Result<Vec<BeltDefinition>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, name, position, color, secondary_color, special,
                   classes_req_total, classes_per_stripe
            FROM academy.belts
            WHERE tenant_id = $1
            ORDER BY position
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut belts = Vec::new();
        for row in rows {
            belts.push(BeltDefinition {
                id: row.get("id"),
                tenant_id: row.get("tenant_id"),
                name: row.get("name"),
                position: row.get("position"),
                color: row.get("color"),
                secondary_color: row.get("secondary_color"),
                special: row.get("special"),
                classes_req_total: row.get("classes_req_total"),
                classes_per_stripe: row.get("classes_per_stripe"),
            });
        }

        Ok(belts)
    }

    async fn tally_class_attendance(&self, tenant_id: Uuid, class_id: Uuid) -> Result<Vec<(Uuid, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT student_id, COUNT(*) AS attended
            FROM academy.attendance_logs
            WHERE tenant_id = $1 AND class_id = $2
            GROUP BY student_id
            "#,
        )
        .bind(tenant_id)
        .bind(class_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("student_id"), row.get("attended")))
            .collect())
    }

    async fn delete_class_attendance_logs(&self, tenant_id: Uuid, class_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM academy.attendance_logs WHERE tenant_id = $1 AND class_id = $2")
            .bind(tenant_id)
            .bind(class_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_class(&self, tenant_id: Uuid, class_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM academy.classes WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id)
            .bind(class_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn latest_attendance_log(&self, tenant_id: Uuid, student_id: Uuid) -> Result<Option<NaiveDate>> {
        let latest = sqlx::query_scalar(
            "SELECT MAX(attendance_date) FROM academy.attendance_logs WHERE tenant_id = $1 AND student_id = $2",
        )
        .bind(tenant_id)
        .bind(student_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn count_attendance_logs_after(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
        after: Option<NaiveDate>,
    ) -> Result<i64> {
        let count = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM academy.attendance_logs
            WHERE tenant_id = $1 AND student_id = $2
              AND ($3::date IS NULL OR attendance_date > $3)
            "#,
        )
        .bind(tenant_id)
        .bind(student_id)
        .bind(after)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // Each adjustment is a single UPDATE; the row lock orders writers from
    // separate processes.

    async fn record_attendance_removed(&self, tenant_id: Uuid, student_id: Uuid, date: NaiveDate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE academy.students s
            SET total_classes_attended = GREATEST(s.total_classes_attended - 1, 0),
                last_attendance = CASE
                    WHEN s.last_attendance = $3 AND NOT EXISTS (
                        SELECT 1 FROM academy.attendance_logs l
                        WHERE l.tenant_id = $1 AND l.student_id = $2 AND l.attendance_date = $3
                    )
                    THEN (
                        SELECT MAX(l.attendance_date) FROM academy.attendance_logs l
                        WHERE l.tenant_id = $1 AND l.student_id = $2 AND l.attendance_date < $3
                    )
                    ELSE s.last_attendance
                END
            WHERE s.tenant_id = $1 AND s.id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(student_id)
        .bind(date)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("student {student_id}")));
        }
        Ok(())
    }

    async fn record_attendance_added(&self, tenant_id: Uuid, student_id: Uuid, date: NaiveDate) -> Result<()> {
        // GREATEST ignores NULL, so a first attendance sets the date.
        let result = sqlx::query(
            r#"
            UPDATE academy.students
            SET total_classes_attended = total_classes_attended + 1,
                last_attendance = GREATEST(last_attendance, $3)
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(student_id)
        .bind(date)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("student {student_id}")));
        }
        Ok(())
    }

    async fn record_class_removed(&self, tenant_id: Uuid, student_id: Uuid, count: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE academy.students
            SET total_classes_attended = GREATEST(total_classes_attended - LEAST($3, 2147483647)::int, 0)
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(student_id)
        .bind(count)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("student {student_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl RosterStore for PgStore {
    async fn list_students(&self, tenant_id: Uuid) -> Result<Vec<Student>> {
        let query = format!("SELECT {STUDENT_COLUMNS} FROM academy.students WHERE tenant_id = $1 ORDER BY name");
        let rows = sqlx::query(&query).bind(tenant_id).fetch_all(&self.pool).await?;
        rows.iter().map(student_from_row).collect()
    }

    async fn get_student(&self, tenant_id: Uuid, student_id: Uuid) -> Result<Student> {
        let query = format!("SELECT {STUDENT_COLUMNS} FROM academy.students WHERE tenant_id = $1 AND id = $2");
        let row = sqlx::query(&query)
            .bind(tenant_id)
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("student {student_id}")))?;
        student_from_row(&row)
    }

    async fn latest_promotion_date(&self, tenant_id: Uuid, student_id: Uuid) -> Result<Option<NaiveDate>> {
        let latest = sqlx::query_scalar(
            "SELECT MAX(recorded_on) FROM academy.student_history WHERE tenant_id = $1 AND student_id = $2",
        )
        .bind(tenant_id)
        .bind(student_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn apply_promotion(&self, tenant_id: Uuid, student_id: Uuid, update: &PromotionUpdate) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE academy.students
            SET belt_id = $3, stripes = $4, total_classes_attended = $5
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(student_id)
        .bind(update.belt_id)
        .bind(update.stripes)
        .bind(update.total_classes_attended)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("student {student_id}")));
        }

        sqlx::query(
            r#"
            INSERT INTO academy.student_history (id, tenant_id, student_id, kind, item, recorded_on)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(student_id)
        .bind(update.record.kind.as_str())
        .bind(&update.record.item)
        .bind(update.record.date)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn student_history(&self, tenant_id: Uuid, student_id: Uuid) -> Result<Vec<StudentHistoryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT student_id, kind, item, recorded_on FROM academy.student_history
            WHERE tenant_id = $1 AND student_id = $2
            ORDER BY recorded_on, created_at
            "#,
        )
        .bind(tenant_id)
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        let mut history = Vec::new();
        for row in rows {
            let kind: String = row.get("kind");
            history.push(StudentHistoryRecord {
                student_id: row.get("student_id"),
                kind: kind.parse()?,
                item: row.get("item"),
                date: row.get("recorded_on"),
            });
        }

        Ok(history)
    }
}
