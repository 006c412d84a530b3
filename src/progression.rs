use std::borrow::Cow;

use uuid::Uuid;

use crate::models::{BeltDefinition, ProgressionSummary, Student};

pub const MAX_STRIPES: i32 = 4;

// (name, color, secondary color, classes_req_total, classes_per_stripe)
const DEFAULT_LADDER: [(&str, &str, Option<&str>, i32, i32); 5] = [
    ("Faixa Branca", "#FFFFFF", None, 100, 20),
    ("Faixa Azul", "#1E40AF", None, 150, 30),
    ("Faixa Roxa", "#6B21A8", None, 150, 30),
    ("Faixa Marrom", "#78350F", None, 125, 25),
    ("Faixa Preta", "#000000", Some("#DC2626"), 200, 40),
];

pub fn default_ladder(tenant_id: Uuid) -> Vec<BeltDefinition> {
    DEFAULT_LADDER
        .iter()
        .zip(1..)
        .map(
            |(&(name, color, secondary, req_total, per_stripe), position)| BeltDefinition {
                id: Uuid::new_v4(),
                tenant_id,
                name: name.to_string(),
                position,
                color: color.to_string(),
                secondary_color: secondary.map(str::to_string),
                special: None,
                classes_req_total: req_total,
                classes_per_stripe: per_stripe,
            },
        )
        .collect()
}

pub fn stripe_goal(belt: &BeltDefinition) -> i32 {
    if belt.classes_per_stripe > 0 {
        belt.classes_per_stripe
    } else {
        1
    }
}

/// Classes needed after the fourth stripe before the belt itself is due.
pub fn final_leg_goal(belt: &BeltDefinition) -> i32 {
    let goal = stripe_goal(belt);
    let consumed_by_stripes = MAX_STRIPES.saturating_mul(goal);
    goal.max(belt.classes_req_total.saturating_sub(consumed_by_stripes))
}

fn coerce_counters(stripes: i32, total_classes_attended: i32) -> (i32, i32) {
    (stripes.clamp(0, MAX_STRIPES), total_classes_attended.max(0))
}

pub fn summarize(belt: &BeltDefinition, stripes: i32, total_classes_attended: i32) -> ProgressionSummary {
    let (stripes, total) = coerce_counters(stripes, total_classes_attended);
    let goal = stripe_goal(belt);
    let ready_for_belt = stripes >= MAX_STRIPES;

    let (display_goal, remaining_for_stripe) = if ready_for_belt {
        let leg = final_leg_goal(belt);
        (leg, leg.saturating_sub(total).max(0))
    } else {
        (goal, goal.saturating_sub(total).max(0))
    };

    let virtual_total_classes = stripes.saturating_mul(goal).saturating_add(total);
    let remaining_for_graduation = belt.classes_req_total.saturating_sub(virtual_total_classes).max(0);

    let lagging = !ready_for_belt && total >= (stripes + 1).saturating_mul(goal);
    let progress_percent = if lagging || display_goal <= 0 {
        100.0
    } else {
        (100.0 * total as f64 / display_goal as f64).min(100.0)
    };

    ProgressionSummary {
        display_goal,
        current_progress: total,
        remaining_for_stripe,
        remaining_for_graduation,
        classes_req_total: belt.classes_req_total,
        virtual_total_classes,
        progress_percent,
        ready_for_belt,
    }
}

pub fn is_eligible(belt: &BeltDefinition, stripes: i32, total_classes_attended: i32) -> bool {
    let (stripes, total) = coerce_counters(stripes, total_classes_attended);
    if stripes < MAX_STRIPES {
        total >= stripe_goal(belt)
    } else {
        total >= final_leg_goal(belt)
    }
}

/// Resolves a belt reference against the tenant ladder.
///
/// Unknown or missing references fall back to the lowest-position entry;
/// an empty ladder falls back to the first built-in default belt.
pub fn resolve_belt<'a>(ladder: &'a [BeltDefinition], belt_id: Option<Uuid>) -> Cow<'a, BeltDefinition> {
    if let Some(found) = belt_id.and_then(|id| ladder.iter().find(|belt| belt.id == id)) {
        return Cow::Borrowed(found);
    }

    match ladder.iter().min_by_key(|belt| belt.position) {
        Some(first) => Cow::Borrowed(first),
        None => Cow::Owned(default_ladder(Uuid::nil()).swap_remove(0)),
    }
}

pub fn next_belt<'a>(ladder: &'a [BeltDefinition], current: &BeltDefinition) -> Option<&'a BeltDefinition> {
    ladder
        .iter()
        .filter(|belt| belt.position > current.position)
        .min_by_key(|belt| belt.position)
}

pub fn student_summary(ladder: &[BeltDefinition], student: &Student) -> ProgressionSummary {
    let belt = resolve_belt(ladder, student.belt_id);
    summarize(&belt, student.stripes, student.total_classes_attended)
}

/// Roster-wide scan for students ready to be promoted.
pub fn eligible_students<'a>(ladder: &[BeltDefinition], roster: &'a [Student]) -> Vec<&'a Student> {
    roster
        .iter()
        .filter(|student| {
            let belt = resolve_belt(ladder, student.belt_id);
            is_eligible(&belt, student.stripes, student.total_classes_attended)
        })
        .collect()
}
