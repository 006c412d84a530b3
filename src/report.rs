use std::fmt::Write;

use chrono::{Duration, NaiveDate};

use crate::models::{BeltCount, BeltDefinition, Student};
use crate::progression;

pub fn summarize_by_belt(ladder: &[BeltDefinition], roster: &[Student]) -> Vec<BeltCount> {
    let mut counts: std::collections::HashMap<String, (i32, usize)> = std::collections::HashMap::new();

    for student in roster {
        let belt = progression::resolve_belt(ladder, student.belt_id);
        let entry = counts.entry(belt.name.clone()).or_insert((belt.position, 0));
        entry.1 += 1;
    }

    let mut summaries: Vec<(i32, BeltCount)> = counts
        .into_iter()
        .map(|(belt_name, (position, count))| (position, BeltCount { belt_name, count }))
        .collect();

    summaries.sort_by_key(|(position, _)| *position);
    summaries.into_iter().map(|(_, summary)| summary).collect()
}

/// Active students who have not trained since `cutoff`, oldest first.
pub fn inactive_students(roster: &[Student], cutoff: NaiveDate) -> Vec<&Student> {
    let mut inactive: Vec<&Student> = roster
        .iter()
        .filter(|s| s.active && s.last_attendance.map_or(true, |last| last < cutoff))
        .collect();
    inactive.sort_by_key(|s| s.last_attendance);
    inactive
}

/// Clamps the inactivity window to at least one day and returns it with
/// the matching cutoff date.
pub fn inactive_window(today: NaiveDate, inactive_days: i64) -> (i64, NaiveDate) {
    let days = inactive_days.max(1);
    (days, today - Duration::days(days))
}

pub fn build_report(
    academy: Option<&str>,
    inactive_days: i64,
    cutoff: NaiveDate,
    ladder: &[BeltDefinition],
    roster: &[Student],
) -> String {
    let belt_counts = summarize_by_belt(ladder, roster);
    let eligible = progression::eligible_students(ladder, roster);
    let inactive = inactive_students(roster, cutoff);

    let mut output = String::new();
    let academy_label = academy.unwrap_or("academy");

    let _ = writeln!(output, "# Graduation Progress Report");
    let _ = writeln!(
        output,
        "Generated for {} ({} students, inactivity window {} days)",
        academy_label,
        roster.len(),
        inactive_days
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Belt Distribution");

    if belt_counts.is_empty() {
        let _ = writeln!(output, "No students on the roster.");
    } else {
        for summary in belt_counts.iter() {
            let _ = writeln!(output, "- {}: {} students", summary.belt_name, summary.count);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Ready for Promotion");

    if eligible.is_empty() {
        let _ = writeln!(output, "No students have met their class requirement.");
    } else {
        for student in eligible.iter() {
            let belt = progression::resolve_belt(ladder, student.belt_id);
            let summary = progression::summarize(&belt, student.stripes, student.total_classes_attended);
            let next_step = if summary.ready_for_belt {
                "next belt".to_string()
            } else {
                format!("stripe {}", student.stripes + 1)
            };
            let _ = writeln!(
                output,
                "- {} ({}, {} stripes): {} classes toward {}",
                student.name, belt.name, student.stripes, student.total_classes_attended, next_step
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Inactive Students");

    if inactive.is_empty() {
        let _ = writeln!(output, "Everyone has trained since {}.", cutoff);
    } else {
        for student in inactive.iter().take(20) {
            match student.last_attendance {
                Some(last) => {
                    let _ = writeln!(output, "- {} (last class {})", student.name, last);
                }
                None => {
                    let _ = writeln!(output, "- {} (no recorded classes)", student.name);
                }
            }
        }
    }

    output
}
