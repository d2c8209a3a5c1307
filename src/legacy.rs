//! Readers for data written before classrooms and setup weights had
//! structured fields. Nothing here is used as a write format.

use crate::error::{CoreError, CoreResult};
use crate::model::{Classroom, WeightEntry};
use rusqlite::Connection;

/// Splits a packed display name such as `"5A (Grade 5)"` into `("5A", "Grade 5")`.
pub fn split_packed_name(raw: &str) -> Option<(String, String)> {
    if !raw.contains('(') || !raw.contains(')') {
        return None;
    }
    let (name, rest) = raw.split_once(" (")?;
    let label = rest.trim_end_matches(')');
    Some((name.to_string(), label.to_string()))
}

/// Name/label pair for a classroom. Explicit fields win over the packed name.
pub fn structured_identity(classroom: &Classroom) -> (String, Option<String>) {
    let packed = split_packed_name(&classroom.name);
    let name = classroom
        .class_name
        .clone()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| packed.as_ref().map(|(n, _)| n.clone()))
        .unwrap_or_else(|| classroom.name.clone());
    let label = classroom
        .grade_label
        .clone()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| packed.map(|(_, l)| l));
    (name, label)
}

/// Guesses a grade label from a bare classroom name: "101" and "1A" both
/// become "Grade 1". Names already mentioning a grade are returned as-is.
///
/// Only the workspace migration calls this.
pub fn heuristic_grade_label(name: &str) -> String {
    if name.is_empty() {
        return "Unknown Grade".to_string();
    }
    if name.to_ascii_lowercase().contains("grade") {
        return name.to_string();
    }
    match name.chars().next() {
        Some(c @ '1'..='9') => format!("Grade {}", c),
        _ => name.to_string(),
    }
}

/// Backfills `class_name`/`grade_label` on classrooms created before those
/// columns existed. The raw `name` column is left untouched.
pub fn migrate_classroom_identity(conn: &Connection) -> anyhow::Result<usize> {
    let mut stmt = conn.prepare("SELECT id, name FROM classrooms WHERE class_name IS NULL")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    for (id, raw) in &rows {
        let (name, label) = match split_packed_name(raw) {
            Some(parts) => parts,
            None => (raw.clone(), heuristic_grade_label(raw)),
        };
        conn.execute(
            "UPDATE classrooms SET class_name = ?, grade_label = COALESCE(grade_label, ?) WHERE id = ?",
            (&name, &label, id),
        )?;
    }
    Ok(rows.len())
}

/// Converts the old nested weights blob `{grade: {semester: {index: weight}}}`
/// into typed rows, resolving indexes against the submitted competency list.
pub fn weights_from_legacy_blob(
    blob: &serde_json::Value,
    competencies: &[String],
) -> CoreResult<Vec<WeightEntry>> {
    let Some(grades) = blob.as_object() else {
        return Err(CoreError::invalid("weights must be an object or a list"));
    };

    let mut out = Vec::new();
    for (grade, semesters) in grades {
        let Some(semesters) = semesters.as_object() else {
            return Err(CoreError::invalid(format!(
                "weights.{} must map semesters to weights",
                grade
            )));
        };
        for (semester, by_index) in semesters {
            let Some(by_index) = by_index.as_object() else {
                return Err(CoreError::invalid(format!(
                    "weights.{}.{} must map competency indexes to weights",
                    grade, semester
                )));
            };
            for (idx, weight) in by_index {
                let Ok(idx) = idx.trim().parse::<usize>() else {
                    continue;
                };
                let Some(competency) = competencies.get(idx) else {
                    continue;
                };
                let weight = weight
                    .as_i64()
                    .or_else(|| weight.as_f64().map(|f| f as i64))
                    .or_else(|| weight.as_str().and_then(|s| s.trim().parse::<i64>().ok()));
                let Some(weight) = weight else {
                    return Err(CoreError::invalid(format!(
                        "weight for {} in {}/{} must be an integer",
                        competency, grade, semester
                    )));
                };
                out.push(WeightEntry {
                    grade: grade.clone(),
                    semester: semester.clone(),
                    competency: competency.clone(),
                    weight,
                });
            }
        }
    }
    Ok(out)
}
