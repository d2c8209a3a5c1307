use crate::cohort;
use crate::db;
use crate::ipc::error::{tx_failed, HandlerErr};
use crate::ipc::helpers::{respond, str_param, teacher_scope, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::model::{grade_for, GradeRecord};
use crate::store;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const BULK_UPDATE_MAX_EDITS: usize = 5000;

fn parse_points(v: Option<&serde_json::Value>, index: usize) -> Result<Option<f64>, HandlerErr> {
    match v {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => match v.as_f64() {
            Some(p) if p.is_finite() && p >= 0.0 => Ok(Some(p)),
            _ => Err(HandlerErr::bad_params(format!(
                "points at index {} must be a number >= 0",
                index
            ))),
        },
    }
}

/// Writes a manually entered grade. Empty records remove the row. Manual
/// entry becomes the new original, so earlier rescale tracking is cleared.
fn write_grade(
    conn: &Connection,
    test_id: &str,
    student_id: &str,
    record: GradeRecord,
    now: &str,
) -> rusqlite::Result<()> {
    if record.is_empty() {
        conn.execute(
            "DELETE FROM grades WHERE test_id = ? AND student_id = ?",
            (test_id, student_id),
        )?;
        return Ok(());
    }
    conn.execute(
        "INSERT INTO grades(id, test_id, student_id, points, absent, original_points, original_absent,
           modification_type, modification_notes, modified_at, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?, ?)
         ON CONFLICT(test_id, student_id) DO UPDATE SET
           points = excluded.points,
           absent = excluded.absent,
           original_points = excluded.points,
           original_absent = excluded.absent,
           modification_type = NULL,
           modification_notes = NULL,
           modified_at = NULL,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            test_id,
            student_id,
            record.points,
            record.absent as i64,
            record.points,
            record.absent as i64,
            now,
            now,
        ),
    )?;
    Ok(())
}

fn grades_for_test(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let test_id = str_param(req, "testId")?;
    let test = store::test(conn, &teacher_id, &test_id)?;
    let cohort = cohort::cohort_for_test(conn, &teacher_id, &test)?;
    let grades = store::grades(conn, &[test.id.clone()], &cohort.student_ids())?;

    let students: Vec<serde_json::Value> = cohort
        .students
        .iter()
        .map(|s| {
            let g = grade_for(&grades, &test.id, &s.id);
            json!({
                "studentId": s.id,
                "classroomId": s.classroom_id,
                "firstName": s.first_name,
                "lastName": s.last_name,
                "points": g.and_then(|g| g.points),
                "absent": g.map(|g| g.absent).unwrap_or(false),
            })
        })
        .collect();

    Ok(json!({
        "test": test,
        "classroomIds": cohort.classroom_ids,
        "students": students,
        "warnings": cohort.warnings,
    }))
}

fn grades_save(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let test_id = str_param(req, "testId")?;
    store::test(conn, &teacher_id, &test_id)?;
    let Some(items) = req.params.get("grades").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing grades[]"));
    };

    let mut parsed: Vec<(String, GradeRecord)> = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let Some(student_id) = item.get("studentId").and_then(|v| v.as_str()) else {
            return Err(HandlerErr::bad_params(format!("grade at index {} missing studentId", i)));
        };
        store::student(conn, &teacher_id, student_id)?;
        let points = parse_points(item.get("points"), i)?;
        let absent = item.get("absent").and_then(|v| v.as_bool()).unwrap_or(false);
        parsed.push((student_id.to_string(), GradeRecord { points, absent }));
    }

    let now = db::now_rfc3339();
    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    let mut saved = 0_usize;
    let mut cleared = 0_usize;
    for (student_id, record) in &parsed {
        write_grade(&tx, &test_id, student_id, *record, &now).map_err(tx_failed)?;
        if record.is_empty() {
            cleared += 1;
        } else {
            saved += 1;
        }
    }
    tx.commit().map_err(tx_failed)?;

    Ok(json!({ "saved": saved, "cleared": cleared }))
}

fn grades_bulk_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let Some(items) = req.params.get("updates").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing updates[]"));
    };
    if items.len() > BULK_UPDATE_MAX_EDITS {
        return Err(HandlerErr::bad_params(format!(
            "bulk payload exceeds max edits: {} > {}",
            items.len(),
            BULK_UPDATE_MAX_EDITS
        ))
        .with_details(json!({ "limit": BULK_UPDATE_MAX_EDITS })));
    }

    // Validate everything before the first write.
    let mut owned_tests: HashSet<String> = HashSet::new();
    let mut owned_students: HashSet<String> = HashSet::new();
    let mut edits: Vec<(String, String, Option<f64>)> = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let (Some(student_id), Some(test_id)) = (
            item.get("studentId").and_then(|v| v.as_str()),
            item.get("testId").and_then(|v| v.as_str()),
        ) else {
            return Err(HandlerErr::bad_params(format!(
                "update at index {} needs studentId and testId",
                i
            )));
        };
        if owned_tests.insert(test_id.to_string()) {
            store::test(conn, &teacher_id, test_id)
                .map_err(|e| HandlerErr::from(e).with_details(json!({ "testId": test_id, "index": i })))?;
        }
        if owned_students.insert(student_id.to_string()) {
            store::student(conn, &teacher_id, student_id).map_err(|e| {
                HandlerErr::from(e).with_details(json!({ "studentId": student_id, "index": i }))
            })?;
        }
        let points = parse_points(item.get("points"), i)?;
        edits.push((test_id.to_string(), student_id.to_string(), points));
    }

    let now = db::now_rfc3339();
    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    let mut absent_cache: HashMap<(String, String), bool> = HashMap::new();
    let mut updated = 0_usize;
    for (test_id, student_id, points) in edits {
        let key = (test_id.clone(), student_id.clone());
        let absent = match absent_cache.get(&key) {
            Some(a) => *a,
            None => tx
                .query_row(
                    "SELECT absent FROM grades WHERE test_id = ? AND student_id = ?",
                    (&test_id, &student_id),
                    |r| r.get::<_, i64>(0),
                )
                .optional()
                .map_err(tx_failed)?
                .map(|a| a != 0)
                .unwrap_or(false),
        };
        // A typed score marks the student present; clearing keeps an absence.
        let record = GradeRecord {
            points,
            absent: points.is_none() && absent,
        };
        write_grade(&tx, &test_id, &student_id, record, &now).map_err(tx_failed)?;
        absent_cache.insert(key, record.absent);
        updated += 1;
    }
    tx.commit().map_err(tx_failed)?;

    tracing::info!(teacher_id = %teacher_id, updated, "bulk grade update");
    Ok(json!({ "updated": updated }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grades.forTest" => grades_for_test(state, req),
        "grades.save" => grades_save(state, req),
        "grades.bulkUpdate" => grades_bulk_update(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
