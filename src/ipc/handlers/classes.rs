use crate::ipc::error::{tx_failed, HandlerErr};
use crate::ipc::helpers::{respond, str_param, teacher_scope, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::legacy;
use crate::store;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn classrooms_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;

    let mut rows = Vec::new();
    for c in store::classrooms(conn, &teacher_id)? {
        // Correlated counts avoid double-counting from joins.
        let (school_name, student_count): (String, i64) = conn.query_row(
            "SELECT s.name, (SELECT COUNT(*) FROM students st WHERE st.classroom_id = ?)
             FROM schools s WHERE s.id = ?",
            (&c.id, &c.school_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let (class_name, grade_label) = legacy::structured_identity(&c);
        rows.push(json!({
            "id": c.id,
            "name": c.name,
            "className": class_name,
            "gradeLabel": grade_label,
            "schoolName": school_name,
            "studentCount": student_count,
        }));
    }
    Ok(json!({ "classrooms": rows }))
}

fn students_save(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let classroom_id = str_param(req, "classroomId")?;
    store::classroom(conn, &teacher_id, &classroom_id)?;
    let Some(items) = req.params.get("students").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing students[]"));
    };

    let mut parsed = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let first = item.get("firstName").and_then(|v| v.as_str()).map(str::trim).unwrap_or("");
        let last = item.get("lastName").and_then(|v| v.as_str()).map(str::trim).unwrap_or("");
        if first.is_empty() || last.is_empty() {
            return Err(HandlerErr::bad_params(format!(
                "student at index {} needs firstName and lastName",
                i
            )));
        }
        parsed.push((first.to_string(), last.to_string()));
    }

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    let mut inserted = Vec::new();
    let mut skipped = 0_usize;
    for (first, last) in &parsed {
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM students WHERE classroom_id = ? AND first_name = ? AND last_name = ?",
                (&classroom_id, first, last),
                |r| r.get(0),
            )
            .optional()
            .map_err(tx_failed)?;
        if exists.is_some() {
            skipped += 1;
            continue;
        }
        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO students(id, classroom_id, first_name, last_name) VALUES(?, ?, ?, ?)",
            (&id, &classroom_id, first, last),
        )
        .map_err(tx_failed)?;
        inserted.push(id);
    }
    tx.commit().map_err(tx_failed)?;

    Ok(json!({
        "inserted": inserted.len(),
        "skipped": skipped,
        "studentIds": inserted,
    }))
}

fn students_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let classroom_id = str_param(req, "classroomId")?;
    store::classroom(conn, &teacher_id, &classroom_id)?;
    let students = store::students_in_classroom(conn, &classroom_id)?;
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classrooms.list" => classrooms_list(state, req),
        "students.save" => students_save(state, req),
        "students.list" => students_list(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
