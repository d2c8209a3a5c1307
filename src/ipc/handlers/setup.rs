use crate::db;
use crate::ipc::error::{tx_failed, HandlerErr};
use crate::ipc::helpers::{parse_params, require_db, respond, str_param, teacher_scope, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::legacy;
use crate::model::{TeacherMode, WeightEntry};
use crate::store;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

const HOMEROOM_DEFAULT_CLASS: &str = "My Class";

fn teachers_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_db(state)?;
    let first_name = str_param(req, "firstName")?;
    let last_name = str_param(req, "lastName")?;
    let email = str_param(req, "email")?.to_ascii_lowercase();

    let taken: Option<i64> = conn
        .query_row("SELECT 1 FROM teachers WHERE email = ?", [&email], |r| r.get(0))
        .optional()?;
    if taken.is_some() {
        return Err(HandlerErr::bad_params("email already registered"));
    }

    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, first_name, last_name, email) VALUES(?, ?, ?, ?)",
        (&teacher_id, &first_name, &last_name, &email),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "teachers" }))
    })?;
    Ok(json!({ "teacherId": teacher_id }))
}

#[derive(Debug, Deserialize)]
struct ClassroomParam {
    name: String,
    #[serde(default)]
    grade: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetupParams {
    teacher_type: String,
    school_name: String,
    #[serde(default = "default_semesters")]
    num_semesters: i64,
    #[serde(default)]
    competencies: Vec<String>,
    #[serde(default)]
    subjects: Vec<String>,
    #[serde(default)]
    weights: Value,
    #[serde(default)]
    classrooms: Vec<ClassroomParam>,
    #[serde(default)]
    grade_name: Option<String>,
    #[serde(default)]
    subject_name: Option<String>,
}

fn default_semesters() -> i64 {
    2
}

/// Accepts the typed list or the old nested blob keyed by competency index.
fn parse_weights(raw: &Value, competencies: &[String]) -> Result<Vec<WeightEntry>, HandlerErr> {
    let entries: Vec<WeightEntry> = match raw {
        Value::Null => Vec::new(),
        Value::Array(_) => serde_json::from_value(raw.clone())
            .map_err(|e| HandlerErr::bad_params(format!("invalid weights: {}", e)))?,
        _ => legacy::weights_from_legacy_blob(raw, competencies)?,
    };

    let mut seen = HashSet::new();
    for e in &entries {
        if e.weight < 0 {
            return Err(HandlerErr::bad_params(format!(
                "weight for {} must be >= 0",
                e.competency
            )));
        }
        if !seen.insert((e.grade.as_str(), e.semester.as_str(), e.competency.as_str())) {
            return Err(HandlerErr::bad_params(format!(
                "duplicate weight for {} / {} / {}",
                e.grade, e.semester, e.competency
            )));
        }
    }
    Ok(entries)
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Returns the id of the classroom with this structured identity, creating it if needed.
fn ensure_classroom(
    conn: &Connection,
    school_id: &str,
    class_name: &str,
    grade_label: Option<&str>,
) -> rusqlite::Result<String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM classrooms
             WHERE school_id = ? AND class_name = ? AND grade_label IS ?
             ORDER BY sort_order, rowid
             LIMIT 1",
            (school_id, class_name, grade_label),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let next_order: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order), 0) + 1 FROM classrooms",
        [],
        |r| r.get(0),
    )?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classrooms(id, school_id, name, class_name, grade_label, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, school_id, class_name, class_name, grade_label, next_order),
    )?;
    Ok(id)
}

fn replace_names(conn: &Connection, table: &str, teacher_id: &str, names: &[String]) -> rusqlite::Result<()> {
    conn.execute(&format!("DELETE FROM {} WHERE teacher_id = ?", table), [teacher_id])?;
    let sql = format!("INSERT INTO {}(teacher_id, sort_order, name) VALUES(?, ?, ?)", table);
    for (i, name) in names.iter().enumerate() {
        conn.execute(&sql, (teacher_id, i as i64, name))?;
    }
    Ok(())
}

fn setup_save(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let params: SetupParams = parse_params(req)?;

    let Some(mode) = TeacherMode::parse(&params.teacher_type) else {
        return Err(HandlerErr::bad_params("teacherType must be homeroom or specialist"));
    };
    let school_name = params.school_name.trim().to_string();
    if school_name.is_empty() {
        return Err(HandlerErr::bad_params("schoolName must not be empty"));
    }
    if params.num_semesters < 1 {
        return Err(HandlerErr::bad_params("numSemesters must be >= 1"));
    }
    let competencies = clean_list(params.competencies);
    let subjects = clean_list(params.subjects);
    let weights = parse_weights(&params.weights, &competencies)?;
    let grade_name = params.grade_name.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let subject_name = params.subject_name.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    let wanted_classrooms: Vec<(String, Option<String>)> = match mode {
        TeacherMode::Specialist => {
            let mut out = Vec::new();
            for c in params.classrooms {
                let name = c.name.trim().to_string();
                if name.is_empty() {
                    return Err(HandlerErr::bad_params("classroom name must not be empty"));
                }
                let grade = c.grade.map(|g| g.trim().to_string()).filter(|g| !g.is_empty());
                out.push((name, grade));
            }
            out
        }
        TeacherMode::Homeroom => vec![(
            grade_name
                .clone()
                .unwrap_or_else(|| HOMEROOM_DEFAULT_CLASS.to_string()),
            grade_name.clone(),
        )],
    };

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    let now = db::now_rfc3339();

    let write = || -> rusqlite::Result<(String, Vec<String>)> {
        tx.execute(
            "INSERT INTO teacher_setup(teacher_id, teacher_type, school_name, num_semesters, grade_name, subject_name, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(teacher_id) DO UPDATE SET
               teacher_type = excluded.teacher_type,
               school_name = excluded.school_name,
               num_semesters = excluded.num_semesters,
               grade_name = excluded.grade_name,
               subject_name = excluded.subject_name,
               updated_at = excluded.updated_at",
            (
                &teacher_id,
                mode.as_str(),
                &school_name,
                params.num_semesters,
                &grade_name,
                &subject_name,
                &now,
            ),
        )?;

        replace_names(&tx, "competencies", &teacher_id, &competencies)?;
        replace_names(&tx, "subjects", &teacher_id, &subjects)?;

        tx.execute("DELETE FROM competency_weights WHERE teacher_id = ?", [&teacher_id])?;
        for (i, w) in weights.iter().enumerate() {
            tx.execute(
                "INSERT INTO competency_weights(teacher_id, sort_order, grade_key, semester_key, competency, weight)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (&teacher_id, i as i64, &w.grade, &w.semester, &w.competency, w.weight),
            )?;
        }

        let existing_school: Option<String> = tx
            .query_row(
                "SELECT id FROM schools WHERE teacher_id = ? ORDER BY rowid LIMIT 1",
                [&teacher_id],
                |r| r.get(0),
            )
            .optional()?;
        let school_id = match existing_school {
            Some(id) => {
                tx.execute("UPDATE schools SET name = ? WHERE id = ?", (&school_name, &id))?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO schools(id, teacher_id, name) VALUES(?, ?, ?)",
                    (&id, &teacher_id, &school_name),
                )?;
                id
            }
        };

        let mut classroom_ids = Vec::with_capacity(wanted_classrooms.len());
        for (name, grade) in &wanted_classrooms {
            classroom_ids.push(ensure_classroom(&tx, &school_id, name, grade.as_deref())?);
        }
        Ok((school_id, classroom_ids))
    };
    let (school_id, classroom_ids) = write().map_err(tx_failed)?;
    tx.commit().map_err(tx_failed)?;

    tracing::info!(
        teacher_id = %teacher_id,
        mode = mode.as_str(),
        classrooms = classroom_ids.len(),
        weights = weights.len(),
        "saved teacher setup"
    );
    Ok(json!({
        "teacherId": teacher_id,
        "schoolId": school_id,
        "teacherMode": mode,
        "classroomIds": classroom_ids,
    }))
}

fn setup_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;

    let setup = conn
        .query_row(
            "SELECT ts.teacher_type, ts.school_name, ts.num_semesters, ts.grade_name, ts.subject_name
             FROM teacher_setup ts
             WHERE ts.teacher_id = ?",
            [&teacher_id],
            |r| {
                Ok(json!({
                    "teacherType": r.get::<_, String>(0)?,
                    "schoolName": r.get::<_, String>(1)?,
                    "numSemesters": r.get::<_, i64>(2)?,
                    "gradeName": r.get::<_, Option<String>>(3)?,
                    "subjectName": r.get::<_, Option<String>>(4)?,
                }))
            },
        )
        .optional()?;

    let mode = store::teacher_mode(conn, &teacher_id)?;
    let competencies = store::ordered_names(conn, "competencies", &teacher_id)?;
    let subjects = store::ordered_names(conn, "subjects", &teacher_id)?;
    let weights = store::competency_weights(conn, &teacher_id)?;

    Ok(json!({
        "teacherId": teacher_id,
        "setup": setup,
        "teacherMode": mode,
        "competencies": competencies,
        "subjects": subjects,
        "weights": weights.entries,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "teachers.create" => teachers_create(state, req),
        "setup.save" => setup_save(state, req),
        "setup.get" => setup_get(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
