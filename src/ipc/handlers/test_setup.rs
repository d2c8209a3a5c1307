use crate::db;
use crate::ipc::error::{tx_failed, HandlerErr};
use crate::ipc::helpers::{opt_str_param, respond, str_param, teacher_scope, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::model::TeacherMode;
use crate::store::{self, TestFilters, TestOrder};
use chrono::NaiveDate;
use serde_json::json;
use uuid::Uuid;

struct TestInput {
    semester: String,
    grade_label: Option<String>,
    class_name: Option<String>,
    subject: Option<String>,
    competency: String,
    test_name: String,
    max_points: i64,
    test_date: String,
    test_weight: f64,
}

fn parse_test_input(req: &Request) -> Result<TestInput, HandlerErr> {
    let max_points = req
        .params
        .get("maxPoints")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("maxPoints must be an integer"))?;
    if max_points <= 0 {
        return Err(HandlerErr::bad_params("maxPoints must be > 0"));
    }

    let test_weight = match req.params.get("testWeight") {
        None | Some(serde_json::Value::Null) => 1.0,
        Some(v) => v
            .as_f64()
            .ok_or_else(|| HandlerErr::bad_params("testWeight must be a number"))?,
    };
    if !test_weight.is_finite() || test_weight < 0.0 {
        return Err(HandlerErr::bad_params("testWeight must be >= 0"));
    }

    let test_date = str_param(req, "testDate")?;
    if NaiveDate::parse_from_str(&test_date, "%Y-%m-%d").is_err() {
        return Err(HandlerErr::bad_params("testDate must be YYYY-MM-DD"));
    }

    Ok(TestInput {
        semester: str_param(req, "semester")?,
        grade_label: opt_str_param(req, "gradeLabel"),
        class_name: opt_str_param(req, "className"),
        subject: opt_str_param(req, "subject"),
        competency: str_param(req, "competency")?,
        test_name: str_param(req, "testName")?,
        max_points,
        test_date,
        test_weight,
    })
}

fn tests_save(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let input = parse_test_input(req)?;

    let test_id = match opt_str_param(req, "testId") {
        Some(test_id) => {
            store::test(conn, &teacher_id, &test_id)?;
            conn.execute(
                "UPDATE tests SET semester = ?, grade_label = ?, class_name = ?, subject = ?,
                   competency = ?, test_name = ?, max_points = ?, test_date = ?, test_weight = ?
                 WHERE id = ? AND teacher_id = ?",
                (
                    &input.semester,
                    &input.grade_label,
                    &input.class_name,
                    &input.subject,
                    &input.competency,
                    &input.test_name,
                    input.max_points,
                    &input.test_date,
                    input.test_weight,
                    &test_id,
                    &teacher_id,
                ),
            )?;
            test_id
        }
        None => {
            let test_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO tests(id, teacher_id, semester, grade_label, class_name, subject,
                   competency, test_name, max_points, test_date, test_weight, created_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &test_id,
                    &teacher_id,
                    &input.semester,
                    &input.grade_label,
                    &input.class_name,
                    &input.subject,
                    &input.competency,
                    &input.test_name,
                    input.max_points,
                    &input.test_date,
                    input.test_weight,
                    db::now_rfc3339(),
                ),
            )
            .map_err(|e| {
                HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "tests" }))
            })?;
            test_id
        }
    };

    let test = store::test(conn, &teacher_id, &test_id)?;
    Ok(json!({ "test": test }))
}

fn tests_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let test_id = str_param(req, "testId")?;
    let test = store::test(conn, &teacher_id, &test_id)?;
    Ok(json!({ "test": test }))
}

fn tests_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let test_id = str_param(req, "testId")?;
    store::test(conn, &teacher_id, &test_id)?;

    // No ON DELETE CASCADE: grades go first.
    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    let grades_deleted = tx
        .execute("DELETE FROM grades WHERE test_id = ?", [&test_id])
        .map_err(tx_failed)?;
    tx.execute(
        "DELETE FROM tests WHERE id = ? AND teacher_id = ?",
        (&test_id, &teacher_id),
    )
    .map_err(tx_failed)?;
    tx.commit().map_err(tx_failed)?;

    Ok(json!({ "deleted": true, "gradesDeleted": grades_deleted }))
}

fn tests_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let mode = store::teacher_mode(conn, &teacher_id)?;

    let mut filters = TestFilters {
        semester: Some(str_param(req, "semester")?),
        ..TestFilters::default()
    };
    match mode {
        TeacherMode::Specialist => filters.class_name = opt_str_param(req, "className"),
        TeacherMode::Homeroom => filters.subject = opt_str_param(req, "subject"),
    }

    let tests = store::tests(conn, &teacher_id, &filters, TestOrder::NewestFirst)?;
    Ok(json!({ "teacherMode": mode, "tests": tests }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "tests.save" => tests_save(state, req),
        "tests.get" => tests_get(state, req),
        "tests.delete" => tests_delete(state, req),
        "tests.list" => tests_list(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
