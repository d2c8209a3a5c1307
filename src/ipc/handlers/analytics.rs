use crate::calc::{self, round_off_1_decimal};
use crate::cohort;
use crate::ipc::helpers::{opt_str_param, respond, str_param, teacher_scope, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::legacy;
use crate::model::{grade_for, TestDef};
use crate::store::{self, TestFilters, TestOrder};
use serde_json::json;

const LOW_GRADE_THRESHOLD: f64 = 80.0;

fn grade_status(points: Option<f64>, absent: bool) -> &'static str {
    if absent {
        "Absent"
    } else if points.is_some() {
        "Completed"
    } else {
        "Not Graded"
    }
}

fn analytics_student(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let student_id = str_param(req, "studentId")?;
    let semester = opt_str_param(req, "semester");
    let student = store::student(conn, &teacher_id, &student_id)?;
    let classroom = store::classroom(conn, &teacher_id, &student.classroom_id)?;

    let mode = store::teacher_mode(conn, &teacher_id)?;
    let rosters = store::rosters(conn, &teacher_id)?;
    let filters = TestFilters {
        semester: semester.clone(),
        ..TestFilters::default()
    };
    let tests: Vec<TestDef> = store::tests(conn, &teacher_id, &filters, TestOrder::OldestFirst)?
        .into_iter()
        .filter(|t| {
            cohort::resolve_test_cohort(t, &rosters, mode)
                .students
                .iter()
                .any(|s| s.id == student.id)
        })
        .collect();

    let test_ids: Vec<String> = tests.iter().map(|t| t.id.clone()).collect();
    let grades = store::grades(conn, &test_ids, &[student.id.clone()])?;

    let mut low_grades = 0_usize;
    let history: Vec<serde_json::Value> = tests
        .iter()
        .map(|t| {
            let g = grade_for(&grades, &t.id, &student.id);
            let points = g.and_then(|g| g.points);
            let absent = g.map(|g| g.absent).unwrap_or(false);
            let pct = calc::student_percentage(t, &student.id, &grades);
            if pct.map(|p| p < LOW_GRADE_THRESHOLD).unwrap_or(false) {
                low_grades += 1;
            }
            json!({
                "testId": t.id,
                "testName": t.test_name,
                "testDate": t.test_date,
                "semester": t.semester,
                "subject": t.subject,
                "competency": t.competency,
                "maxPoints": t.max_points,
                "points": points,
                "percentage": pct.map(round_off_1_decimal),
                "status": grade_status(points, absent),
            })
        })
        .collect();

    let (_, grade_label) = legacy::structured_identity(&classroom);
    let weights = store::competency_weights(conn, &teacher_id)?
        .for_context(grade_label.as_deref(), semester.as_deref());
    let aggregate = calc::student_aggregate(&student.id, &tests, &grades, &weights);

    Ok(json!({
        "student": student,
        "grades": history,
        "lowGradeCount": low_grades,
        "competencies": aggregate.competencies,
        "grandTotal": aggregate.grand_total,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "analytics.student" => analytics_student(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
