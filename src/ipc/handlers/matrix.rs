use crate::cohort::{self, CohortScope, CohortWarning};
use crate::ipc::helpers::{opt_str_param, parse_params, respond, teacher_scope, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::ipc::error::HandlerErr;
use crate::matrix::{self, AggregateMatrix};
use crate::store::{self, TestFilters, TestOrder};
use serde_json::json;
use std::path::PathBuf;

fn load_matrix(state: &AppState, req: &Request) -> Result<(AggregateMatrix, Vec<CohortWarning>), HandlerErr> {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let filters = parse_params::<TestFilters>(req)?.normalized();

    let tests = store::tests(conn, &teacher_id, &filters, TestOrder::OldestFirst)?;
    let scope = match &filters.class_name {
        Some(class_name) => CohortScope::Classroom {
            class_name: class_name.clone(),
            grade_label: filters.grade_label.clone(),
        },
        None => CohortScope::All,
    };
    let rosters = store::rosters(conn, &teacher_id)?;
    let cohort = cohort::resolve_cohort(&scope, &rosters);

    let test_ids: Vec<String> = tests.iter().map(|t| t.id.clone()).collect();
    let grades = store::grades(conn, &test_ids, &cohort.student_ids())?;
    let competency_weights = store::competency_weights(conn, &teacher_id)?
        .for_context(filters.grade_label.as_deref(), filters.semester.as_deref());

    Ok((
        AggregateMatrix {
            tests,
            students: cohort.students,
            grades,
            competency_weights,
        },
        cohort.warnings,
    ))
}

fn matrix_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let (m, warnings) = load_matrix(state, req)?;
    Ok(json!({
        "tests": m.tests,
        "students": m.students,
        "grades": m.grades_by_student(),
        "competencyWeights": m.competency_weights,
        "competencies": m.competencies(),
        "studentTotals": m.student_aggregates(),
        "classAverage": m.class_average_row(),
        "warnings": warnings,
    }))
}

fn matrix_export(state: &mut AppState, req: &Request) -> HandlerResult {
    let (m, warnings) = load_matrix(state, req)?;
    let sheet = matrix::render_sheet(&m);

    let out_path = opt_str_param(req, "outPath").map(PathBuf::from);
    if let Some(path) = out_path.as_ref() {
        sheet.write_csv(path)?;
        tracing::info!(path = %path.display(), rows = sheet.rows.len(), "exported grade matrix");
    }

    Ok(json!({
        "rows": sheet.rows,
        "rowCount": sheet.rows.len(),
        "outPath": out_path.map(|p| p.to_string_lossy().to_string()),
        "warnings": warnings,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "matrix.get" => matrix_get(state, req),
        "matrix.export" => matrix_export(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
