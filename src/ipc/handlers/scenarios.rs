use crate::cohort::{self, Cohort};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{parse_params, respond, str_param, teacher_scope, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::model::{GradeMap, TestDef};
use crate::scenarios::{self, Scenario, ScenarioOptions};
use crate::store;
use rusqlite::Connection;
use serde_json::json;

fn load(conn: &Connection, teacher_id: &str, test_id: &str) -> Result<(TestDef, Cohort, GradeMap), HandlerErr> {
    let test = store::test(conn, teacher_id, test_id)?;
    let cohort = cohort::cohort_for_test(conn, teacher_id, &test)?;
    let grades = store::grades(conn, &[test.id.clone()], &cohort.student_ids())?;
    Ok((test, cohort, grades))
}

fn scenarios_compute(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let test_id = str_param(req, "testId")?;
    let options: ScenarioOptions = parse_params(req)?;
    let (test, cohort, grades) = load(conn, &teacher_id, &test_id)?;

    let report = scenarios::compute_scenarios(&test, &cohort.students, &grades, &options)?;
    let mut out = serde_json::to_value(&report)
        .map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    out["warnings"] = json!(cohort.warnings);
    Ok(out)
}

fn scenarios_apply(state: &mut AppState, req: &Request) -> HandlerResult {
    let (conn, teacher_id) = teacher_scope(state, req)?;
    let test_id = str_param(req, "testId")?;
    let scenario_name = str_param(req, "scenario")?;
    let Some(scenario) = Scenario::parse(&scenario_name) else {
        return Err(HandlerErr::bad_params(format!(
            "unknown scenario: {}",
            scenario_name
        )));
    };
    let options: ScenarioOptions = parse_params(req)?;
    let (test, cohort, grades) = load(conn, &teacher_id, &test_id)?;

    let updated = scenarios::apply_scenario(conn, &test, &cohort.students, &grades, &options, scenario)
        .map_err(|e| match e {
            crate::error::CoreError::Persistence(inner) => HandlerErr::new("db_tx_failed", inner.to_string()),
            other => HandlerErr::from(other),
        })?;

    Ok(json!({
        "testId": test.id,
        "scenario": scenario.as_str(),
        "updated": updated,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "scenarios.compute" => scenarios_compute(state, req),
        "scenarios.apply" => scenarios_apply(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
