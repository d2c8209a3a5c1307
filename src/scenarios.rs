//! Bell-curve rescaling of one test's scores.

use crate::calc::{class_average, percentage, round_points};
use crate::db::now_rfc3339;
use crate::error::{CoreError, CoreResult};
use crate::model::{grade_for, GradeMap, Student, TestDef};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Compression applied by the typical-distribution scenario before re-lifting.
pub const TYPICAL_RATIO: f64 = 0.85;

/// The square-root boost raises every score by at least this many points.
pub const SQRT_MIN_GAIN: f64 = 2.0;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioOptions {
    #[serde(default)]
    pub adjust_avg: bool,
    #[serde(default)]
    pub target_avg: Option<f64>,
    #[serde(default)]
    pub allow_over_100: bool,
    #[serde(default)]
    pub boost_low: bool,
    #[serde(default)]
    pub lowest_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Scenario {
    Original,
    Linear,
    /// Typical distribution: compress then re-lift to the target average.
    Percentage,
    Sqrt,
}

impl Scenario {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "original" => Some(Self::Original),
            "linear" => Some(Self::Linear),
            "percentage" => Some(Self::Percentage),
            "sqrt" => Some(Self::Sqrt),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Linear => "linear",
            Self::Percentage => "percentage",
            Self::Sqrt => "sqrt",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Original => "Original",
            Self::Linear => "Linear scaling",
            Self::Percentage => "Typical distribution",
            Self::Sqrt => "Square root",
        }
    }
}

/// Per-test constants derived once from the class average and options.
#[derive(Debug, Clone, Copy)]
struct ScenarioParams {
    linear_shift: Option<f64>,
    typical_offset: Option<f64>,
    sqrt_adjust: Option<f64>,
    allow_over_100: bool,
    lowest_score: Option<f64>,
}

impl ScenarioParams {
    fn prepare(options: &ScenarioOptions, class_avg: Option<f64>) -> CoreResult<Self> {
        if options.adjust_avg && class_avg.is_none() {
            return Err(CoreError::invalid(
                "no graded data available to adjust the class average",
            ));
        }
        if options.adjust_avg && options.target_avg.is_none() {
            return Err(CoreError::invalid("targetAvg is required when adjustAvg is set"));
        }
        if options.boost_low && class_avg.is_none() {
            return Err(CoreError::invalid(
                "no graded data available for the low-score boost",
            ));
        }

        // The boost reads targetAvg even when no average adjustment was asked for.
        let target = options.target_avg.unwrap_or(0.0);
        let (linear_shift, typical_offset) = match (options.adjust_avg, class_avg) {
            (true, Some(avg)) => (Some(target - avg), Some(target - avg * TYPICAL_RATIO)),
            _ => (None, None),
        };
        let sqrt_adjust = match (options.boost_low, class_avg) {
            (true, Some(avg)) => Some(avg.max(0.0).sqrt() * 10.0 - target),
            _ => None,
        };

        Ok(Self {
            linear_shift,
            typical_offset,
            sqrt_adjust,
            allow_over_100: options.allow_over_100,
            lowest_score: options.lowest_score,
        })
    }

    fn cap(&self, v: f64) -> f64 {
        if self.allow_over_100 {
            v
        } else {
            v.min(100.0)
        }
    }

    fn linear(&self, original: f64) -> Option<f64> {
        self.linear_shift.map(|d| self.cap(original + d))
    }

    fn typical(&self, original: f64) -> Option<f64> {
        self.typical_offset
            .map(|offset| self.cap(original * TYPICAL_RATIO + offset))
    }

    fn sqrt(&self, original: f64) -> Option<f64> {
        self.sqrt_adjust.map(|adjust| {
            let mut v = original.max(0.0).sqrt() * 10.0 - adjust;
            if let Some(lowest) = self.lowest_score {
                v = v.max(lowest);
            }
            v.max(original + SQRT_MIN_GAIN)
        })
    }

    fn value(&self, scenario: Scenario, original: f64) -> Option<f64> {
        match scenario {
            Scenario::Original => Some(original),
            Scenario::Linear => self.linear(original),
            Scenario::Percentage => self.typical(original),
            Scenario::Sqrt => self.sqrt(original),
        }
    }

    fn enables(&self, scenario: Scenario) -> bool {
        match scenario {
            Scenario::Original => true,
            Scenario::Linear => self.linear_shift.is_some(),
            Scenario::Percentage => self.typical_offset.is_some(),
            Scenario::Sqrt => self.sqrt_adjust.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioTest {
    pub id: String,
    pub name: String,
    pub max_points: i64,
    pub original_class_avg: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentScenarios {
    pub student_id: String,
    pub name: String,
    pub original: Option<f64>,
    pub linear: Option<f64>,
    pub percentage: Option<f64>,
    pub sqrt: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub test: ScenarioTest,
    pub students: Vec<StudentScenarios>,
}

fn by_last_then_first(cohort: &[Student]) -> Vec<&Student> {
    let mut ordered: Vec<&Student> = cohort.iter().collect();
    ordered.sort_by(|a, b| {
        (a.last_name.as_str(), a.first_name.as_str()).cmp(&(b.last_name.as_str(), b.first_name.as_str()))
    });
    ordered
}

pub fn compute_scenarios(
    test: &TestDef,
    cohort: &[Student],
    grades: &GradeMap,
    options: &ScenarioOptions,
) -> CoreResult<ScenarioReport> {
    let class_avg = class_average(test, cohort, grades);
    let params = ScenarioParams::prepare(options, class_avg)?;

    let students = by_last_then_first(cohort)
        .into_iter()
        .map(|s| {
            let original =
                grade_for(grades, &test.id, &s.id).and_then(|g| percentage(g, test.max_points));
            StudentScenarios {
                student_id: s.id.clone(),
                name: s.full_name(),
                original,
                linear: original.and_then(|p| params.linear(p)),
                percentage: original.and_then(|p| params.typical(p)),
                sqrt: original.and_then(|p| params.sqrt(p)),
            }
        })
        .collect();

    Ok(ScenarioReport {
        test: ScenarioTest {
            id: test.id.clone(),
            name: test.test_name.clone(),
            max_points: test.max_points,
            original_class_avg: class_avg,
        },
        students,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUpdate {
    pub student_id: String,
    pub new_points: f64,
}

#[derive(Debug, Clone)]
pub struct ApplyPlan {
    pub scenario: Scenario,
    pub updates: Vec<PlannedUpdate>,
    pub details: String,
}

/// Human-readable summary stored on the test after a rescale.
pub fn audit_details(scenario: Scenario, class_avg: Option<f64>, options: &ScenarioOptions) -> String {
    let original = class_avg
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| "N/A".to_string());
    let target = match (options.adjust_avg, options.target_avg) {
        (true, Some(t)) => format!("{}", t),
        _ => "N/A".to_string(),
    };
    let lowest = options
        .lowest_score
        .map(|v| format!("{}", v))
        .unwrap_or_else(|| "N/A".to_string());
    format!(
        "Type: {}; Original average: {}; New average: {}; Scores > 100% allowed: {}; Lowest score allowed: {}",
        scenario.label(),
        original,
        target,
        if options.allow_over_100 { "True" } else { "False" },
        lowest
    )
}

/// Computes the new raw points for every graded cohort member. Absent and
/// ungraded students are skipped.
pub fn plan_apply(
    test: &TestDef,
    cohort: &[Student],
    grades: &GradeMap,
    options: &ScenarioOptions,
    scenario: Scenario,
) -> CoreResult<ApplyPlan> {
    let class_avg = class_average(test, cohort, grades);
    let params = ScenarioParams::prepare(options, class_avg)?;
    if !params.enables(scenario) {
        return Err(CoreError::invalid(format!(
            "scenario '{}' is not enabled by the given options",
            scenario.as_str()
        )));
    }

    let mut updates = Vec::new();
    for s in cohort {
        let Some(original) =
            grade_for(grades, &test.id, &s.id).and_then(|g| percentage(g, test.max_points))
        else {
            continue;
        };
        let Some(new_pct) = params.value(scenario, original) else {
            continue;
        };
        updates.push(PlannedUpdate {
            student_id: s.id.clone(),
            new_points: round_points(new_pct / 100.0 * test.max_points as f64),
        });
    }

    Ok(ApplyPlan {
        scenario,
        updates,
        details: audit_details(scenario, class_avg, options),
    })
}

/// Writes a plan in one transaction. Returns the number of grades updated.
pub fn apply_plan(conn: &Connection, test: &TestDef, plan: &ApplyPlan) -> CoreResult<usize> {
    let tx = conn.unchecked_transaction()?;
    let now = now_rfc3339();

    let mut updated = 0_usize;
    for u in &plan.updates {
        updated += tx.execute(
            "UPDATE grades SET
               original_points = CASE WHEN modification_type IS NULL THEN points ELSE original_points END,
               original_absent = CASE WHEN modification_type IS NULL THEN absent ELSE original_absent END,
               points = ?,
               modification_type = ?,
               modification_notes = ?,
               modified_at = ?,
               updated_at = ?
             WHERE test_id = ? AND student_id = ?",
            (
                u.new_points,
                plan.scenario.as_str(),
                &plan.details,
                &now,
                &now,
                &test.id,
                &u.student_id,
            ),
        )?;
    }

    tx.execute(
        "UPDATE tests SET scores_modified = 1, scores_modified_details = ? WHERE id = ?",
        (&plan.details, &test.id),
    )?;
    tx.commit()?;

    tracing::info!(
        test_id = %test.id,
        scenario = plan.scenario.as_str(),
        updated,
        "applied grade scenario"
    );
    Ok(updated)
}

pub fn apply_scenario(
    conn: &Connection,
    test: &TestDef,
    cohort: &[Student],
    grades: &GradeMap,
    options: &ScenarioOptions,
    scenario: Scenario,
) -> CoreResult<usize> {
    let plan = plan_apply(test, cohort, grades, options, scenario)?;
    apply_plan(conn, test, &plan).inspect_err(|e| {
        tracing::warn!(test_id = %test.id, error = %e, "scenario apply rolled back");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GradeRecord;
    use proptest::prelude::*;

    fn quiz() -> TestDef {
        TestDef {
            id: "quiz".to_string(),
            teacher_id: "t".to_string(),
            semester: "Semester 1".to_string(),
            grade_label: None,
            class_name: None,
            subject: None,
            competency: "Reading".to_string(),
            test_name: "Quiz 1".to_string(),
            max_points: 20,
            test_date: "2025-01-01".to_string(),
            test_weight: 1.0,
            scores_modified: false,
            scores_modified_details: None,
        }
    }

    fn student(id: &str, first: &str, last: &str) -> Student {
        Student {
            id: id.to_string(),
            classroom_id: "c".to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
        }
    }

    fn sample() -> (Vec<Student>, GradeMap) {
        let cohort = vec![
            student("a", "Ann", "Zed"),
            student("b", "Bob", "Young"),
            student("c", "Cat", "Xu"),
            student("d", "Dan", "Wu"),
            student("e", "Eve", "Vo"),
        ];
        let mut grades = GradeMap::new();
        let rows = [
            ("a", Some(18.0), false),
            ("b", Some(14.0), false),
            ("c", Some(10.0), false),
            ("d", None, true),
        ];
        for (sid, points, absent) in rows {
            grades.insert(("quiz".to_string(), sid.to_string()), GradeRecord { points, absent });
        }
        (cohort, grades)
    }

    fn adjust_to(target: f64) -> ScenarioOptions {
        ScenarioOptions {
            adjust_avg: true,
            target_avg: Some(target),
            ..ScenarioOptions::default()
        }
    }

    fn find<'a>(report: &'a ScenarioReport, id: &str) -> &'a StudentScenarios {
        report
            .students
            .iter()
            .find(|s| s.student_id == id)
            .expect("student in report")
    }

    #[test]
    fn linear_shift_caps_at_100() {
        let (cohort, grades) = sample();
        let report = compute_scenarios(&quiz(), &cohort, &grades, &adjust_to(80.0)).expect("compute");
        let avg = report.test.original_class_avg.expect("avg");
        assert!((avg - 70.0).abs() < 1e-9);

        assert!((find(&report, "a").linear.expect("a") - 100.0).abs() < 1e-9);
        assert!((find(&report, "b").linear.expect("b") - 80.0).abs() < 1e-9);
        assert!((find(&report, "c").linear.expect("c") - 60.0).abs() < 1e-9);
    }

    #[test]
    fn allow_over_100_keeps_raw_shift() {
        let (cohort, grades) = sample();
        let mut options = adjust_to(80.0);
        options.allow_over_100 = true;
        let report = compute_scenarios(&quiz(), &cohort, &grades, &options).expect("compute");
        assert!((find(&report, "a").linear.expect("a") - 100.0).abs() < 1e-9);

        let mut higher = adjust_to(90.0);
        higher.allow_over_100 = true;
        let report = compute_scenarios(&quiz(), &cohort, &grades, &higher).expect("compute");
        assert!((find(&report, "a").linear.expect("a") - 110.0).abs() < 1e-9);
    }

    #[test]
    fn typical_distribution_hits_target_average() {
        let (cohort, grades) = sample();
        let report = compute_scenarios(&quiz(), &cohort, &grades, &adjust_to(75.0)).expect("compute");
        // 90*0.85 + (75 - 70*0.85) = 92 ; 70 -> 75 ; 50 -> 58
        assert!((find(&report, "a").percentage.expect("a") - 92.0).abs() < 1e-9);
        assert!((find(&report, "b").percentage.expect("b") - 75.0).abs() < 1e-9);
        assert!((find(&report, "c").percentage.expect("c") - 58.0).abs() < 1e-9);
    }

    #[test]
    fn absent_and_ungraded_get_no_values() {
        let (cohort, grades) = sample();
        let mut options = adjust_to(80.0);
        options.boost_low = true;
        let report = compute_scenarios(&quiz(), &cohort, &grades, &options).expect("compute");
        for id in ["d", "e"] {
            let s = find(&report, id);
            assert_eq!(s.original, None);
            assert_eq!(s.linear, None);
            assert_eq!(s.percentage, None);
            assert_eq!(s.sqrt, None);
        }
    }

    #[test]
    fn report_is_sorted_by_last_name() {
        let (cohort, grades) = sample();
        let report =
            compute_scenarios(&quiz(), &cohort, &grades, &ScenarioOptions::default()).expect("compute");
        let ids: Vec<&str> = report.students.iter().map(|s| s.student_id.as_str()).collect();
        assert_eq!(ids, vec!["e", "d", "c", "b", "a"]);
    }

    #[test]
    fn adjust_without_data_is_rejected() {
        let cohort = vec![student("a", "Ann", "Zed")];
        let err = compute_scenarios(&quiz(), &cohort, &GradeMap::new(), &adjust_to(80.0))
            .expect_err("must fail");
        assert_eq!(err.code(), "bad_params");
    }

    #[test]
    fn adjust_without_target_is_rejected() {
        let (cohort, grades) = sample();
        let options = ScenarioOptions {
            adjust_avg: true,
            ..ScenarioOptions::default()
        };
        assert!(compute_scenarios(&quiz(), &cohort, &grades, &options).is_err());
    }

    #[test]
    fn sqrt_boost_without_adjust_still_reads_target() {
        let (cohort, grades) = sample();
        let options = ScenarioOptions {
            boost_low: true,
            ..ScenarioOptions::default()
        };
        let report = compute_scenarios(&quiz(), &cohort, &grades, &options).expect("compute");
        // adjust = sqrt(70)*10 - 0, so sqrt(p)*10 - adjust is negative and the
        // original + 2 floor decides.
        assert!((find(&report, "c").sqrt.expect("c") - 52.0).abs() < 1e-9);
        assert_eq!(find(&report, "c").linear, None);
    }

    #[test]
    fn sqrt_boost_lifts_low_scores_toward_target() {
        let (cohort, grades) = sample();
        let options = ScenarioOptions {
            adjust_avg: true,
            target_avg: Some(70.0),
            boost_low: true,
            ..ScenarioOptions::default()
        };
        let report = compute_scenarios(&quiz(), &cohort, &grades, &options).expect("compute");
        // sqrt(50)*10 - (sqrt(70)*10 - 70) ~= 57.04
        let c = find(&report, "c").sqrt.expect("c");
        let expected = 50.0_f64.sqrt() * 10.0 - (70.0_f64.sqrt() * 10.0 - 70.0);
        assert!((c - expected).abs() < 1e-9);
        // High scores fall back to the original + 2 floor.
        assert!((find(&report, "a").sqrt.expect("a") - 92.0).abs() < 1e-9);
    }

    #[test]
    fn sqrt_boost_respects_lowest_score() {
        let (cohort, grades) = sample();
        let options = ScenarioOptions {
            adjust_avg: true,
            target_avg: Some(70.0),
            boost_low: true,
            lowest_score: Some(65.0),
            ..ScenarioOptions::default()
        };
        let report = compute_scenarios(&quiz(), &cohort, &grades, &options).expect("compute");
        assert!((find(&report, "c").sqrt.expect("c") - 65.0).abs() < 1e-9);
        assert!((find(&report, "b").sqrt.expect("b") - 72.0).abs() < 1e-9);
    }

    #[test]
    fn plan_original_keeps_points() {
        let (cohort, grades) = sample();
        let plan = plan_apply(&quiz(), &cohort, &grades, &ScenarioOptions::default(), Scenario::Original)
            .expect("plan");
        let points: Vec<(String, f64)> = plan
            .updates
            .iter()
            .map(|u| (u.student_id.clone(), u.new_points))
            .collect();
        assert_eq!(
            points,
            vec![
                ("a".to_string(), 18.0),
                ("b".to_string(), 14.0),
                ("c".to_string(), 10.0)
            ]
        );
        assert!(plan.details.starts_with("Type: Original; Original average: 70.00"));
    }

    #[test]
    fn plan_rejects_scenario_not_enabled() {
        let (cohort, grades) = sample();
        let err = plan_apply(&quiz(), &cohort, &grades, &ScenarioOptions::default(), Scenario::Linear)
            .expect_err("linear needs adjustAvg");
        assert_eq!(err.code(), "bad_params");
    }

    #[test]
    fn plan_converts_back_to_points_rounded() {
        let (cohort, grades) = sample();
        let plan = plan_apply(&quiz(), &cohort, &grades, &adjust_to(73.333), Scenario::Linear)
            .expect("plan");
        // 50 + 3.333 = 53.333% of 20 = 10.6666 -> 10.67
        let c = plan.updates.iter().find(|u| u.student_id == "c").expect("c");
        assert_eq!(c.new_points, 10.67);
    }

    #[test]
    fn audit_details_mentions_settings() {
        let mut options = adjust_to(80.0);
        options.lowest_score = Some(50.0);
        let details = audit_details(Scenario::Linear, Some(70.0), &options);
        assert_eq!(
            details,
            "Type: Linear scaling; Original average: 70.00; New average: 80; Scores > 100% allowed: False; Lowest score allowed: 50"
        );
    }

    proptest! {
        #[test]
        fn linear_is_capped_shift(p in 0.0f64..=120.0, avg in 1.0f64..=100.0, target in 0.0f64..=100.0, allow in any::<bool>()) {
            let params = ScenarioParams::prepare(
                &ScenarioOptions { adjust_avg: true, target_avg: Some(target), allow_over_100: allow, ..ScenarioOptions::default() },
                Some(avg),
            ).expect("params");
            let d = target - avg;
            let expected = if allow { p + d } else { (p + d).min(100.0) };
            prop_assert!((params.linear(p).expect("linear") - expected).abs() < 1e-9);
        }

        #[test]
        fn sqrt_never_decreases(
            p in 0.0f64..=150.0,
            avg in 0.0f64..=100.0,
            target in proptest::option::of(0.0f64..=100.0),
            lowest in proptest::option::of(0.0f64..=100.0),
        ) {
            let params = ScenarioParams::prepare(
                &ScenarioOptions { boost_low: true, target_avg: target, lowest_score: lowest, ..ScenarioOptions::default() },
                Some(avg),
            ).expect("params");
            let v = params.sqrt(p).expect("sqrt");
            prop_assert!(v >= p + SQRT_MIN_GAIN);
            if let Some(lowest) = lowest {
                prop_assert!(v >= lowest);
            }
        }
    }
}
