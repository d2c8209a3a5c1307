use crate::model::{grade_for, GradeMap, GradeRecord, Student, TestDef};
use serde::Serialize;
use std::collections::HashMap;

/// Display rounding to one decimal: `Int(10*x + 0.5) / 10`.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Rounds raw points to two decimals for storage.
pub fn round_points(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// `num / den`, undefined when the denominator is zero.
pub fn ratio(num: f64, den: f64) -> Option<f64> {
    if den == 0.0 {
        None
    } else {
        Some(num / den)
    }
}

/// Percentage of a grade, defined only for a present student with points.
pub fn percentage(grade: &GradeRecord, max_points: i64) -> Option<f64> {
    if grade.absent {
        return None;
    }
    let points = grade.points?;
    ratio(points, max_points as f64).map(|r| r * 100.0)
}

pub fn student_percentage(test: &TestDef, student_id: &str, grades: &GradeMap) -> Option<f64> {
    grade_for(grades, &test.id, student_id).and_then(|g| percentage(g, test.max_points))
}

/// Weighted mean over available data: items without a value contribute to
/// neither the numerator nor the denominator.
pub fn weighted_mean<I>(items: I) -> Option<f64>
where
    I: IntoIterator<Item = (Option<f64>, f64)>,
{
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for (value, weight) in items {
        let Some(value) = value else {
            continue;
        };
        sum += value * weight;
        denom += weight;
    }
    ratio(sum, denom)
}

/// Mean of the defined percentages across the cohort.
pub fn class_average(test: &TestDef, cohort: &[Student], grades: &GradeMap) -> Option<f64> {
    weighted_mean(
        cohort
            .iter()
            .map(|s| (student_percentage(test, &s.id, grades), 1.0)),
    )
}

/// Competencies in order of first appearance among `tests`.
pub fn competency_order(tests: &[TestDef]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for t in tests {
        if !out.iter().any(|c| *c == t.competency) {
            out.push(t.competency.clone());
        }
    }
    out
}

pub fn competency_total(
    student_id: &str,
    competency: &str,
    tests: &[TestDef],
    grades: &GradeMap,
) -> Option<f64> {
    weighted_mean(
        tests
            .iter()
            .filter(|t| t.competency == competency)
            .map(|t| (student_percentage(t, student_id, grades), t.test_weight)),
    )
}

/// Weighted mean of the student's defined competency totals. Competencies
/// without a configured weight count with weight zero.
pub fn grand_total(
    student_id: &str,
    tests: &[TestDef],
    grades: &GradeMap,
    competency_weights: &HashMap<String, i64>,
) -> Option<f64> {
    weighted_mean(competency_order(tests).iter().map(|c| {
        (
            competency_total(student_id, c, tests, grades),
            competency_weights.get(c).copied().unwrap_or(0) as f64,
        )
    }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetencyTotal {
    pub competency: String,
    pub weight: i64,
    pub total: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAggregate {
    pub student_id: String,
    pub competencies: Vec<CompetencyTotal>,
    pub grand_total: Option<f64>,
}

pub fn student_aggregate(
    student_id: &str,
    tests: &[TestDef],
    grades: &GradeMap,
    competency_weights: &HashMap<String, i64>,
) -> StudentAggregate {
    let competencies = competency_order(tests)
        .into_iter()
        .map(|c| CompetencyTotal {
            total: competency_total(student_id, &c, tests, grades),
            weight: competency_weights.get(&c).copied().unwrap_or(0),
            competency: c,
        })
        .collect();
    StudentAggregate {
        student_id: student_id.to_string(),
        competencies,
        grand_total: grand_total(student_id, tests, grades, competency_weights),
    }
}
