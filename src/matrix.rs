//! Student-by-test grid with per-competency and grand-total aggregates, and
//! its spreadsheet rendering with live formulas.
//!
//! Formula cells carry the value computed by `calc`, so the sheet and the
//! aggregator cannot disagree.

use crate::calc::{self, round_off_1_decimal, weighted_mean};
use crate::error::CoreResult;
use crate::model::{grade_for, GradeMap, Student, TestDef};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub const MAX_POINTS_ROW: usize = 2;
pub const TEST_WEIGHT_ROW: usize = 3;
pub const COMPETENCY_WEIGHT_ROW: usize = 4;
pub const FIRST_STUDENT_ROW: usize = 6;

#[derive(Debug, Clone)]
pub struct AggregateMatrix {
    pub tests: Vec<TestDef>,
    pub students: Vec<Student>,
    pub grades: GradeMap,
    pub competency_weights: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestAverage {
    pub test_id: String,
    pub class_average: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAverageRow {
    pub tests: Vec<TestAverage>,
    pub competencies: Vec<calc::CompetencyTotal>,
    pub grand_total: Option<f64>,
}

impl AggregateMatrix {
    pub fn competencies(&self) -> Vec<String> {
        calc::competency_order(&self.tests)
    }

    fn competency_weight(&self, competency: &str) -> i64 {
        self.competency_weights.get(competency).copied().unwrap_or(0)
    }

    /// Points shown in a student's cell. Absent students show nothing.
    pub fn cell_points(&self, test: &TestDef, student_id: &str) -> Option<f64> {
        grade_for(&self.grades, &test.id, student_id)
            .filter(|g| !g.absent)
            .and_then(|g| g.points)
    }

    pub fn student_aggregates(&self) -> Vec<calc::StudentAggregate> {
        self.students
            .iter()
            .map(|s| calc::student_aggregate(&s.id, &self.tests, &self.grades, &self.competency_weights))
            .collect()
    }

    /// Same weighted-mean rule as a student row, applied to per-test class averages.
    pub fn class_average_row(&self) -> ClassAverageRow {
        let tests: Vec<TestAverage> = self
            .tests
            .iter()
            .map(|t| TestAverage {
                test_id: t.id.clone(),
                class_average: calc::class_average(t, &self.students, &self.grades),
            })
            .collect();

        let competencies: Vec<calc::CompetencyTotal> = self
            .competencies()
            .into_iter()
            .map(|c| {
                let total = weighted_mean(
                    self.tests
                        .iter()
                        .zip(&tests)
                        .filter(|(t, _)| t.competency == c)
                        .map(|(t, avg)| (avg.class_average, t.test_weight)),
                );
                calc::CompetencyTotal {
                    weight: self.competency_weight(&c),
                    competency: c,
                    total,
                }
            })
            .collect();

        let grand_total = weighted_mean(
            competencies
                .iter()
                .map(|c| (c.total, c.weight as f64)),
        );

        ClassAverageRow {
            tests,
            competencies,
            grand_total,
        }
    }

    /// `{studentId: {testId: points}}` for every stored grade row.
    pub fn grades_by_student(&self) -> BTreeMap<String, BTreeMap<String, Option<f64>>> {
        let mut out: BTreeMap<String, BTreeMap<String, Option<f64>>> = BTreeMap::new();
        for ((test_id, student_id), g) in &self.grades {
            out.entry(student_id.clone())
                .or_default()
                .insert(test_id.clone(), if g.absent { None } else { g.points });
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Cell {
    Empty,
    Text {
        text: String,
    },
    Number {
        value: f64,
    },
    Formula {
        formula: String,
        value: Option<f64>,
        display: String,
    },
}

impl Cell {
    fn text(s: impl Into<String>) -> Self {
        Self::Text { text: s.into() }
    }

    fn number(v: f64) -> Self {
        Self::Number { value: v }
    }

    fn percent(formula: String, value: Option<f64>) -> Self {
        let display = value
            .map(|v| format!("{:.1}%", round_off_1_decimal(v)))
            .unwrap_or_default();
        Self::Formula {
            formula,
            value,
            display,
        }
    }

    /// Text written to a spreadsheet cell; formulas stay live.
    pub fn sheet_text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text { text } => text.clone(),
            Self::Number { value } => value.to_string(),
            Self::Formula { formula, .. } => formula.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Sheet {
    pub rows: Vec<Vec<Cell>>,
}

impl Sheet {
    pub fn write_csv(&self, path: &Path) -> CoreResult<()> {
        let mut wtr = csv::WriterBuilder::new().flexible(true).from_path(path)?;
        for row in &self.rows {
            wtr.write_record(row.iter().map(Cell::sheet_text))?;
        }
        wtr.flush().map_err(csv::Error::from)?;
        Ok(())
    }
}

/// Spreadsheet column letters for a zero-based index: 0 => "A", 26 => "AA".
pub fn column_letter(idx: usize) -> String {
    let mut n = idx + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn competency_formula(row: usize, test_cols: &[String]) -> String {
    let nums: Vec<String> = test_cols
        .iter()
        .map(|c| {
            format!(
                "IF(ISNUMBER({c}{row}),{c}{row}/{c}${max}*{c}${w},0)",
                c = c,
                row = row,
                max = MAX_POINTS_ROW,
                w = TEST_WEIGHT_ROW
            )
        })
        .collect();
    let dens: Vec<String> = test_cols
        .iter()
        .map(|c| format!("IF(ISNUMBER({c}{row}),{c}${w},0)", c = c, row = row, w = TEST_WEIGHT_ROW))
        .collect();
    format!(
        "=IF(({den})=0,\"\",({num})/({den})*100)",
        num = nums.join("+"),
        den = dens.join("+")
    )
}

fn grand_total_formula(row: usize, competency_cols: &[String]) -> String {
    let nums: Vec<String> = competency_cols
        .iter()
        .map(|c| {
            format!(
                "IF(ISNUMBER({c}{row}),{c}{row}*{c}${w},0)",
                c = c,
                row = row,
                w = COMPETENCY_WEIGHT_ROW
            )
        })
        .collect();
    let dens: Vec<String> = competency_cols
        .iter()
        .map(|c| {
            format!(
                "IF(ISNUMBER({c}{row}),{c}${w},0)",
                c = c,
                row = row,
                w = COMPETENCY_WEIGHT_ROW
            )
        })
        .collect();
    format!(
        "=IF(({den})=0,\"\",({num})/({den}))",
        num = nums.join("+"),
        den = dens.join("+")
    )
}

/// Lays the matrix out as: test name, max points, test weight and
/// competency weight rows, a header row, one row per student, and a trailing
/// class average row.
pub fn render_sheet(matrix: &AggregateMatrix) -> Sheet {
    let competencies = matrix.competencies();
    let with_grand_total = competencies.len() > 1;

    let test_col = |i: usize| column_letter(1 + i);
    let competency_col = |i: usize| column_letter(1 + matrix.tests.len() + i);

    let cols_for: Vec<Vec<String>> = competencies
        .iter()
        .map(|c| {
            matrix
                .tests
                .iter()
                .enumerate()
                .filter(|(_, t)| t.competency == *c)
                .map(|(i, _)| test_col(i))
                .collect()
        })
        .collect();
    let competency_cols: Vec<String> = (0..competencies.len()).map(competency_col).collect();

    let mut rows: Vec<Vec<Cell>> = Vec::new();

    let mut names = vec![Cell::text("Test Name")];
    let mut max_points = vec![Cell::text("Max Points")];
    let mut test_weights = vec![Cell::text("Test Weight")];
    let mut competency_weights = vec![Cell::text("Competency Weight")];
    let mut header = vec![Cell::text("Student")];
    for t in &matrix.tests {
        names.push(Cell::text(t.test_name.clone()));
        max_points.push(Cell::number(t.max_points as f64));
        test_weights.push(Cell::number(t.test_weight));
        competency_weights.push(Cell::number(matrix.competency_weight(&t.competency) as f64));
        header.push(Cell::text(format!("{} ({})", t.competency, t.test_date)));
    }
    for c in &competencies {
        names.push(Cell::text("Competency Total"));
        max_points.push(Cell::Empty);
        test_weights.push(Cell::Empty);
        competency_weights.push(Cell::number(matrix.competency_weight(c) as f64));
        header.push(Cell::text(format!("{} %", c)));
    }
    if with_grand_total {
        names.push(Cell::text("Grand Total"));
        max_points.push(Cell::Empty);
        test_weights.push(Cell::Empty);
        competency_weights.push(Cell::Empty);
        header.push(Cell::text("Grand Total %"));
    }
    rows.push(names);
    rows.push(max_points);
    rows.push(test_weights);
    rows.push(competency_weights);
    rows.push(header);

    for (i, (student, agg)) in matrix
        .students
        .iter()
        .zip(matrix.student_aggregates())
        .enumerate()
    {
        let row = FIRST_STUDENT_ROW + i;
        let mut cells = vec![Cell::text(student.full_name())];
        for t in &matrix.tests {
            cells.push(match matrix.cell_points(t, &student.id) {
                Some(p) => Cell::number(p),
                None => Cell::Empty,
            });
        }
        for (ci, total) in agg.competencies.iter().enumerate() {
            cells.push(Cell::percent(competency_formula(row, &cols_for[ci]), total.total));
        }
        if with_grand_total {
            cells.push(Cell::percent(
                grand_total_formula(row, &competency_cols),
                agg.grand_total,
            ));
        }
        rows.push(cells);
    }

    let avg_row = FIRST_STUDENT_ROW + matrix.students.len();
    let class_row = matrix.class_average_row();
    let mut cells = vec![Cell::text("Class Average")];
    for (i, (t, avg)) in matrix.tests.iter().zip(&class_row.tests).enumerate() {
        if matrix.students.is_empty() {
            cells.push(Cell::Empty);
            continue;
        }
        let col = test_col(i);
        let range = format!("{c}{first}:{c}{last}", c = col, first = FIRST_STUDENT_ROW, last = avg_row - 1);
        let value = avg.class_average.map(|pct| pct / 100.0 * t.max_points as f64);
        cells.push(Cell::Formula {
            formula: format!("=IF(COUNT({r})=0,\"\",AVERAGE({r}))", r = range),
            value,
            display: value.map(|v| format!("{:.2}", v)).unwrap_or_default(),
        });
    }
    for (ci, total) in class_row.competencies.iter().enumerate() {
        cells.push(Cell::percent(competency_formula(avg_row, &cols_for[ci]), total.total));
    }
    if with_grand_total {
        cells.push(Cell::percent(
            grand_total_formula(avg_row, &competency_cols),
            class_row.grand_total,
        ));
    }
    rows.push(cells);

    Sheet { rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GradeRecord;

    fn test_def(id: &str, competency: &str, max_points: i64, weight: f64) -> TestDef {
        TestDef {
            id: id.to_string(),
            teacher_id: "t".to_string(),
            semester: "Semester 1".to_string(),
            grade_label: None,
            class_name: None,
            subject: None,
            competency: competency.to_string(),
            test_name: format!("Test {}", id),
            max_points,
            test_date: "2025-01-01".to_string(),
            test_weight: weight,
            scores_modified: false,
            scores_modified_details: None,
        }
    }

    fn student(id: &str) -> Student {
        Student {
            id: id.to_string(),
            classroom_id: "c".to_string(),
            first_name: id.to_uppercase(),
            last_name: "Doe".to_string(),
        }
    }

    fn sample() -> AggregateMatrix {
        let tests = vec![
            test_def("r1", "Reading", 10, 1.0),
            test_def("w1", "Writing", 20, 1.0),
            test_def("r2", "Reading", 10, 3.0),
        ];
        let mut grades = GradeMap::new();
        let rows = [
            ("r1", "a", Some(10.0), false),
            ("r2", "a", None, false),
            ("w1", "a", Some(10.0), false),
            ("r1", "b", Some(5.0), false),
            ("r2", "b", Some(8.0), false),
            ("w1", "b", Some(20.0), true),
        ];
        for (t, s, points, absent) in rows {
            grades.insert((t.to_string(), s.to_string()), GradeRecord { points, absent });
        }
        AggregateMatrix {
            tests,
            students: vec![student("a"), student("b")],
            grades,
            competency_weights: [("Reading".to_string(), 2), ("Writing".to_string(), 1)]
                .into_iter()
                .collect(),
        }
    }

    fn formula_value(cell: &Cell) -> Option<f64> {
        match cell {
            Cell::Formula { value, .. } => *value,
            other => panic!("expected formula, got {:?}", other),
        }
    }

    #[test]
    fn column_letters() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(27), "AB");
        assert_eq!(column_letter(701), "ZZ");
        assert_eq!(column_letter(702), "AAA");
    }

    #[test]
    fn layout_has_meta_rows_students_and_class_average() {
        let sheet = render_sheet(&sample());
        assert_eq!(sheet.rows.len(), 5 + 2 + 1);
        assert_eq!(sheet.rows[0][0], Cell::text("Test Name"));
        assert_eq!(sheet.rows[1][0], Cell::text("Max Points"));
        assert_eq!(sheet.rows[2][0], Cell::text("Test Weight"));
        assert_eq!(sheet.rows[3][0], Cell::text("Competency Weight"));
        assert_eq!(sheet.rows[4][0], Cell::text("Student"));
        assert_eq!(sheet.rows[7][0], Cell::text("Class Average"));
        // label + 3 tests + 2 competencies + grand total
        assert!(sheet.rows.iter().all(|r| r.len() == 7));
        assert_eq!(sheet.rows[1][2], Cell::number(20.0));
        assert_eq!(sheet.rows[3][4], Cell::number(2.0));
    }

    #[test]
    fn competency_cells_match_aggregator() {
        let m = sample();
        let sheet = render_sheet(&m);
        let a_row = &sheet.rows[5];
        // Reading for a: r2 ungraded, so 100%.
        assert!((formula_value(&a_row[4]).expect("reading") - 100.0).abs() < 1e-9);
        assert!((formula_value(&a_row[5]).expect("writing") - 50.0).abs() < 1e-9);
        // (100*2 + 50*1) / 3
        let grand = formula_value(&a_row[6]).expect("grand");
        assert!((grand - 250.0 / 3.0).abs() < 1e-9);

        let b_row = &sheet.rows[6];
        // absent writing score renders blank and drops out
        assert_eq!(b_row[2], Cell::Empty);
        assert_eq!(formula_value(&b_row[5]), None);
        // (50*1 + 80*3) / 4
        assert!((formula_value(&b_row[4]).expect("reading") - 72.5).abs() < 1e-9);
        assert!((formula_value(&b_row[6]).expect("grand") - 72.5).abs() < 1e-9);

        for (agg, row) in m.student_aggregates().iter().zip(&sheet.rows[5..7]) {
            assert_eq!(agg.competencies[0].total, formula_value(&row[4]));
            assert_eq!(agg.grand_total, formula_value(&row[6]));
        }
    }

    #[test]
    fn competency_formula_references_only_its_columns() {
        let sheet = render_sheet(&sample());
        let Cell::Formula { formula, .. } = &sheet.rows[5][4] else {
            panic!("expected formula");
        };
        assert_eq!(
            formula,
            "=IF((IF(ISNUMBER(B6),B$3,0)+IF(ISNUMBER(D6),D$3,0))=0,\"\",\
             (IF(ISNUMBER(B6),B6/B$2*B$3,0)+IF(ISNUMBER(D6),D6/D$2*D$3,0))/\
             (IF(ISNUMBER(B6),B$3,0)+IF(ISNUMBER(D6),D$3,0))*100)"
        );
    }

    #[test]
    fn class_average_row_uses_per_test_averages() {
        let m = sample();
        let sheet = render_sheet(&m);
        let avg = &sheet.rows[7];
        let Cell::Formula { formula, value, .. } = &avg[1] else {
            panic!("expected formula");
        };
        assert_eq!(formula, "=IF(COUNT(B6:B7)=0,\"\",AVERAGE(B6:B7))");
        assert!((value.expect("r1 avg") - 7.5).abs() < 1e-9);
        // r1 avg 75% (w1), r2 avg 80% (w3) => 78.75
        assert!((formula_value(&avg[4]).expect("reading") - 78.75).abs() < 1e-9);
    }

    #[test]
    fn single_competency_has_no_grand_total_column() {
        let mut m = sample();
        m.tests.retain(|t| t.competency == "Reading");
        let sheet = render_sheet(&m);
        assert!(sheet.rows.iter().all(|r| r.len() == 4));
    }

    #[test]
    fn empty_cohort_renders_blank_averages() {
        let mut m = sample();
        m.students.clear();
        let sheet = render_sheet(&m);
        assert_eq!(sheet.rows.len(), 6);
        assert_eq!(sheet.rows[5][1], Cell::Empty);
        assert_eq!(formula_value(&sheet.rows[5][4]), None);
    }

    #[test]
    fn grades_by_student_blanks_absent_rows() {
        let m = sample();
        let by_student = m.grades_by_student();
        assert_eq!(by_student["b"]["w1"], None);
        assert_eq!(by_student["b"]["r2"], Some(8.0));
    }
}
