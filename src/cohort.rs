use crate::error::CoreResult;
use crate::legacy;
use crate::model::{Roster, Student, TeacherMode, TestDef};
use crate::store;
use rusqlite::Connection;
use serde::Serialize;

/// Which students a test (or a matrix filter) applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CohortScope {
    /// Every student the teacher has.
    All,
    /// The single classroom matching this class name, preferring a grade label match.
    Classroom {
        class_name: String,
        grade_label: Option<String>,
    },
}

impl CohortScope {
    pub fn for_test(test: &TestDef, mode: TeacherMode) -> Self {
        match mode {
            TeacherMode::Homeroom => Self::All,
            TeacherMode::Specialist => Self::Classroom {
                class_name: test.class_name.clone().unwrap_or_default(),
                grade_label: test.grade_label.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct Cohort {
    pub classroom_ids: Vec<String>,
    pub students: Vec<Student>,
    pub warnings: Vec<CohortWarning>,
}

impl Cohort {
    pub fn student_ids(&self) -> Vec<String> {
        self.students.iter().map(|s| s.id.clone()).collect()
    }
}

/// Strips a leading case-insensitive "grade " so "Grade 5" and "5" compare equal.
pub fn normalize_grade_label(label: &str) -> String {
    let t = label.trim();
    let lower = t.to_ascii_lowercase();
    let stripped = if lower.starts_with("grade ") { &t[6..] } else { t };
    stripped.trim().to_ascii_lowercase()
}

pub fn resolve_test_cohort(test: &TestDef, rosters: &[Roster], mode: TeacherMode) -> Cohort {
    let cohort = resolve_cohort(&CohortScope::for_test(test, mode), rosters);
    if !cohort.warnings.is_empty() {
        tracing::warn!(
            test_id = %test.id,
            class_name = test.class_name.as_deref().unwrap_or(""),
            "test has no matching classroom; cohort is empty"
        );
    }
    cohort
}

/// Loads the teacher's rosters and mode, then resolves the test's cohort.
pub fn cohort_for_test(conn: &Connection, teacher_id: &str, test: &TestDef) -> CoreResult<Cohort> {
    let mode = store::teacher_mode(conn, teacher_id)?;
    let rosters = store::rosters(conn, teacher_id)?;
    Ok(resolve_test_cohort(test, &rosters, mode))
}

/// Resolves a scope against rosters given in classroom insertion order.
/// The first matching classroom wins ties.
pub fn resolve_cohort(scope: &CohortScope, rosters: &[Roster]) -> Cohort {
    match scope {
        CohortScope::All => Cohort {
            classroom_ids: rosters.iter().map(|r| r.classroom.id.clone()).collect(),
            students: rosters.iter().flat_map(|r| r.students.iter().cloned()).collect(),
            warnings: Vec::new(),
        },
        CohortScope::Classroom {
            class_name,
            grade_label,
        } => {
            let wanted = class_name.trim();
            let name_matches: Vec<&Roster> = rosters
                .iter()
                .filter(|r| {
                    let (name, _) = legacy::structured_identity(&r.classroom);
                    !wanted.is_empty() && (name == wanted || r.classroom.name == wanted)
                })
                .collect();

            let wanted_label = grade_label
                .as_deref()
                .map(normalize_grade_label)
                .filter(|l| !l.is_empty());
            let chosen = match &wanted_label {
                Some(wanted_label) => name_matches
                    .iter()
                    .find(|r| {
                        legacy::structured_identity(&r.classroom)
                            .1
                            .map(|l| normalize_grade_label(&l) == *wanted_label)
                            .unwrap_or(false)
                    })
                    .or_else(|| name_matches.first()),
                None => name_matches.first(),
            };

            match chosen {
                Some(roster) => {
                    tracing::debug!(
                        class_name = wanted,
                        classroom_id = %roster.classroom.id,
                        students = roster.students.len(),
                        "resolved cohort classroom"
                    );
                    Cohort {
                        classroom_ids: vec![roster.classroom.id.clone()],
                        students: roster.students.clone(),
                        warnings: Vec::new(),
                    }
                }
                None => {
                    tracing::debug!(class_name = wanted, "no classroom matches class name");
                    Cohort {
                        classroom_ids: Vec::new(),
                        students: Vec::new(),
                        warnings: vec![CohortWarning {
                            code: "no_matching_classroom",
                            message: format!("no classroom named '{}'", wanted),
                        }],
                    }
                }
            }
        }
    }
}
