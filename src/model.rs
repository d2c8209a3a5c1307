use crate::cohort::normalize_grade_label;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a teacher's tests map onto students.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TeacherMode {
    /// Every test applies to all of the teacher's students.
    Homeroom,
    /// Each test targets one classroom, picked by class name and grade label.
    Specialist,
}

impl TeacherMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "homeroom" => Some(Self::Homeroom),
            "specialist" => Some(Self::Specialist),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Homeroom => "homeroom",
            Self::Specialist => "specialist",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classroom {
    pub id: String,
    pub school_id: String,
    /// Raw stored display name. May still carry a packed `"Name (Label)"`.
    pub name: String,
    pub class_name: Option<String>,
    pub grade_label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub classroom_id: String,
    pub first_name: String,
    pub last_name: String,
}

impl Student {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// A classroom together with its students, ordered by last then first name.
#[derive(Debug, Clone)]
pub struct Roster {
    pub classroom: Classroom,
    pub students: Vec<Student>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDef {
    pub id: String,
    pub teacher_id: String,
    pub semester: String,
    pub grade_label: Option<String>,
    pub class_name: Option<String>,
    pub subject: Option<String>,
    pub competency: String,
    pub test_name: String,
    pub max_points: i64,
    pub test_date: String,
    pub test_weight: f64,
    pub scores_modified: bool,
    pub scores_modified_details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub points: Option<f64>,
    pub absent: bool,
}

impl GradeRecord {
    /// Records with neither points nor an absence are never persisted.
    pub fn is_empty(&self) -> bool {
        self.points.is_none() && !self.absent
    }
}

/// Grades keyed by `(test_id, student_id)`. A missing key means no grade row exists.
pub type GradeMap = HashMap<(String, String), GradeRecord>;

pub fn grade_for<'a>(grades: &'a GradeMap, test_id: &str, student_id: &str) -> Option<&'a GradeRecord> {
    grades.get(&(test_id.to_string(), student_id.to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightEntry {
    pub grade: String,
    pub semester: String,
    pub competency: String,
    pub weight: i64,
}

/// Competency weights keyed by grade and semester, kept in insertion order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompetencyWeightTable {
    pub entries: Vec<WeightEntry>,
}

impl CompetencyWeightTable {
    pub fn new(entries: Vec<WeightEntry>) -> Self {
        Self { entries }
    }

    /// Weights for one grade/semester context.
    ///
    /// Without a fully matching context the first grade/semester pair in
    /// insertion order is used.
    pub fn for_context(&self, grade: Option<&str>, semester: Option<&str>) -> HashMap<String, i64> {
        let chosen = match (grade, semester) {
            (Some(g), Some(s)) => self
                .entries
                .iter()
                .find(|e| {
                    normalize_grade_label(&e.grade) == normalize_grade_label(g) && e.semester == s
                })
                .or_else(|| self.entries.first()),
            _ => self.entries.first(),
        };
        let Some(chosen) = chosen else {
            return HashMap::new();
        };

        self.entries
            .iter()
            .filter(|e| e.grade == chosen.grade && e.semester == chosen.semester)
            .map(|e| (e.competency.clone(), e.weight))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(grade: &str, semester: &str, competency: &str, weight: i64) -> WeightEntry {
        WeightEntry {
            grade: grade.to_string(),
            semester: semester.to_string(),
            competency: competency.to_string(),
            weight,
        }
    }

    #[test]
    fn weight_table_uses_first_context_without_selector() {
        let table = CompetencyWeightTable::new(vec![
            entry("5", "Semester 1", "Reading", 40),
            entry("5", "Semester 1", "Writing", 60),
            entry("6", "Semester 1", "Reading", 10),
        ]);
        let w = table.for_context(None, None);
        assert_eq!(w.len(), 2);
        assert_eq!(w.get("Reading"), Some(&40));
        assert_eq!(w.get("Writing"), Some(&60));
    }

    #[test]
    fn weight_table_honours_matching_context() {
        let table = CompetencyWeightTable::new(vec![
            entry("5", "Semester 1", "Reading", 40),
            entry("6", "Semester 2", "Reading", 10),
        ]);
        let w = table.for_context(Some("Grade 6"), Some("Semester 2"));
        assert_eq!(w.get("Reading"), Some(&10));

        let fallback = table.for_context(Some("7"), Some("Semester 2"));
        assert_eq!(fallback.get("Reading"), Some(&40));
    }

    #[test]
    fn teacher_mode_parse_is_case_insensitive() {
        assert_eq!(TeacherMode::parse("Specialist"), Some(TeacherMode::Specialist));
        assert_eq!(TeacherMode::parse(" homeroom "), Some(TeacherMode::Homeroom));
        assert_eq!(TeacherMode::parse("other"), None);
    }
}
