//! Typed reads against the workspace database. Every query is scoped to an
//! explicit teacher id.

use crate::cohort::normalize_grade_label;
use crate::error::{CoreError, CoreResult};
use crate::model::{
    Classroom, CompetencyWeightTable, GradeMap, GradeRecord, Roster, Student, TeacherMode, TestDef,
    WeightEntry,
};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde::Deserialize;

pub fn require_teacher(conn: &Connection, teacher_id: &str) -> CoreResult<()> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| r.get(0))
        .optional()?;
    exists
        .map(|_| ())
        .ok_or_else(|| CoreError::not_found("teacher not found"))
}

/// Teacher mode from setup. Without setup, more than one classroom means specialist.
pub fn teacher_mode(conn: &Connection, teacher_id: &str) -> CoreResult<TeacherMode> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT teacher_type FROM teacher_setup WHERE teacher_id = ?",
            [teacher_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(mode) = stored.as_deref().and_then(TeacherMode::parse) {
        return Ok(mode);
    }

    let classroom_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM classrooms c JOIN schools s ON s.id = c.school_id WHERE s.teacher_id = ?",
        [teacher_id],
        |r| r.get(0),
    )?;
    Ok(if classroom_count > 1 {
        TeacherMode::Specialist
    } else {
        TeacherMode::Homeroom
    })
}

fn classroom_from_row(r: &Row<'_>) -> rusqlite::Result<Classroom> {
    Ok(Classroom {
        id: r.get(0)?,
        school_id: r.get(1)?,
        name: r.get(2)?,
        class_name: r.get(3)?,
        grade_label: r.get(4)?,
    })
}

/// All of a teacher's classrooms in insertion order.
pub fn classrooms(conn: &Connection, teacher_id: &str) -> CoreResult<Vec<Classroom>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.school_id, c.name, c.class_name, c.grade_label
         FROM classrooms c
         JOIN schools s ON s.id = c.school_id
         WHERE s.teacher_id = ?
         ORDER BY c.sort_order, c.rowid",
    )?;
    let rows = stmt
        .query_map([teacher_id], classroom_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn classroom(conn: &Connection, teacher_id: &str, classroom_id: &str) -> CoreResult<Classroom> {
    conn.query_row(
        "SELECT c.id, c.school_id, c.name, c.class_name, c.grade_label
         FROM classrooms c
         JOIN schools s ON s.id = c.school_id
         WHERE c.id = ? AND s.teacher_id = ?",
        (classroom_id, teacher_id),
        classroom_from_row,
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found("classroom not found"))
}

fn student_from_row(r: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: r.get(0)?,
        classroom_id: r.get(1)?,
        first_name: r.get(2)?,
        last_name: r.get(3)?,
    })
}

pub fn students_in_classroom(conn: &Connection, classroom_id: &str) -> CoreResult<Vec<Student>> {
    let mut stmt = conn.prepare(
        "SELECT id, classroom_id, first_name, last_name
         FROM students
         WHERE classroom_id = ?
         ORDER BY last_name, first_name, rowid",
    )?;
    let rows = stmt
        .query_map([classroom_id], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn student(conn: &Connection, teacher_id: &str, student_id: &str) -> CoreResult<Student> {
    conn.query_row(
        "SELECT st.id, st.classroom_id, st.first_name, st.last_name
         FROM students st
         JOIN classrooms c ON c.id = st.classroom_id
         JOIN schools s ON s.id = c.school_id
         WHERE st.id = ? AND s.teacher_id = ?",
        (student_id, teacher_id),
        student_from_row,
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found("student not found"))
}

/// Every classroom of the teacher with its students.
pub fn rosters(conn: &Connection, teacher_id: &str) -> CoreResult<Vec<Roster>> {
    classrooms(conn, teacher_id)?
        .into_iter()
        .map(|classroom| {
            let students = students_in_classroom(conn, &classroom.id)?;
            Ok(Roster {
                classroom,
                students,
            })
        })
        .collect()
}

const TEST_COLUMNS: &str = "id, teacher_id, semester, grade_label, class_name, subject, competency,
     test_name, max_points, test_date, test_weight, scores_modified, scores_modified_details";

fn test_from_row(r: &Row<'_>) -> rusqlite::Result<TestDef> {
    Ok(TestDef {
        id: r.get(0)?,
        teacher_id: r.get(1)?,
        semester: r.get(2)?,
        grade_label: r.get(3)?,
        class_name: r.get(4)?,
        subject: r.get(5)?,
        competency: r.get(6)?,
        test_name: r.get(7)?,
        max_points: r.get(8)?,
        test_date: r.get(9)?,
        test_weight: r.get(10)?,
        scores_modified: r.get::<_, i64>(11)? != 0,
        scores_modified_details: r.get(12)?,
    })
}

pub fn test(conn: &Connection, teacher_id: &str, test_id: &str) -> CoreResult<TestDef> {
    let sql = format!(
        "SELECT {} FROM tests WHERE id = ? AND teacher_id = ?",
        TEST_COLUMNS
    );
    conn.query_row(&sql, (test_id, teacher_id), test_from_row)
        .optional()?
        .ok_or_else(|| CoreError::not_found("test not found"))
}

/// Filters shared by test listings and the aggregate matrix. Empty strings
/// are treated as absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFilters {
    pub semester: Option<String>,
    pub class_name: Option<String>,
    pub grade_label: Option<String>,
    pub subject: Option<String>,
    pub competency: Option<String>,
}

impl TestFilters {
    pub fn normalized(self) -> Self {
        fn clean(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }
        Self {
            semester: clean(self.semester),
            class_name: clean(self.class_name),
            grade_label: clean(self.grade_label),
            subject: clean(self.subject),
            competency: clean(self.competency),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOrder {
    OldestFirst,
    NewestFirst,
}

pub fn tests(
    conn: &Connection,
    teacher_id: &str,
    filters: &TestFilters,
    order: TestOrder,
) -> CoreResult<Vec<TestDef>> {
    let mut sql = format!("SELECT {} FROM tests WHERE teacher_id = ?", TEST_COLUMNS);
    let mut bind: Vec<Value> = vec![Value::Text(teacher_id.to_string())];
    let clauses = [
        ("semester", &filters.semester),
        ("class_name", &filters.class_name),
        ("subject", &filters.subject),
        ("competency", &filters.competency),
    ];
    for (column, value) in clauses {
        if let Some(v) = value {
            sql.push_str(&format!(" AND {} = ?", column));
            bind.push(Value::Text(v.clone()));
        }
    }
    sql.push_str(match order {
        TestOrder::OldestFirst => " ORDER BY test_date, created_at, rowid",
        TestOrder::NewestFirst => " ORDER BY test_date DESC, created_at DESC, rowid DESC",
    });

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind), test_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    let Some(wanted) = filters.grade_label.as_deref().map(normalize_grade_label) else {
        return Ok(rows);
    };
    Ok(rows
        .into_iter()
        .filter(|t| grade_label_matches(t.grade_label.as_deref(), &wanted))
        .collect())
}

/// Grade labels compare the way the cohort resolver compares them. Tests
/// without a label belong to every grade.
fn grade_label_matches(label: Option<&str>, wanted: &str) -> bool {
    match label.map(normalize_grade_label) {
        Some(l) if !l.is_empty() => l == wanted,
        _ => true,
    }
}

/// Grades for the given tests and students.
pub fn grades(conn: &Connection, test_ids: &[String], student_ids: &[String]) -> CoreResult<GradeMap> {
    let mut out = GradeMap::new();
    if test_ids.is_empty() || student_ids.is_empty() {
        return Ok(out);
    }

    let test_placeholders = vec!["?"; test_ids.len()].join(",");
    let student_placeholders = vec!["?"; student_ids.len()].join(",");
    let sql = format!(
        "SELECT test_id, student_id, points, absent
         FROM grades
         WHERE test_id IN ({}) AND student_id IN ({})",
        test_placeholders, student_placeholders
    );
    let mut bind_values: Vec<Value> = Vec::with_capacity(test_ids.len() + student_ids.len());
    for id in test_ids {
        bind_values.push(Value::Text(id.clone()));
    }
    for id in student_ids {
        bind_values.push(Value::Text(id.clone()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(bind_values), |r| {
        let test_id: String = r.get(0)?;
        let student_id: String = r.get(1)?;
        let points: Option<f64> = r.get(2)?;
        let absent: i64 = r.get(3)?;
        Ok((test_id, student_id, points, absent != 0))
    })?;
    for row in rows {
        let (test_id, student_id, points, absent) = row?;
        out.insert((test_id, student_id), GradeRecord { points, absent });
    }
    Ok(out)
}

pub fn competency_weights(conn: &Connection, teacher_id: &str) -> CoreResult<CompetencyWeightTable> {
    let mut stmt = conn.prepare(
        "SELECT grade_key, semester_key, competency, weight
         FROM competency_weights
         WHERE teacher_id = ?
         ORDER BY sort_order",
    )?;
    let entries = stmt
        .query_map([teacher_id], |r| {
            Ok(WeightEntry {
                grade: r.get(0)?,
                semester: r.get(1)?,
                competency: r.get(2)?,
                weight: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CompetencyWeightTable::new(entries))
}

pub fn ordered_names(conn: &Connection, table: &str, teacher_id: &str) -> CoreResult<Vec<String>> {
    let sql = format!(
        "SELECT name FROM {} WHERE teacher_id = ? ORDER BY sort_order",
        table
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([teacher_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
