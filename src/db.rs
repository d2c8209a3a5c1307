use crate::legacy;
use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("gradebook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schools_teacher ON schools(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classrooms(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    // Older workspaces only had the packed display name.
    ensure_classrooms_structured_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classrooms_school ON classrooms(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_classroom ON students(classroom_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_setup(
            teacher_id TEXT PRIMARY KEY,
            teacher_type TEXT NOT NULL,
            school_name TEXT NOT NULL,
            num_semesters INTEGER NOT NULL,
            grade_name TEXT,
            subject_name TEXT,
            updated_at TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS competencies(
            teacher_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY(teacher_id, sort_order),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            teacher_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY(teacher_id, sort_order),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS competency_weights(
            teacher_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            grade_key TEXT NOT NULL,
            semester_key TEXT NOT NULL,
            competency TEXT NOT NULL,
            weight INTEGER NOT NULL,
            PRIMARY KEY(teacher_id, sort_order),
            UNIQUE(teacher_id, grade_key, semester_key, competency),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tests(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            semester TEXT NOT NULL,
            grade_label TEXT,
            class_name TEXT,
            subject TEXT,
            competency TEXT NOT NULL,
            test_name TEXT NOT NULL,
            max_points INTEGER NOT NULL,
            test_date TEXT NOT NULL,
            test_weight REAL NOT NULL,
            created_at TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    ensure_tests_audit_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tests_teacher ON tests(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            test_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            points REAL,
            absent INTEGER NOT NULL DEFAULT 0,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(test_id) REFERENCES tests(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(test_id, student_id)
        )",
        [],
    )?;
    ensure_grades_modification_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_test ON grades(test_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;

    let migrated = legacy::migrate_classroom_identity(&conn)?;
    if migrated > 0 {
        tracing::info!(classrooms = migrated, "backfilled structured classroom identity");
    }
    backfill_original_points(&conn)?;

    Ok(conn)
}

fn ensure_classrooms_structured_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "classrooms", "class_name")? {
        conn.execute("ALTER TABLE classrooms ADD COLUMN class_name TEXT", [])?;
    }
    if !table_has_column(conn, "classrooms", "grade_label")? {
        conn.execute("ALTER TABLE classrooms ADD COLUMN grade_label TEXT", [])?;
    }
    if !table_has_column(conn, "classrooms", "sort_order")? {
        conn.execute(
            "ALTER TABLE classrooms ADD COLUMN sort_order INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
        // Insertion order is the tie-breaker for cohort resolution.
        conn.execute("UPDATE classrooms SET sort_order = rowid", [])?;
    }
    Ok(())
}

fn ensure_tests_audit_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "tests", "scores_modified")? {
        conn.execute(
            "ALTER TABLE tests ADD COLUMN scores_modified INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "tests", "scores_modified_details")? {
        conn.execute("ALTER TABLE tests ADD COLUMN scores_modified_details TEXT", [])?;
    }
    Ok(())
}

fn ensure_grades_modification_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "grades", "original_points")? {
        conn.execute("ALTER TABLE grades ADD COLUMN original_points REAL", [])?;
    }
    if !table_has_column(conn, "grades", "original_absent")? {
        conn.execute("ALTER TABLE grades ADD COLUMN original_absent INTEGER", [])?;
    }
    if !table_has_column(conn, "grades", "modification_type")? {
        conn.execute("ALTER TABLE grades ADD COLUMN modification_type TEXT", [])?;
    }
    if !table_has_column(conn, "grades", "modification_notes")? {
        conn.execute("ALTER TABLE grades ADD COLUMN modification_notes TEXT", [])?;
    }
    if !table_has_column(conn, "grades", "modified_at")? {
        conn.execute("ALTER TABLE grades ADD COLUMN modified_at TEXT", [])?;
    }
    Ok(())
}

fn backfill_original_points(conn: &Connection) -> anyhow::Result<()> {
    // Rows never touched by a rescale: their current score is the original.
    conn.execute(
        "UPDATE grades
         SET original_points = points, original_absent = absent
         WHERE modification_type IS NULL AND original_absent IS NULL",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
