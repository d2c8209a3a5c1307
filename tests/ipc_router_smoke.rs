use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

#[test]
fn router_answers_envelope_errors_and_plumbing() {
    let workspace = temp_dir("gradebook-router-smoke");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));

    let before = request(
        &mut stdin,
        &mut reader,
        "2",
        "tests.list",
        json!({ "teacherId": "nobody", "semester": "Semester 1" }),
    );
    assert_eq!(error_code(&before), Some("no_workspace"));

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush garbage");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json response");
    let bad: serde_json::Value = serde_json::from_str(line.trim()).expect("parse bad_json");
    assert_eq!(error_code(&bad), Some("bad_json"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert!(workspace.join("gradebook.sqlite3").exists());

    let unknown = request(&mut stdin, &mut reader, "4", "grid.get", json!({}));
    assert_eq!(error_code(&unknown), Some("not_implemented"));

    let missing_teacher = request(
        &mut stdin,
        &mut reader,
        "5",
        "setup.get",
        json!({ "teacherId": "does-not-exist" }),
    );
    assert_eq!(error_code(&missing_teacher), Some("not_found"));

    let no_teacher_param = request(&mut stdin, &mut reader, "6", "classrooms.list", json!({}));
    assert_eq!(error_code(&no_teacher_param), Some("bad_params"));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "teachers.create",
        json!({ "firstName": "Maya", "lastName": "Lin", "email": "maya@example.org" }),
    );
    let teacher_id = created["teacherId"].as_str().expect("teacherId").to_string();

    let dup = request(
        &mut stdin,
        &mut reader,
        "8",
        "teachers.create",
        json!({ "firstName": "M", "lastName": "L", "email": "MAYA@example.org" }),
    );
    assert_eq!(error_code(&dup), Some("bad_params"));

    let setup = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "setup.save",
        json!({
            "teacherId": teacher_id,
            "teacherType": "homeroom",
            "schoolName": "North Elementary",
            "numSemesters": 2,
            "competencies": ["Reading", "Writing"],
            "subjects": ["Language"],
            "gradeName": "Grade 3",
            "weights": { "Grade 3": { "Semester 1": { "0": 40, "1": 60 } } }
        }),
    );
    assert_eq!(setup["teacherMode"].as_str(), Some("homeroom"));
    assert_eq!(setup["classroomIds"].as_array().map(|a| a.len()), Some(1));

    // Saving again reuses the same classroom.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "setup.save",
        json!({
            "teacherId": teacher_id,
            "teacherType": "homeroom",
            "schoolName": "North Elementary",
            "competencies": ["Reading", "Writing"],
            "gradeName": "Grade 3",
            "weights": [
                { "grade": "Grade 3", "semester": "Semester 1", "competency": "Reading", "weight": 40 },
                { "grade": "Grade 3", "semester": "Semester 1", "competency": "Writing", "weight": 60 }
            ]
        }),
    );
    assert_eq!(again["classroomIds"], setup["classroomIds"]);

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "setup.get",
        json!({ "teacherId": teacher_id }),
    );
    assert_eq!(got["teacherMode"].as_str(), Some("homeroom"));
    assert_eq!(got["competencies"], json!(["Reading", "Writing"]));
    assert_eq!(got["weights"][1]["competency"].as_str(), Some("Writing"));
    assert_eq!(got["weights"][1]["weight"].as_i64(), Some(60));
    assert_eq!(got["setup"]["schoolName"].as_str(), Some("North Elementary"));

    let classrooms = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "classrooms.list",
        json!({ "teacherId": teacher_id }),
    );
    let rows = classrooms["classrooms"].as_array().expect("classrooms");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["className"].as_str(), Some("Grade 3"));
    assert_eq!(rows[0]["schoolName"].as_str(), Some("North Elementary"));
    let classroom_id = rows[0]["id"].as_str().expect("classroom id").to_string();

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "students.save",
        json!({
            "teacherId": teacher_id,
            "classroomId": classroom_id,
            "students": [
                { "firstName": "Zoe", "lastName": "Adams" },
                { "firstName": "Abe", "lastName": "Young" },
                { "firstName": "Zoe", "lastName": "Adams" }
            ]
        }),
    );
    assert_eq!(saved["inserted"].as_u64(), Some(2));
    assert_eq!(saved["skipped"].as_u64(), Some(1));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "students.list",
        json!({ "teacherId": teacher_id, "classroomId": classroom_id }),
    );
    let names: Vec<&str> = listed["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["lastName"].as_str())
        .collect();
    assert_eq!(names, vec!["Adams", "Young"]);
}

#[test]
fn workspace_from_environment_is_open_at_startup() {
    let workspace = temp_dir("gradebook-env-workspace");
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .env("GRADEBOOKD_WORKSPACE", &workspace)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let mut stdin = child.stdin.take().expect("child stdin");
    let mut reader = BufReader::new(child.stdout.take().expect("child stdout"));

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(
        health["workspacePath"].as_str().map(PathBuf::from),
        Some(workspace.clone())
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "firstName": "Env", "lastName": "Teacher", "email": "env@example.org" }),
    );
    assert!(created["teacherId"].as_str().is_some());
}
