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

fn data_row(name: &str, total: f64, student_id: &str) -> serde_json::Value {
    json!([
        null, name, null, null, null, total, null, student_id, "course-2", "sem-2", "sy-2025", 9,
        2025
    ])
}

fn book(rows: Vec<serde_json::Value>) -> serde_json::Value {
    let mut all = vec![json!([]); 6];
    all.extend(rows);
    json!({ "sheets": [
        { "title": "Instructions", "rows": [] },
        { "title": "Biology", "rows": all }
    ]})
}

#[test]
fn preview_reports_the_import_split_without_writing() {
    let workspace = temp_dir("gradebook-preview");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.upsert",
        json!({ "subjects": [{ "id": "subj-bio", "name": "Biology" }] }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.importWorkbook",
        json!({ "workbook": book(vec![data_row("Hal", 70.0, "s1")]) }),
    );

    // s2 appears twice: the second row must preview as an update of the first.
    let next = book(vec![
        data_row("Hal", 75.0, "s1"),
        data_row("Ida", 80.0, "s2"),
        data_row("Ida", 82.0, "s2"),
    ]);
    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.previewWorkbook",
        json!({ "workbook": next }),
    );
    assert_eq!(preview.get("preview").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(preview.get("created").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(preview.get("updated").and_then(|v| v.as_u64()), Some(2));
    assert!(preview.get("runId").is_none());

    let listed = request_ok(&mut stdin, &mut reader, "5", "grades.list", json!({}));
    let grades = listed.get("grades").and_then(|v| v.as_array()).expect("grades");
    assert_eq!(grades.len(), 1);
    assert_eq!(grades[0].get("value").and_then(|v| v.as_f64()), Some(70.0));

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.importHistory",
        json!({}),
    );
    assert_eq!(
        history.get("runs").and_then(|v| v.as_array()).map(|v| v.len()),
        Some(1)
    );

    let applied = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.importWorkbook",
        json!({ "workbook": next }),
    );
    assert_eq!(applied.get("created"), preview.get("created"));
    assert_eq!(applied.get("updated"), preview.get("updated"));

    let ida = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.list",
        json!({ "studentId": "s2" }),
    );
    let ida = ida.get("grades").and_then(|v| v.as_array()).expect("grades");
    assert_eq!(ida.len(), 1);
    assert_eq!(ida[0].get("value").and_then(|v| v.as_f64()), Some(82.0));

    drop(stdin);
    let _ = child.wait();
}
