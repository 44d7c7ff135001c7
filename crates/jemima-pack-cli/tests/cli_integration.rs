use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::{json, Value};

fn run_packctl<I, S>(root: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_packctl"))
        .current_dir(root)
        .args(["--iterations", "1000", "--pool", "packs", "--templates", "templates", "--rooms-db", "rooms.sqlite3"])
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute packctl binary: {err}"))
}

fn stdout_json(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not valid JSON: {err}\nstdout:\n{stdout}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn run_json<I, S>(root: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_packctl(root, args);
    if !output.status.success() {
        panic!(
            "packctl command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    stdout_json(&output)
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn item(round: usize, n: usize) -> Value {
    json!({"prompt": format!("R{round} Q{n}?"), "options": [format!("yes {n}"), format!("no {n}")], "correct": "B"})
}

fn write_templates(root: &Path) {
    let mut rounds = serde_json::Map::new();
    for round in 1..=5 {
        rounds.insert(
            round.to_string(),
            json!({
                "hostItems": [item(round, 1), item(round, 2), item(round, 3)],
                "guestItems": [item(round, 4), item(round, 5), item(round, 6)]
            }),
        );
    }
    let questions = json!({"version": "jemima-questions-1", "meta": {"roomCode": "AAA"}, "rounds": rounds});
    let maths = json!({
        "version": "jemima-maths-timeline-1",
        "meta": {"roomCode": "AAA"},
        "maths": {
            "events": [
                {"year": 1066, "text": "Hastings"},
                {"year": "1215", "event": "Magna Carta"},
                {"year": 1492, "text": "Columbus sails"},
                {"year": 1815, "text": "Waterloo"},
                {"year": 1969, "label": "Moon landing"}
            ],
            "question": "Add the years",
            "total": 7557
        }
    });
    let templates = root.join("templates");
    fs::create_dir_all(&templates).unwrap_or_else(|err| panic!("create templates dir: {err}"));
    for (name, value) in [("AAA-questions.json", questions), ("AAA-maths.json", maths)] {
        let body = serde_json::to_vec_pretty(&value).unwrap_or_else(|err| panic!("encode {name}: {err}"));
        fs::write(templates.join(name), body).unwrap_or_else(|err| panic!("write {name}: {err}"));
    }
}

fn sandbox() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("create sandbox: {err}"));
    write_templates(dir.path());
    dir
}

#[test]
fn generate_then_start_seeds_one_room() {
    let dir = sandbox();
    let generated = run_json(dir.path(), ["generate"]);
    assert_eq!(generated["contract_version"], "packctl.v1");
    assert_eq!(generated["created"].as_array().map(Vec::len), Some(2));

    let status = run_json(dir.path(), ["status"]);
    assert_eq!(status["available"], 1);

    let started = run_json(dir.path(), ["start"]);
    let room = as_str(&started, "roomCode");
    assert_eq!(room.len(), 3);
    assert!(as_str(&started, "questionPack").starts_with("QPACK_"));
    assert!(as_str(&started, "mathsPack").starts_with("MPACK_"));
    let used = dir.path().join("packs").join("used").join(room);
    assert_eq!(fs::read_dir(&used).map(Iterator::count).unwrap_or(0), 4);

    let status = run_json(dir.path(), ["status"]);
    assert_eq!(status["available"], 0);
    assert_eq!(status["used"], 1);
    assert_eq!(status["used_rooms"], json!([room]));
}

#[test]
fn start_on_an_empty_pool_reports_exhaustion_and_exits_zero() {
    let dir = sandbox();
    let output = run_packctl(dir.path(), ["start"]);
    assert!(output.status.success(), "exhaustion must exit 0");
    let payload = stdout_json(&output);
    assert_eq!(payload["error"], "no_packs_available");
    assert!(!dir.path().join("packs").exists());
}

#[test]
fn start_with_the_wrong_password_fails_with_a_code() {
    let dir = sandbox();
    run_json(dir.path(), ["generate"]);
    let output = run_packctl(dir.path(), ["--password", "guess", "start"]);
    assert!(!output.status.success());
    let payload = stdout_json(&output);
    assert_eq!(payload["error"], "authentication_failed");
    assert!(as_str(&payload, "message").contains("QPACK_"));

    let status = run_json(dir.path(), ["status"]);
    assert_eq!(status["available"], 1);
}

#[test]
fn seal_and_audit_an_authored_pack() {
    let dir = sandbox();
    let sealed = run_json(dir.path(), ["seal", "templates/AAA-maths.json"]);
    assert_eq!(sealed["kind"], "maths_timeline");
    assert_eq!(sealed["roomCode"], "AAA");
    let output = as_str(&sealed, "output");
    assert!(output.ends_with("AAA-maths.sealed"));

    let audit = run_json(dir.path(), ["audit", output]);
    assert_eq!(audit["version"], "jemima-maths-timeline-1");
    assert_eq!(audit["meta"]["roomCode"], "AAA");
    assert_eq!(audit["maths_ok"], true);
    assert_eq!(audit["checksum_ok"], true);
    assert_eq!(audit["rounds_count"], 0);
}

#[test]
fn seal_dir_keeps_sources_on_request() {
    let dir = sandbox();
    let sealed = run_json(dir.path(), ["seal-dir", "templates", "--keep-json"]);
    assert_eq!(sealed["sealed"].as_array().map(Vec::len), Some(2));
    assert!(dir.path().join("templates").join("AAA-maths.json").exists());
    assert!(dir.path().join("templates").join("AAA-maths.sealed").exists());
}

#[test]
fn config_file_supplies_settings() {
    let dir = sandbox();
    fs::write(dir.path().join("packctl.yaml"), "password: classroom\npbkdf2_iterations: 1000\npool_dir: elsewhere\n")
        .unwrap_or_else(|err| panic!("write config: {err}"));
    let output = Command::new(env!("CARGO_BIN_EXE_packctl"))
        .current_dir(dir.path())
        .args(["--config", "packctl.yaml", "--templates", "templates", "generate"])
        .output()
        .unwrap_or_else(|err| panic!("failed to execute packctl binary: {err}"));
    assert!(output.status.success(), "stderr:\n{}", String::from_utf8_lossy(&output.stderr));
    assert!(dir.path().join("elsewhere").join("new").exists());
}

#[test]
fn rooms_db_migrations_are_reported() {
    let dir = sandbox();
    let migrated = run_json(dir.path(), ["db", "migrate"]);
    assert_eq!(migrated["after_version"], 1);
    assert_eq!(migrated["up_to_date"], true);
    let schema = run_json(dir.path(), ["db", "schema-version"]);
    assert_eq!(schema["current_version"], 1);
}
