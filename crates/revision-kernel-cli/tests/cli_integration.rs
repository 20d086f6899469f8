use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use revision_kernel_core::{AttributeMap, ItemId, NewRevision, RevisionEvent};
use revision_kernel_store_sqlite::RevisionStore;
use serde_json::Value;
use time::{Duration, OffsetDateTime};

const SIGNING_KEY_HEX: &str = "8f3a1bd2c4e5f60718293a4b5c6d7e8f9fa0b1c2d3e4f5061728394a5b6c7d8e";

fn unique_temp_path(prefix: &str, suffix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}{suffix}", ulid::Ulid::new()))
}

fn run_rvk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rvk"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rvk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rvk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rvk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn fixture_base() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::days(19_000)
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|err| panic!("failed to format fixture timestamp: {err}"))
}

fn seed_widget_trail(db_path: &Path) {
    let mut store = RevisionStore::open(db_path)
        .unwrap_or_else(|err| panic!("failed to open seed store: {err}"));
    store.migrate().unwrap_or_else(|err| panic!("failed to migrate seed store: {err}"));

    let base = fixture_base();
    let item_id = ItemId::from("42");
    let revisions = [
        NewRevision {
            item_type: "Widget".to_string(),
            item_id: item_id.clone(),
            event: RevisionEvent::Create,
            recorded_at: base,
            object: None,
            object_changes: None,
            whodunnit: Some("Alice".to_string()),
            metadata: AttributeMap::new(),
        },
        NewRevision {
            item_type: "Widget".to_string(),
            item_id,
            event: RevisionEvent::Update,
            recorded_at: base + Duration::seconds(60),
            object: Some(
                r#"{"name":{"type":"text","value":"A"}}"#.to_string(),
            ),
            object_changes: Some(
                r#"{"name":{"before":{"type":"text","value":"A"},"after":{"type":"text","value":"B"}}}"#.to_string(),
            ),
            whodunnit: Some("Bob".to_string()),
            metadata: AttributeMap::new(),
        },
    ];
    for revision in &revisions {
        store
            .append(revision)
            .unwrap_or_else(|err| panic!("failed to seed revision: {err}"));
    }
}

// Test IDs: TCLI-001
#[test]
fn db_migrate_and_schema_version_round_trip() {
    let db_path = unique_temp_path("revisionkernel-cli-db", ".sqlite3");
    let db = path_str(&db_path);

    let migrated = run_json(["--db", db, "db", "migrate"]);
    assert_eq!(migrated.get("contract_version").and_then(Value::as_str), Some("cli.v1"));
    assert_eq!(migrated.get("after_version").and_then(Value::as_i64), Some(2));
    assert_eq!(migrated.get("up_to_date").and_then(Value::as_bool), Some(true));

    let status = run_json(["--db", db, "db", "schema-version"]);
    assert_eq!(status.get("current_version").and_then(Value::as_i64), Some(2));
    assert_eq!(status.get("table").and_then(Value::as_str), Some("revisions"));

    let _ = fs::remove_file(&db_path);
}

// Test IDs: TCLI-002
#[test]
fn trail_list_show_and_changeset_read_a_seeded_trail() {
    let db_path = unique_temp_path("revisionkernel-cli-trail", ".sqlite3");
    seed_widget_trail(&db_path);
    let db = path_str(&db_path);

    let listed =
        run_json(["--db", db, "trail", "list", "--item-type", "Widget", "--item-id", "42"]);
    let revisions = listed
        .get("revisions")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing revisions array: {listed}"));
    assert_eq!(revisions.len(), 2);
    assert_eq!(as_str(&revisions[0], "event"), "create");
    assert_eq!(as_str(&revisions[1], "event"), "update");

    let updates = run_json([
        "--db",
        db,
        "trail",
        "list",
        "--item-type",
        "Widget",
        "--item-id",
        "42",
        "--event",
        "update",
    ]);
    let updates = updates
        .get("revisions")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing revisions array: {updates}"));
    assert_eq!(updates.len(), 1);

    let update_id = updates[0]
        .get("id")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing revision id: {}", updates[0]))
        .to_string();

    let shown = run_json(["--db", db, "trail", "show", "--id", update_id.as_str()]);
    assert_eq!(shown.get("index").and_then(Value::as_i64), Some(1));
    let decoded_name = shown.pointer("/decoded_object/name/value").and_then(Value::as_str);
    assert_eq!(decoded_name, Some("A"));

    let changes = run_json(["--db", db, "trail", "changeset", "--id", update_id.as_str()]);
    assert_eq!(changes.get("supported").and_then(Value::as_bool), Some(true));
    assert_eq!(changes.pointer("/changeset/name/before/value").and_then(Value::as_str), Some("A"));
    assert_eq!(changes.pointer("/changeset/name/after/value").and_then(Value::as_str), Some("B"));

    let _ = fs::remove_file(&db_path);
}

// Test IDs: TCLI-003
#[test]
fn state_at_reports_absent_historical_and_live() {
    let db_path = unique_temp_path("revisionkernel-cli-state", ".sqlite3");
    seed_widget_trail(&db_path);
    let db = path_str(&db_path);
    let base = fixture_base();

    let before = rfc3339(base - Duration::seconds(10));
    let before_creation = run_json([
        "--db",
        db,
        "trail",
        "state-at",
        "--item-type",
        "Widget",
        "--item-id",
        "42",
        "--at",
        before.as_str(),
    ]);
    assert_eq!(as_str(&before_creation, "status"), "absent");

    let middle = rfc3339(base + Duration::seconds(30));
    let mid = run_json([
        "--db",
        db,
        "trail",
        "state-at",
        "--item-type",
        "Widget",
        "--item-id",
        "42",
        "--at",
        middle.as_str(),
    ]);
    assert_eq!(as_str(&mid, "status"), "historical");
    assert_eq!(mid.pointer("/attributes/name/value").and_then(Value::as_str), Some("A"));

    let later = rfc3339(base + Duration::seconds(120));
    let after = run_json([
        "--db",
        db,
        "trail",
        "state-at",
        "--item-type",
        "Widget",
        "--item-id",
        "42",
        "--at",
        later.as_str(),
    ]);
    assert_eq!(as_str(&after, "status"), "live");

    let _ = fs::remove_file(&db_path);
}

// Test IDs: TCLI-004
#[test]
fn unsigned_imports_require_an_explicit_override() {
    let db_path = unique_temp_path("revisionkernel-cli-export", ".sqlite3");
    seed_widget_trail(&db_path);
    let db = path_str(&db_path);
    let out_dir = unique_temp_path("revisionkernel-cli-export-out", "");
    let out = path_str(&out_dir);

    let exported = run_json(["--db", db, "db", "export", "--out", out]);
    assert!(exported.get("signature_algorithm").is_some_and(Value::is_null));

    let target_path = unique_temp_path("revisionkernel-cli-import", ".sqlite3");
    let target = path_str(&target_path);

    let refused = run_rvk(["--db", target, "db", "import", "--in", out]);
    assert!(!refused.status.success());
    let stderr = String::from_utf8_lossy(&refused.stderr);
    assert!(stderr.contains("unsigned"), "unexpected stderr: {stderr}");

    let imported = run_json(["--db", target, "db", "import", "--in", out, "--allow-unsigned"]);
    assert_eq!(imported.pointer("/summary/imported_revisions").and_then(Value::as_i64), Some(2));

    let _ = fs::remove_file(&db_path);
    let _ = fs::remove_file(&target_path);
    let _ = fs::remove_dir_all(&out_dir);
}

// Test IDs: TCLI-005
#[test]
fn signed_exports_verify_and_reject_tampering() {
    let db_path = unique_temp_path("revisionkernel-cli-signed", ".sqlite3");
    seed_widget_trail(&db_path);
    let db = path_str(&db_path);

    let key_path = unique_temp_path("revisionkernel-cli-key", ".hex");
    fs::write(&key_path, SIGNING_KEY_HEX)
        .unwrap_or_else(|err| panic!("failed to write key file: {err}"));
    let key = path_str(&key_path);

    let out_dir = unique_temp_path("revisionkernel-cli-signed-out", "");
    let out = path_str(&out_dir);

    let exported = run_json(["--db", db, "db", "export", "--out", out, "--signing-key-file", key]);
    assert_eq!(exported.get("signature_algorithm").and_then(Value::as_str), Some("hmac-sha256"));
    assert!(out_dir.join("manifest.sig").exists());

    let target_path = unique_temp_path("revisionkernel-cli-signed-import", ".sqlite3");
    let target = path_str(&target_path);

    let unverified = run_rvk(["--db", target, "db", "import", "--in", out]);
    assert!(!unverified.status.success());

    let imported =
        run_json(["--db", target, "db", "import", "--in", out, "--verify-key-file", key]);
    assert_eq!(imported.pointer("/summary/imported_revisions").and_then(Value::as_i64), Some(2));

    // Tamper with the manifest: verification must now fail.
    let manifest_path = out_dir.join("manifest.json");
    let mut manifest_body = fs::read_to_string(&manifest_path)
        .unwrap_or_else(|err| panic!("failed to read manifest: {err}"));
    manifest_body.push(' ');
    fs::write(&manifest_path, manifest_body)
        .unwrap_or_else(|err| panic!("failed to rewrite manifest: {err}"));

    let second_target = unique_temp_path("revisionkernel-cli-signed-import2", ".sqlite3");
    let tampered = run_rvk([
        "--db",
        path_str(&second_target),
        "db",
        "import",
        "--in",
        out,
        "--verify-key-file",
        key,
    ]);
    assert!(!tampered.status.success());

    let _ = fs::remove_file(&db_path);
    let _ = fs::remove_file(&target_path);
    let _ = fs::remove_file(&second_target);
    let _ = fs::remove_file(&key_path);
    let _ = fs::remove_dir_all(&out_dir);
}
