#![allow(deprecated)]
use assert_cmd::Command;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use pkcs8::{EncodePublicKey, LineEnding};
use predicates::prelude::*;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempdir().unwrap(),
        }
    }

    fn db(&self) -> PathBuf {
        self.dir.path().join("folios.db")
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn folio(&self) -> Command {
        let mut cmd = Command::cargo_bin("folio").unwrap();
        cmd.env_remove("FOLIO_CONFIG")
            .env_remove("FOLIO_DATABASE")
            .env("RUST_LOG", "warn")
            .arg("--database")
            .arg(self.db());
        cmd
    }

    fn json(&self, args: &[&str]) -> Value {
        let out = self.folio().arg("--json").args(args).assert().success();
        let stdout = String::from_utf8(out.get_output().stdout.clone()).unwrap();
        serde_json::from_str(&stdout).expect("command output is not JSON")
    }

    fn register(&self, start: u64, end: u64) -> Value {
        self.json(&[
            "range",
            "register",
            "--issuer",
            "76123456-7",
            "--doc-type",
            "33",
            "--start",
            &start.to_string(),
            "--end",
            &end.to_string(),
        ])
    }
}

const SERIES: [&str; 4] = ["--issuer", "76123456-7", "--doc-type", "33"];

fn series(cmd: &str) -> Vec<&str> {
    let mut args = vec![cmd];
    args.extend(SERIES);
    args
}

#[test]
fn test_assign_walks_the_range_then_exits_2_when_exhausted() {
    let ws = Workspace::new();
    let range = ws.register(1, 5);
    assert_eq!(range["status"], "ACTIVE");

    for expected in 1..=5u64 {
        let out = ws.json(&series("assign"));
        assert_eq!(out["folio"]["number"], expected);
        assert_eq!(out["remaining"], 5 - expected);
    }

    ws.folio()
        .args(series("assign"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn test_overlapping_register_exits_4() {
    let ws = Workspace::new();
    ws.register(1, 100);

    ws.folio()
        .args(["range", "register"])
        .args(SERIES)
        .args(["--start", "50", "--end", "150"])
        .assert()
        .code(4);

    let ranges = ws.json(&["range", "list", "--issuer", "76123456-7"]);
    assert_eq!(ranges.as_array().unwrap().len(), 1);
}

#[test]
fn test_void_bind_and_show_lifecycle() {
    let ws = Workspace::new();
    ws.register(10, 20);

    let first = ws.json(&series("assign"));
    assert_eq!(first["folio"]["number"], 10);

    let mut bind = series("bind");
    bind.extend(["--number", "10", "--document-id", "INV-0001"]);
    let bound = ws.json(&bind);
    assert_eq!(bound["status"], "USED");
    assert_eq!(bound["document_id"], "INV-0001");

    let mut void = series("void");
    void.extend(["--number", "11", "--reason", "printer jam"]);
    let voided = ws.json(&void);
    assert_eq!(voided["status"], "VOID");
    assert_eq!(voided["void_reason"], "printer jam");

    // a void number is skipped by the allocator
    let next = ws.json(&series("assign"));
    assert_eq!(next["folio"]["number"], 12);

    let mut show = series("show");
    show.extend(["--number", "11"]);
    let shown = ws.json(&show);
    assert_eq!(shown["status"], "VOID");

    // USED folios cannot be voided
    let mut void_used = series("void");
    void_used.extend(["--number", "10", "--reason", "late"]);
    ws.folio().args(void_used).assert().code(1);
}

#[test]
fn test_status_and_report() {
    let ws = Workspace::new();
    let range = ws.register(1, 10);
    let range_id = range["range_id"].as_str().unwrap().to_string();

    let mut assign = series("assign");
    assign.extend(["--document-id", "INV-7"]);
    ws.json(&assign);

    let status = ws.json(&["range", "status", &range_id]);
    assert_eq!(status["available"], 9);
    assert_eq!(status["used"], 1);

    let today = Utc::now().format("%Y-%m-%d").to_string();
    let mut report = series("report");
    report.extend(["--from", &today, "--to", &today]);
    let report = ws.json(&report);
    assert_eq!(report["used"], 1);
    assert_eq!(report["folios"][0]["document_id"], "INV-7");
}

#[test]
fn test_report_as_csv() {
    let ws = Workspace::new();
    ws.register(1, 10);

    let mut assign = series("assign");
    assign.extend(["--document-id", "INV-7"]);
    ws.json(&assign);
    let mut void = series("void");
    void.extend(["--number", "5", "--reason", "jam, again"]);
    ws.json(&void);

    let today = Utc::now().format("%Y-%m-%d").to_string();
    let out = ws
        .folio()
        .args(series("report"))
        .args(["--from", &today, "--to", &today, "--format", "csv"])
        .assert()
        .success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();

    assert_eq!(
        lines[0],
        "issuer,doc_type,number,status,range_id,at,document_id,void_reason"
    );
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("76123456-7,33,1,USED,"));
    assert!(lines[1].ends_with(",INV-7,"));
    assert!(lines[2].starts_with("76123456-7,33,5,VOID,"));
    assert!(lines[2].ends_with(",,\"jam, again\""));
}

#[test]
fn test_sweep_expires_lapsed_ranges() {
    let ws = Workspace::new();
    ws.folio()
        .args(["range", "register"])
        .args(SERIES)
        .args([
            "--start",
            "1",
            "--end",
            "5",
            "--authorized-at",
            "2020-01-01",
            "--expires-at",
            "2020-07-01",
        ])
        .assert()
        .success();

    let report = ws.json(&["sweep"]);
    assert_eq!(report["expired"].as_array().unwrap().len(), 1);

    ws.folio().args(series("assign")).assert().code(3);

    let expired = ws.json(&["range", "list", "--status", "expired"]);
    assert_eq!(expired.as_array().unwrap().len(), 1);
}

fn write_key(ws: &Workspace, key: &SigningKey) -> PathBuf {
    let pem = key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    let path = ws.path("authority.pub.pem");
    std::fs::write(&path, pem).unwrap();
    path
}

fn write_artifact(ws: &Workspace, key: &SigningKey, issuer: &str) -> PathBuf {
    let raw = folio_core::sign_artifact(key, issuer, "33", 1_000, 1_999, Utc::now()).unwrap();
    let path = ws.path("caf.json");
    std::fs::write(&path, raw).unwrap();
    path
}

fn register_artifact(ws: &Workspace, artifact: &Path, key: &Path) -> assert_cmd::assert::Assert {
    ws.folio()
        .arg("--json")
        .args(["range", "register"])
        .args(SERIES)
        .arg("--artifact")
        .arg(artifact)
        .arg("--trusted-key")
        .arg(key)
        .assert()
}

#[test]
fn test_register_from_signed_artifact() {
    let ws = Workspace::new();
    let key = SigningKey::generate(&mut rand::thread_rng());
    let key_path = write_key(&ws, &key);
    let artifact = write_artifact(&ws, &key, "76123456-7");

    let out = register_artifact(&ws, &artifact, &key_path).success();
    let range: Value = serde_json::from_slice(&out.get_output().stdout).unwrap();
    assert_eq!(range["start"], 1_000);
    assert_eq!(range["end"], 1_999);
    assert!(range["artifact_hash"]
        .as_str()
        .unwrap()
        .starts_with("sha256:"));

    let first = ws.json(&series("assign"));
    assert_eq!(first["folio"]["number"], 1_000);
}

#[test]
fn test_artifact_signed_by_unknown_key_exits_4() {
    let ws = Workspace::new();
    let trusted = SigningKey::generate(&mut rand::thread_rng());
    let rogue = SigningKey::generate(&mut rand::thread_rng());
    let key_path = write_key(&ws, &trusted);
    let artifact = write_artifact(&ws, &rogue, "76123456-7");

    register_artifact(&ws, &artifact, &key_path).code(4);

    // nothing was registered
    let ranges = ws.json(&["range", "list"]);
    assert_eq!(ranges.as_array().unwrap().len(), 0);
    ws.folio().args(series("assign")).assert().code(2);
}

#[test]
fn test_artifact_for_another_issuer_exits_4() {
    let ws = Workspace::new();
    let key = SigningKey::generate(&mut rand::thread_rng());
    let key_path = write_key(&ws, &key);
    let artifact = write_artifact(&ws, &key, "99999999-9");

    register_artifact(&ws, &artifact, &key_path)
        .code(4)
        .stderr(predicate::str::contains("99999999-9"));
}

#[test]
fn test_requests_is_empty_for_a_fresh_series() {
    let ws = Workspace::new();
    let out = ws.json(&series("requests"));
    assert_eq!(out.as_array().unwrap().len(), 0);
}

#[test]
fn test_replenish_above_threshold_does_not_contact_authority() {
    let ws = Workspace::new();
    ws.register(1, 50);

    let mut replenish = series("replenish");
    replenish.extend(["--threshold", "10"]);
    let out = ws.json(&replenish);
    assert_eq!(out["outcome"], "ABOVE_THRESHOLD");
    assert_eq!(out["remaining"], 50);
}

#[test]
fn test_invalid_config_exits_1() {
    let ws = Workspace::new();
    let config = ws.path("folio.yaml");
    std::fs::write(&config, "request_quantity: 0\n").unwrap();

    ws.folio()
        .arg("--config")
        .arg(&config)
        .args(["range", "list"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("request_quantity"));
}
