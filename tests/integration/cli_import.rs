#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write csv");
    path
}

fn people(dir: &Path) -> (PathBuf, PathBuf) {
    let nodes = write(
        dir,
        "people.csv",
        "id:ID,name,age:int,:LABEL\n\
         alice,Alice,33,Person\n\
         bob,Bob,41,Person;Admin\n\
         carol,Carol,,Person\n",
    );
    let relationships = write(
        dir,
        "knows.csv",
        ":START_ID,:END_ID,:TYPE,since:int\n\
         alice,bob,KNOWS,2001\n\
         bob,carol,KNOWS,2010\n\
         carol,alice,KNOWS,\n\
         carol,mallory,KNOWS,2020\n",
    );
    (nodes, relationships)
}

#[test]
fn imports_csv_and_reports_json() {
    let dir = TempDir::new().expect("tempdir");
    let (nodes, relationships) = people(dir.path());
    let into = dir.path().join("graph");
    let report_path = dir.path().join("bad.jsonl");

    let output = cargo_bin_cmd!("sombra-import")
        .args(["--quiet", "--format", "json", "--into"])
        .arg(&into)
        .arg("--nodes")
        .arg(&nodes)
        .arg("--relationships")
        .arg(&relationships)
        .arg("--report")
        .arg(&report_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let report: Value = serde_json::from_slice(&output).expect("json report");
    assert_eq!(report["successful"], Value::Bool(true));
    assert_eq!(report["statistics"]["nodes"], 3);
    assert_eq!(report["statistics"]["relationships"], 3);
    assert_eq!(report["bad_entries"], 1);

    let bad = fs::read_to_string(&report_path).expect("bad entry report");
    let lines: Vec<&str> = bad.lines().collect();
    assert_eq!(lines.len(), 1);
    let entry: Value = serde_json::from_str(lines[0]).expect("json line");
    assert_eq!(entry["kind"], "relationship");
    assert_eq!(entry["reason"], "end node not found");

    let tokens: Value =
        serde_json::from_str(&fs::read_to_string(into.join("tokens.json")).expect("tokens")).expect("json");
    assert_eq!(tokens["relationship_types"], serde_json::json!(["KNOWS"]));
    assert!(into.join("nodes.store").exists());
    assert!(into.join("counts.json").exists());
    assert!(!into.join("relationship_groups.tmp").exists());
}

#[test]
fn refuses_to_import_into_existing_stores() {
    let dir = TempDir::new().expect("tempdir");
    let (nodes, relationships) = people(dir.path());
    let into = dir.path().join("graph");
    for attempt in 0..2 {
        let assert = cargo_bin_cmd!("sombra-import")
            .args(["--quiet", "--into"])
            .arg(&into)
            .arg("--nodes")
            .arg(&nodes)
            .arg("--relationships")
            .arg(&relationships)
            .assert();
        if attempt == 0 {
            assert.success();
        } else {
            let stderr = String::from_utf8_lossy(&assert.failure().get_output().stderr).into_owned();
            assert!(stderr.contains("already contains store data"), "{stderr}");
        }
    }
}

#[test]
fn config_file_and_flags_combine() {
    let dir = TempDir::new().expect("tempdir");
    let (nodes, relationships) = people(dir.path());
    let config = write(
        dir.path(),
        "import.toml",
        "dense_node_threshold = 1\nbatch_size = 2\n\n[[unique]]\nlabel = \"Person\"\nproperty = \"name\"\n",
    );
    let output = cargo_bin_cmd!("sombra-import")
        .args(["--quiet", "--format", "json", "--processors", "2", "--into"])
        .arg(dir.path().join("graph"))
        .arg("--config")
        .arg(&config)
        .arg("--nodes")
        .arg(&nodes)
        .arg("--relationships")
        .arg(&relationships)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&output).expect("json report");
    assert_eq!(report["dense_nodes"], 3);
    assert_eq!(report["statistics"]["nodes"], 3);
}

#[test]
fn invalid_config_is_reported() {
    let dir = TempDir::new().expect("tempdir");
    let (nodes, _) = people(dir.path());
    let config = write(dir.path(), "bad.toml", "batch_size = 0\n");
    let assert = cargo_bin_cmd!("sombra-import")
        .args(["--quiet", "--into"])
        .arg(dir.path().join("graph"))
        .arg("--config")
        .arg(&config)
        .arg("--nodes")
        .arg(&nodes)
        .assert()
        .failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("batch_size must be positive"), "{stderr}");
}
