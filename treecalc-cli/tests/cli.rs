use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use tempfile::{tempdir, TempDir};

const MODEL: &str = r#"
items:
  - name: m
    items:
      - name: cities
        kind: unit
        count: 3
        items:
          - name: pop
            kind: attribute
            value_type: Float64
            data: [1.0, 2.0, 3.0]
          - name: density
            kind: attribute
            expr: "pop * 2"
      - name: total
        kind: parameter
        expr: "sum(cities/pop)"
"#;

fn model_dir(model: &str) -> Result<TempDir, Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    fs::write(dir.path().join("model.yml"), model)?;
    Ok(dir)
}

fn treecalc(dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("treecalc").expect("binary built");
    cmd.current_dir(dir.path());
    cmd
}

#[test]
fn key_prints_the_canonical_expression() -> Result<(), Box<dyn std::error::Error>> {
    let dir = model_dir(MODEL)?;
    treecalc(&dir)
        .args(["key", "/m/cities/density"])
        .assert()
        .success()
        .stdout("(mul (sourceDescr \"/m/cities/pop\") 2)\n");
    Ok(())
}

#[test]
fn suppliers_lists_full_names() -> Result<(), Box<dyn std::error::Error>> {
    let dir = model_dir(MODEL)?;
    treecalc(&dir)
        .args(["suppliers", "m/total"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/m/cities/pop"));
    Ok(())
}

#[test]
fn eval_prints_values() -> Result<(), Box<dyn std::error::Error>> {
    let dir = model_dir(MODEL)?;
    treecalc(&dir)
        .args(["eval", "/m/cities/density"])
        .assert()
        .success()
        .stdout("/m/cities/density: Float64 [2, 4, 6]\n");
    Ok(())
}

#[test]
fn eval_json_outputs_typed_values() -> Result<(), Box<dyn std::error::Error>> {
    let dir = model_dir(MODEL)?;
    let assert = treecalc(&dir)
        .args(["eval", "/m/total", "--json", "--stats"])
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone())?;
    let value: Value = serde_json::from_str(&stdout)?;
    assert_eq!(value["item"], "/m/total");
    assert_eq!(value["type"], "Float64");
    assert_eq!(value["values"], serde_json::json!([6.0]));
    assert!(value["stats"]["computations"].as_u64().is_some());
    Ok(())
}

#[test]
fn eval_of_unknown_item_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = model_dir(MODEL)?;
    treecalc(&dir)
        .args(["eval", "/m/nowhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No item named /m/nowhere"));
    Ok(())
}

#[test]
fn check_reports_failing_rules() -> Result<(), Box<dyn std::error::Error>> {
    let broken = format!("{}      - name: bad\n        kind: parameter\n        expr: \"missing + 1\"\n", MODEL);
    let dir = model_dir(&broken)?;
    treecalc(&dir)
        .arg("check")
        .assert()
        .failure()
        .stdout(predicate::str::contains("1 failures"))
        .stdout(predicate::str::contains("- /m/bad: Unknown identifier 'missing'"));

    let dir = model_dir(MODEL)?;
    treecalc(&dir)
        .args(["check", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"failures\": []"));
    Ok(())
}

#[test]
fn tree_prints_the_namespace() -> Result<(), Box<dyn std::error::Error>> {
    let dir = model_dir(MODEL)?;
    treecalc(&dir)
        .arg("tree")
        .assert()
        .success()
        .stdout(predicate::str::contains("m (container)"))
        .stdout(predicate::str::contains("  cities (unit UInt32, 3 elements)"))
        .stdout(predicate::str::contains("    pop (attribute Float64)"))
        .stdout(predicate::str::contains("    density (attribute) = pop * 2"));
    Ok(())
}

#[test]
fn missing_model_file_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    #[allow(deprecated)]
    Command::cargo_bin("treecalc")?
        .current_dir(dir.path())
        .args(["--config", "absent.yml", "tree"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load model"));
    Ok(())
}
