#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

fn cicd() -> Command {
    let mut cmd = Command::cargo_bin("cicd").unwrap();
    cmd.env_remove("CICD_DEPLOY_TOOL")
        .env_remove("CICD_ARTIFACTS_DIR")
        .env_remove("RUST_LOG");
    cmd
}

fn example_document() -> Value {
    json!({
        "stackName": "demo",
        "repositoryParameters": {
            "type": "GITHUB_REPO",
            "personnalTokenSecretName": "gh-token",
            "owner": "acme",
            "repo": "app",
            "branch": "main"
        },
        "buildDockerfilePath": "Dockerfile",
        "stages": [
            { "name": "alpha", "awsAccountId": "111111111111", "deployToRegions": ["us-east-1"] },
            {
                "name": "prod",
                "awsAccountId": "222222222222",
                "deployToRegions": ["us-east-1", "eu-west-1"],
                "manualApprovalBeforeDeployment": true,
                "manualApprovalSubscribers": ["a@x.com"]
            }
        ]
    })
}

fn write_params(dir: &TempDir, document: &Value) -> String {
    let path = dir.path().join("params.json");
    std::fs::write(&path, serde_json::to_string_pretty(document).unwrap()).unwrap();
    path.display().to_string()
}

fn invalid_document() -> Value {
    let mut document = example_document();
    document["stackName"] = json!("a-much-too-long-name");
    document
}

// ---------------------------------------------------------------------------
// help
// ---------------------------------------------------------------------------

#[test]
fn help_lists_the_commands() {
    cicd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("remove"));
}

#[test]
fn params_file_is_mandatory() {
    cicd()
        .arg("create")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--params-file"));
}

// ---------------------------------------------------------------------------
// validate / synth
// ---------------------------------------------------------------------------

#[test]
fn validate_prints_the_stage_layout() {
    let dir = TempDir::new().unwrap();
    let params = write_params(&dir, &example_document());

    cicd()
        .args(["validate", "--params-file", &params])
        .assert()
        .success()
        .stdout(predicate::str::contains("DeployToalpha (1 actions)"))
        .stdout(predicate::str::contains("prodApproval (1 actions)"))
        .stdout(predicate::str::contains("DeployToprod (2 actions)"));
}

#[test]
fn validate_reports_violations() {
    let dir = TempDir::new().unwrap();
    let params = write_params(&dir, &invalid_document());

    cicd()
        .args(["validate", "--params-file", &params])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid parameters file!"))
        .stderr(predicate::str::contains("stackName"));
}

#[test]
fn missing_params_file_fails() {
    let dir = TempDir::new().unwrap();
    let params = dir.path().join("missing.json").display().to_string();

    cicd()
        .args(["validate", "--params-file", &params])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn synth_prints_a_yaml_template() {
    let dir = TempDir::new().unwrap();
    let params = write_params(&dir, &example_document());

    cicd()
        .args(["synth", "--params-file", &params, "--format", "yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("AWS::CodePipeline::Pipeline"))
        .stdout(predicate::str::contains("AWS::SNS::Subscription"));
}

#[test]
fn synth_writes_a_json_template() {
    let dir = TempDir::new().unwrap();
    let params = write_params(&dir, &example_document());
    let output = dir.path().join("template.json");

    cicd()
        .args(["synth", "--params-file", &params, "--output"])
        .arg(&output)
        .assert()
        .success();

    let template: Value =
        serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!("demo-pipeline", template["Resources"]["Pipeline"]["Properties"]["Name"]);
}

// ---------------------------------------------------------------------------
// create / remove
// ---------------------------------------------------------------------------

#[test]
fn create_succeeds_when_the_tool_succeeds() {
    let dir = TempDir::new().unwrap();
    let params = write_params(&dir, &example_document());

    cicd()
        .args(["create", "--params-file", &params, "--deploy-tool", "true"])
        .assert()
        .success();
}

#[test]
fn create_mirrors_the_tool_exit_code() {
    let dir = TempDir::new().unwrap();
    let params = write_params(&dir, &example_document());

    cicd()
        .args(["create", "--params-file", &params, "--deploy-tool", "false"])
        .assert()
        .code(1);
}

#[test]
fn create_keeps_artifacts_when_asked() {
    let dir = TempDir::new().unwrap();
    let params = write_params(&dir, &example_document());
    let artifacts = dir.path().join("artifacts");

    cicd()
        .args(["create", "--params-file", &params, "--deploy-tool", "true"])
        .arg("--artifacts-dir")
        .arg(&artifacts)
        .assert()
        .success();

    let workspaces: Vec<_> = std::fs::read_dir(&artifacts)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(1, workspaces.len());

    let persisted = std::fs::read_to_string(workspaces[0].join("cicd_parameters.json")).unwrap();
    assert_eq!(std::fs::read_to_string(&params).unwrap(), persisted);
    assert!(workspaces[0].join("template.json").is_file());
}

#[test]
fn invalid_parameters_are_never_persisted() {
    let dir = TempDir::new().unwrap();
    let params = write_params(&dir, &invalid_document());
    let artifacts = dir.path().join("artifacts");

    cicd()
        .args(["create", "--params-file", &params, "--deploy-tool", "true"])
        .arg("--artifacts-dir")
        .arg(&artifacts)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("stackName"));

    assert!(!artifacts.exists());
}

#[test]
fn remove_runs_the_tool() {
    let dir = TempDir::new().unwrap();
    let params = write_params(&dir, &example_document());

    cicd()
        .args(["remove", "--params-file", &params, "--aws-profile", "ops"])
        .env("CICD_DEPLOY_TOOL", "true")
        .assert()
        .success();
}

#[test]
fn unknown_tool_is_reported() {
    let dir = TempDir::new().unwrap();
    let params = write_params(&dir, &example_document());

    cicd()
        .args(["remove", "--params-file", &params])
        .args(["--deploy-tool", "definitely-not-a-deploy-tool"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to start"));
}
