//! Spawns the external deployment tool (the AWS CLI by default) that creates
//! or removes the pipeline stack.

use std::{
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
};

use tokio::process::Command;
use tracing::{info, warn};

pub const DEFAULT_DEPLOY_TOOL: &str = "aws";

/// Deployment stage the pipeline stack itself is deployed under.
pub const DEPLOYMENT_STAGE: &str = "prod";

/// Region of the pipeline stack; the repository token secret must live here.
pub const PIPELINE_REGION: &str = "us-east-1";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to start `{0}`: {1}")]
    SpawnError(String, io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeployCommand {
    Create { template: PathBuf },
    Remove,
}

/// Name of the CloudFormation stack holding the pipeline of `stack_name`.
pub fn pipeline_stack_name(stack_name: &str) -> String {
    format!("{}-{}-cicd", DEPLOYMENT_STAGE, stack_name)
}

#[derive(Debug, Clone)]
pub struct Deployer {
    program: String,
    stack_name: String,
    profile: Option<String>,
}

impl Deployer {
    pub fn new(program: impl Into<String>, stack_name: &str, profile: Option<String>) -> Self {
        Self {
            program: program.into(),
            stack_name: pipeline_stack_name(stack_name),
            profile,
        }
    }

    pub fn stack_name(&self) -> &str {
        &self.stack_name
    }

    /// Argument lists of the tool invocations for `command`, run in order.
    pub fn invocations(&self, command: &DeployCommand) -> Vec<Vec<String>> {
        let invocations = match command {
            DeployCommand::Create { template } => vec![vec![
                String::from("cloudformation"),
                String::from("deploy"),
                String::from("--template-file"),
                template.display().to_string(),
                String::from("--stack-name"),
                self.stack_name.clone(),
                String::from("--capabilities"),
                String::from("CAPABILITY_IAM"),
                String::from("--no-fail-on-empty-changeset"),
                String::from("--tags"),
                format!("Stage={}", DEPLOYMENT_STAGE),
            ]],
            DeployCommand::Remove => vec![
                vec![
                    String::from("cloudformation"),
                    String::from("delete-stack"),
                    String::from("--stack-name"),
                    self.stack_name.clone(),
                ],
                vec![
                    String::from("cloudformation"),
                    String::from("wait"),
                    String::from("stack-delete-complete"),
                    String::from("--stack-name"),
                    self.stack_name.clone(),
                ],
            ],
        };

        invocations
            .into_iter()
            .map(|mut arguments| {
                arguments.push(String::from("--region"));
                arguments.push(PIPELINE_REGION.to_string());
                if let Some(profile) = &self.profile {
                    arguments.push(String::from("--profile"));
                    arguments.push(profile.clone());
                }
                arguments
            })
            .collect()
    }

    /// Runs every invocation with inherited stdio and returns the status of
    /// the last one started. Stops at the first failure.
    pub async fn run(&self, command: &DeployCommand) -> Result<ExitStatus, Error> {
        let mut last_status = None;

        for arguments in self.invocations(command) {
            info!(program = %self.program, args = ?arguments, "running deployment tool");

            let status = Command::new(&self.program)
                .args(&arguments)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .await
                .map_err(|error| Error::SpawnError(self.program.clone(), error))?;

            if !status.success() {
                warn!(program = %self.program, %status, "deployment tool failed");
                return Ok(status);
            }
            last_status = Some(status);
        }

        match last_status {
            Some(status) => Ok(status),
            None => Err(Error::SpawnError(
                self.program.clone(),
                io::Error::new(io::ErrorKind::InvalidInput, "nothing to run"),
            )),
        }
    }
}

/// Exit code the CLI reports for a finished deployment tool. Termination by
/// signal maps to 1.
pub fn exit_code(status: ExitStatus) -> u8 {
    status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{exit_code, pipeline_stack_name, DeployCommand, Deployer, Error};

    #[test]
    fn create_deploys_the_template_with_the_profile() {
        let deployer = Deployer::new("aws", "demo", Some(String::from("ops")));
        let invocations = deployer.invocations(&DeployCommand::Create {
            template: PathBuf::from("/tmp/demo/template.json"),
        });

        assert_eq!(1, invocations.len());
        assert_eq!(
            vec![
                "cloudformation",
                "deploy",
                "--template-file",
                "/tmp/demo/template.json",
                "--stack-name",
                "prod-demo-cicd",
                "--capabilities",
                "CAPABILITY_IAM",
                "--no-fail-on-empty-changeset",
                "--tags",
                "Stage=prod",
                "--region",
                "us-east-1",
                "--profile",
                "ops",
            ],
            invocations[0]
        );
    }

    #[test]
    fn remove_deletes_then_waits_without_profile() {
        let deployer = Deployer::new("aws", "demo", None);
        let invocations = deployer.invocations(&DeployCommand::Remove);

        assert_eq!(2, invocations.len());
        assert_eq!("delete-stack", invocations[0][1]);
        assert_eq!("wait", invocations[1][1]);
        assert!(invocations
            .iter()
            .all(|arguments| !arguments.contains(&String::from("--profile"))));
        assert_eq!("prod-demo-cicd", deployer.stack_name());
        assert_eq!(pipeline_stack_name("demo"), deployer.stack_name());
    }

    #[tokio::test]
    async fn successful_tool_reports_success() {
        let deployer = Deployer::new("true", "demo", None);
        let status = deployer.run(&DeployCommand::Remove).await.unwrap();

        assert!(status.success());
        assert_eq!(0, exit_code(status));
    }

    #[tokio::test]
    async fn failing_tool_status_is_returned() {
        let deployer = Deployer::new("false", "demo", None);
        let status = deployer.run(&DeployCommand::Remove).await.unwrap();

        assert!(!status.success());
        assert_eq!(1, exit_code(status));
    }

    #[tokio::test]
    async fn missing_tool_is_a_spawn_error() {
        let deployer = Deployer::new("definitely-not-a-deploy-tool", "demo", None);

        match deployer.run(&DeployCommand::Remove).await {
            Err(Error::SpawnError(program, _)) => {
                assert_eq!("definitely-not-a-deploy-tool", program)
            }
            other => panic!("Expected `SpawnError` error, got {:?}", other),
        }
    }

    #[test]
    fn exit_codes_are_mirrored() {
        let status = std::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .status()
            .unwrap();

        assert_eq!(3, exit_code(status));
    }
}
