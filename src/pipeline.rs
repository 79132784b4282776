//! In-memory model of the generated CodePipeline and the builder that derives
//! it from validated parameters.

use tracing::debug;

use crate::config::{CicdParameters, GitHubRepository, RepositoryParameters, StageParameters};

pub const SOURCE_ARTIFACT: &str = "SourceOutput";
pub const BUILD_ARTIFACT: &str = "BuildOutput";

/// CodeBuild image used by the build and deploy projects.
pub const BUILD_IMAGE: &str = "aws/codebuild/standard:7.0";

/// Named AWS CLI profile a deploy project uses to act in the target account.
pub const DEPLOY_PROFILE: &str = "deploy-target";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Source,
    Build,
    Approval,
    Deploy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub name: String,
    pub stack_name: String,
    pub stages: Vec<PipelineStage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStage {
    pub name: String,
    pub kind: StageKind,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub name: String,
    /// Actions sharing a run order within a stage execute in parallel.
    pub run_order: u32,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    GitHubSource {
        repository: GitHubRepository,
        output: String,
    },
    CodeBuild {
        project: BuildProject,
        input: String,
        outputs: Vec<String>,
    },
    ManualApproval {
        topic: ApprovalTopic,
        additional_information: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectRole {
    Build,
    Deploy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildProject {
    pub logical_id: String,
    pub role: ProjectRole,
    pub privileged: bool,
    pub pre_build: Vec<String>,
    pub build: Vec<String>,
    pub artifact_files: Vec<String>,
    pub target: Option<DeployTarget>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeployTarget {
    pub stage: String,
    pub account_id: String,
    pub region: String,
    pub role_arn: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalTopic {
    pub logical_id: String,
    pub stage: String,
    pub subscribers: Vec<String>,
}

impl Pipeline {
    pub fn stage(&self, name: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.stages.iter().flat_map(|stage| stage.actions.iter())
    }

    pub fn build_projects(&self) -> impl Iterator<Item = &BuildProject> {
        self.actions().filter_map(|action| match &action.kind {
            ActionKind::CodeBuild { project, .. } => Some(project),
            _ => None,
        })
    }

    pub fn approval_topics(&self) -> impl Iterator<Item = &ApprovalTopic> {
        self.actions().filter_map(|action| match &action.kind {
            ActionKind::ManualApproval { topic, .. } => Some(topic),
            _ => None,
        })
    }

    pub fn deploy_targets(&self) -> impl Iterator<Item = &DeployTarget> {
        self.build_projects()
            .filter_map(|project| project.target.as_ref())
    }
}

/// Builds a CloudFormation logical id out of arbitrary name parts, keeping
/// only ASCII alphanumerics and capitalising every segment.
pub fn logical_id(parts: &[&str]) -> String {
    let mut id = String::new();
    for part in parts {
        for segment in part.split(|c: char| !c.is_ascii_alphanumeric()) {
            let mut characters = segment.chars();
            if let Some(first) = characters.next() {
                id.push(first.to_ascii_uppercase());
                id.extend(characters);
            }
        }
    }
    id
}

pub fn build(parameters: &CicdParameters) -> Pipeline {
    let RepositoryParameters::GitHub(repository) = &parameters.repository;

    let mut stages = vec![source_stage(repository), build_stage(parameters)];
    for stage in &parameters.stages {
        if stage.requires_approval() {
            stages.push(approval_stage(&parameters.stack_name, stage));
        }
        stages.push(deploy_stage(&parameters.stack_name, stage));
    }

    debug!(
        stack = %parameters.stack_name,
        stages = stages.len(),
        "built pipeline"
    );

    Pipeline {
        name: format!("{}-pipeline", parameters.stack_name),
        stack_name: parameters.stack_name.clone(),
        stages,
    }
}

fn source_stage(repository: &GitHubRepository) -> PipelineStage {
    PipelineStage {
        name: String::from("Source"),
        kind: StageKind::Source,
        actions: vec![Action {
            name: String::from("GitHubSource"),
            run_order: 1,
            kind: ActionKind::GitHubSource {
                repository: repository.clone(),
                output: SOURCE_ARTIFACT.to_string(),
            },
        }],
    }
}

fn build_stage(parameters: &CicdParameters) -> PipelineStage {
    let project = BuildProject {
        logical_id: logical_id(&[&parameters.stack_name, "build", "project"]),
        role: ProjectRole::Build,
        privileged: true,
        pre_build: vec![format!(
            "docker build -t build-image --file {} .",
            parameters.build_dockerfile_path
        )],
        build: vec![String::from(
            "docker run -e AWS_DEFAULT_REGION -e AWS_CONTAINER_CREDENTIALS_RELATIVE_URI -v $(pwd)/.build:/build/.build build-image:latest",
        )],
        artifact_files: vec![String::from("./.build/cdk.out/**/*")],
        target: None,
    };

    // BuildOutput is published but deploy actions still consume the source.
    PipelineStage {
        name: String::from("Build"),
        kind: StageKind::Build,
        actions: vec![Action {
            name: String::from("BuildServices"),
            run_order: 1,
            kind: ActionKind::CodeBuild {
                project,
                input: SOURCE_ARTIFACT.to_string(),
                outputs: vec![BUILD_ARTIFACT.to_string()],
            },
        }],
    }
}

fn approval_stage(stack_name: &str, stage: &StageParameters) -> PipelineStage {
    let topic = ApprovalTopic {
        logical_id: logical_id(&[stack_name, &stage.name, "approval", "topic"]),
        stage: stage.name.clone(),
        subscribers: stage.manual_approval_subscribers.clone(),
    };

    PipelineStage {
        name: format!("{}Approval", stage.name),
        kind: StageKind::Approval,
        actions: vec![Action {
            name: format!("manual-approval-{}-deploy", stage.name),
            run_order: 1,
            kind: ActionKind::ManualApproval {
                topic,
                additional_information: format!(
                    "The build for your application {} is ready to be deployed to {}! Review that everything is ok, and approve the deployment!",
                    stack_name, stage.name
                ),
            },
        }],
    }
}

fn deploy_stage(stack_name: &str, stage: &StageParameters) -> PipelineStage {
    let role_arn = stage.deploy_role_arn();
    let actions = stage
        .deploy_to_regions
        .iter()
        .map(|region| Action {
            name: format!("deploy-services-{}", region),
            run_order: 1,
            kind: ActionKind::CodeBuild {
                project: deploy_project(stack_name, stage, region, &role_arn),
                input: SOURCE_ARTIFACT.to_string(),
                outputs: Vec::new(),
            },
        })
        .collect();

    PipelineStage {
        name: format!("DeployTo{}", stage.name),
        kind: StageKind::Deploy,
        actions,
    }
}

fn deploy_project(
    stack_name: &str,
    stage: &StageParameters,
    region: &str,
    role_arn: &str,
) -> BuildProject {
    BuildProject {
        logical_id: logical_id(&[stack_name, &stage.name, "deploy", region, "project"]),
        role: ProjectRole::Deploy,
        privileged: false,
        pre_build: vec![
            format!(
                "aws configure set profile.{}.role_arn {}",
                DEPLOY_PROFILE, role_arn
            ),
            format!(
                "aws configure set profile.{}.credential_source EcsContainer",
                DEPLOY_PROFILE
            ),
            String::from("npm install"),
        ],
        build: vec![format!(
            "npm run deploy -- --stage {} --region {} --profile {}",
            stage.name, region, DEPLOY_PROFILE
        )],
        artifact_files: Vec::new(),
        target: Some(DeployTarget {
            stage: stage.name.clone(),
            account_id: stage.aws_account_id.clone(),
            region: region.to_string(),
            role_arn: role_arn.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{build, logical_id, ActionKind, StageKind};
    use crate::config::{tests::example_document, validate, CicdParameters, Validation};

    fn parameters(document: serde_json::Value) -> CicdParameters {
        match validate(&document) {
            Validation::Valid(parameters) => parameters,
            Validation::Invalid(violations) => panic!("Unexpected violations: {}", violations),
        }
    }

    #[test]
    fn example_yields_the_documented_stage_layout() {
        let pipeline = build(&parameters(example_document()));

        let layout: Vec<(&str, StageKind, usize)> = pipeline
            .stages
            .iter()
            .map(|stage| (stage.name.as_str(), stage.kind, stage.actions.len()))
            .collect();
        assert_eq!(
            vec![
                ("Source", StageKind::Source, 1),
                ("Build", StageKind::Build, 1),
                ("DeployToalpha", StageKind::Deploy, 1),
                ("prodApproval", StageKind::Approval, 1),
                ("DeployToprod", StageKind::Deploy, 2),
            ],
            layout
        );
        assert_eq!("demo-pipeline", pipeline.name);

        let topics: Vec<_> = pipeline.approval_topics().collect();
        assert_eq!(1, topics.len());
        assert_eq!(vec!["a@x.com"], topics[0].subscribers);
    }

    #[test]
    fn deploy_actions_follow_region_order_and_run_in_parallel() {
        let mut document = example_document();
        document["stages"][1]["deployToRegions"] =
            json!(["eu-west-1", "ap-south-1", "us-east-1"]);
        let pipeline = build(&parameters(document));

        let stage = pipeline.stage("DeployToprod").unwrap();
        let regions: Vec<&str> = stage
            .actions
            .iter()
            .map(|action| match &action.kind {
                ActionKind::CodeBuild { project, .. } => {
                    project.target.as_ref().unwrap().region.as_str()
                }
                _ => panic!("Expected a CodeBuild deploy action"),
            })
            .collect();
        assert_eq!(vec!["eu-west-1", "ap-south-1", "us-east-1"], regions);
        assert!(stage.actions.iter().all(|action| action.run_order == 1));
    }

    #[test]
    fn deploy_projects_assume_the_target_account_role() {
        let pipeline = build(&parameters(example_document()));

        let targets: Vec<_> = pipeline.deploy_targets().collect();
        assert_eq!(3, targets.len());
        assert_eq!("alpha", targets[0].stage);
        assert_eq!(
            "arn:aws:iam::222222222222:role/OrganizationAccountAccessRole",
            targets[2].role_arn
        );

        let project = pipeline
            .build_projects()
            .find(|project| project.target.as_ref() == Some(targets[2]))
            .unwrap();
        assert!(project.pre_build[0].ends_with(&targets[2].role_arn));
        assert_eq!(
            "npm run deploy -- --stage prod --region eu-west-1 --profile deploy-target",
            project.build[0]
        );
    }

    #[test]
    fn one_deploy_stage_per_configured_stage() {
        let mut document = example_document();
        document["stages"]
            .as_array_mut()
            .unwrap()
            .push(json!({
                "name": "staging",
                "awsAccountId": "333333333333",
                "deployToRegions": ["us-west-2", "eu-central-1"]
            }));
        let pipeline = build(&parameters(document));

        let deploy_stages: Vec<&str> = pipeline
            .stages
            .iter()
            .filter(|stage| stage.kind == StageKind::Deploy)
            .map(|stage| stage.name.as_str())
            .collect();
        assert_eq!(
            vec!["DeployToalpha", "DeployToprod", "DeployTostaging"],
            deploy_stages
        );
    }

    #[test]
    fn approval_needs_both_the_flag_and_subscribers() {
        let mut parameters = parameters(example_document());

        parameters.stages[1].manual_approval_subscribers.clear();
        assert!(build(&parameters).stage("prodApproval").is_none());

        parameters.stages[1].manual_approval_subscribers = vec![String::from("a@x.com")];
        parameters.stages[1].manual_approval_before_deployment = false;
        assert!(build(&parameters).stage("prodApproval").is_none());

        parameters.stages[0].manual_approval_before_deployment = true;
        parameters.stages[0].manual_approval_subscribers = vec![String::from("qa@x.com")];
        let pipeline = build(&parameters);
        let names: Vec<&str> = pipeline.stages.iter().map(|stage| stage.name.as_str()).collect();
        assert_eq!(
            vec!["Source", "Build", "alphaApproval", "DeployToalpha", "DeployToprod"],
            names
        );
    }

    #[test]
    fn build_stage_uses_the_configured_dockerfile() {
        let mut document = example_document();
        document["buildDockerfilePath"] = json!("docker/ci.Dockerfile");
        let pipeline = build(&parameters(document));

        let project = pipeline.build_projects().next().unwrap();
        assert!(project.privileged);
        assert_eq!(
            "docker build -t build-image --file docker/ci.Dockerfile .",
            project.pre_build[0]
        );
    }

    #[test]
    fn logical_ids_are_alphanumeric() {
        assert_eq!(
            "DemoProdDeployUsEast1Project",
            logical_id(&["demo", "prod", "deploy", "us-east-1", "project"])
        );
        assert_eq!("MyAppBuild", logical_id(&["my_app", "--build"]));
    }
}
