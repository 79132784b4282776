//! Renders a [`Pipeline`] into an AWS CloudFormation template.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::GitHubRepository;
use crate::pipeline::{
    Action, ActionKind, ApprovalTopic, BuildProject, Pipeline, PipelineStage, ProjectRole,
    BUILD_IMAGE,
};

const FORMAT_VERSION: &str = "2010-09-09";

const ARTIFACT_BUCKET: &str = "ArtifactBucket";
const PIPELINE: &str = "Pipeline";
const PIPELINE_ROLE: &str = "PipelineRole";
const BUILD_ROLE: &str = "BuildRole";
const DEPLOY_ROLE: &str = "DeployRole";
const WEBHOOK: &str = "SourceWebhook";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum TemplateError {
    #[error("Logical id {0} is produced more than once")]
    DuplicateLogicalId(String),

    #[error("Unable to render the build spec of {0}: {1}")]
    BuildSpec(String, String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,

    #[serde(rename = "Description")]
    pub description: String,

    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, Value>,

    #[serde(rename = "Outputs")]
    pub outputs: BTreeMap<String, Value>,
}

impl Template {
    fn new(description: String) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            description,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    fn add_resource(&mut self, logical_id: &str, resource: Value) -> Result<(), TemplateError> {
        if self.resources.contains_key(logical_id) {
            return Err(TemplateError::DuplicateLogicalId(logical_id.to_string()));
        }
        self.resources.insert(logical_id.to_string(), resource);
        Ok(())
    }

    fn add_output(&mut self, name: &str, description: &str, value: Value) {
        self.outputs.insert(
            name.to_string(),
            json!({ "Description": description, "Value": value }),
        );
    }

    pub fn resources_of_type<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = (&'a String, &'a Value)> {
        self.resources
            .iter()
            .filter(move |(_, resource)| resource["Type"] == kind)
    }
}

pub fn synthesize(pipeline: &Pipeline) -> Result<Template, TemplateError> {
    let mut template = Template::new(format!(
        "CI/CD pipeline for {} (source, build and per-stage deployments)",
        pipeline.stack_name
    ));

    template.add_resource(
        ARTIFACT_BUCKET,
        json!({
            "Type": "AWS::S3::Bucket",
            "DeletionPolicy": "Retain",
            "UpdateReplacePolicy": "Retain",
            "Properties": {
                "BucketEncryption": {
                    "ServerSideEncryptionConfiguration": [
                        { "ServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" } }
                    ]
                },
                "PublicAccessBlockConfiguration": {
                    "BlockPublicAcls": true,
                    "BlockPublicPolicy": true,
                    "IgnorePublicAcls": true,
                    "RestrictPublicBuckets": true
                }
            }
        }),
    )?;

    let topics: Vec<&ApprovalTopic> = pipeline.approval_topics().collect();
    template.add_resource(PIPELINE_ROLE, pipeline_role(&topics))?;
    template.add_resource(BUILD_ROLE, project_role(Vec::new()))?;

    let role_arns: BTreeSet<&str> = pipeline
        .deploy_targets()
        .map(|target| target.role_arn.as_str())
        .collect();
    template.add_resource(
        DEPLOY_ROLE,
        project_role(vec![json!({
            "Effect": "Allow",
            "Action": "sts:AssumeRole",
            "Resource": role_arns.into_iter().collect::<Vec<_>>()
        })]),
    )?;

    for project in pipeline.build_projects() {
        template.add_resource(&project.logical_id, build_project(project)?)?;
    }

    for topic in &topics {
        template.add_resource(
            &topic.logical_id,
            json!({
                "Type": "AWS::SNS::Topic",
                "Properties": { "DisplayName": format!("{} approval", topic.stage) }
            }),
        )?;

        for (index, email) in topic.subscribers.iter().enumerate() {
            template.add_resource(
                &format!("{}Subscription{}", topic.logical_id, index),
                json!({
                    "Type": "AWS::SNS::Subscription",
                    "Properties": {
                        "Protocol": "email",
                        "Endpoint": email,
                        "TopicArn": { "Ref": topic.logical_id }
                    }
                }),
            )?;
        }

        template.add_output(
            &format!("{}Arn", topic.logical_id),
            &format!("Notification topic of the {} approval gate", topic.stage),
            json!({ "Ref": topic.logical_id }),
        );
    }

    let stages: Vec<Value> = pipeline.stages.iter().map(stage).collect();
    template.add_resource(
        PIPELINE,
        json!({
            "Type": "AWS::CodePipeline::Pipeline",
            "Properties": {
                "Name": pipeline.name,
                "RoleArn": { "Fn::GetAtt": [PIPELINE_ROLE, "Arn"] },
                "ArtifactStore": { "Type": "S3", "Location": { "Ref": ARTIFACT_BUCKET } },
                "RestartExecutionOnUpdate": false,
                "Stages": stages
            }
        }),
    )?;

    if let Some((action, repository)) = source_action(pipeline) {
        template.add_resource(WEBHOOK, webhook(&action.name, repository))?;
    }

    template.add_output(
        "PipelineName",
        "Name of the CodePipeline pipeline",
        json!({ "Ref": PIPELINE }),
    );
    template.add_output(
        "ArtifactBucketName",
        "Bucket holding the pipeline artifacts",
        json!({ "Ref": ARTIFACT_BUCKET }),
    );

    debug!(
        stack = %pipeline.stack_name,
        resources = template.resources.len(),
        "synthesized template"
    );

    Ok(template)
}

/// Secrets Manager dynamic reference, resolved by CloudFormation at deploy time.
fn secret_reference(secret_name: &str) -> String {
    format!("{{{{resolve:secretsmanager:{}:SecretString:::}}}}", secret_name)
}

fn source_action(pipeline: &Pipeline) -> Option<(&Action, &GitHubRepository)> {
    pipeline.actions().find_map(|action| match &action.kind {
        ActionKind::GitHubSource { repository, .. } => Some((action, repository)),
        _ => None,
    })
}

fn stage(stage: &PipelineStage) -> Value {
    let actions: Vec<Value> = stage.actions.iter().map(action).collect();
    json!({ "Name": stage.name, "Actions": actions })
}

fn artifacts(names: &[String]) -> Vec<Value> {
    names.iter().map(|name| json!({ "Name": name })).collect()
}

fn action(action: &Action) -> Value {
    match &action.kind {
        ActionKind::GitHubSource { repository, output } => json!({
            "Name": action.name,
            "RunOrder": action.run_order,
            "ActionTypeId": {
                "Category": "Source",
                "Owner": "ThirdParty",
                "Provider": "GitHub",
                "Version": "1"
            },
            "Configuration": {
                "Owner": repository.owner,
                "Repo": repository.repo,
                "Branch": repository.branch,
                "OAuthToken": secret_reference(&repository.token_secret_name),
                "PollForSourceChanges": false
            },
            "OutputArtifacts": [{ "Name": output }]
        }),
        ActionKind::CodeBuild {
            project,
            input,
            outputs,
        } => json!({
            "Name": action.name,
            "RunOrder": action.run_order,
            "ActionTypeId": {
                "Category": "Build",
                "Owner": "AWS",
                "Provider": "CodeBuild",
                "Version": "1"
            },
            "Configuration": { "ProjectName": { "Ref": project.logical_id } },
            "InputArtifacts": [{ "Name": input }],
            "OutputArtifacts": artifacts(outputs)
        }),
        ActionKind::ManualApproval {
            topic,
            additional_information,
        } => json!({
            "Name": action.name,
            "RunOrder": action.run_order,
            "ActionTypeId": {
                "Category": "Approval",
                "Owner": "AWS",
                "Provider": "Manual",
                "Version": "1"
            },
            "Configuration": {
                "NotificationArn": { "Ref": topic.logical_id },
                "CustomData": additional_information
            }
        }),
    }
}

fn build_spec(project: &BuildProject) -> Result<String, TemplateError> {
    let mut spec = json!({
        "version": "0.2",
        "phases": {
            "pre_build": { "commands": project.pre_build },
            "build": { "commands": project.build }
        }
    });
    if !project.artifact_files.is_empty() {
        spec["artifacts"] = json!({ "files": project.artifact_files });
    }

    serde_yaml::to_string(&spec)
        .map_err(|error| TemplateError::BuildSpec(project.logical_id.clone(), error.to_string()))
}

fn build_project(project: &BuildProject) -> Result<Value, TemplateError> {
    let role = match project.role {
        ProjectRole::Build => BUILD_ROLE,
        ProjectRole::Deploy => DEPLOY_ROLE,
    };

    let mut variables = Vec::new();
    if let Some(target) = &project.target {
        variables.push(json!({ "Name": "DEPLOY_STAGE", "Value": target.stage }));
        variables.push(json!({ "Name": "DEPLOY_REGION", "Value": target.region }));
        variables.push(json!({ "Name": "DEPLOY_ACCOUNT_ID", "Value": target.account_id }));
    }

    Ok(json!({
        "Type": "AWS::CodeBuild::Project",
        "Properties": {
            "Artifacts": { "Type": "CODEPIPELINE" },
            "Source": { "Type": "CODEPIPELINE", "BuildSpec": build_spec(project)? },
            "Environment": {
                "Type": "LINUX_CONTAINER",
                "ComputeType": "BUILD_GENERAL1_SMALL",
                "Image": BUILD_IMAGE,
                "PrivilegedMode": project.privileged,
                "EnvironmentVariables": variables
            },
            "ServiceRole": { "Fn::GetAtt": [role, "Arn"] }
        }
    }))
}

fn artifact_bucket_access() -> Value {
    json!({
        "Effect": "Allow",
        "Action": ["s3:GetObject", "s3:GetObjectVersion", "s3:GetBucketVersioning", "s3:PutObject"],
        "Resource": [
            { "Fn::GetAtt": [ARTIFACT_BUCKET, "Arn"] },
            { "Fn::Sub": format!("${{{}.Arn}}/*", ARTIFACT_BUCKET) }
        ]
    })
}

fn assume_role_policy(service: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole"
        }]
    })
}

fn pipeline_role(topics: &[&ApprovalTopic]) -> Value {
    let mut statements = vec![
        artifact_bucket_access(),
        json!({
            "Effect": "Allow",
            "Action": ["codebuild:StartBuild", "codebuild:BatchGetBuilds"],
            "Resource": "*"
        }),
    ];
    if !topics.is_empty() {
        let arns: Vec<Value> = topics
            .iter()
            .map(|topic| json!({ "Ref": topic.logical_id }))
            .collect();
        statements.push(json!({ "Effect": "Allow", "Action": "sns:Publish", "Resource": arns }));
    }

    json!({
        "Type": "AWS::IAM::Role",
        "Properties": {
            "AssumeRolePolicyDocument": assume_role_policy("codepipeline.amazonaws.com"),
            "Policies": [{
                "PolicyName": "pipeline",
                "PolicyDocument": { "Version": "2012-10-17", "Statement": statements }
            }]
        }
    })
}

fn project_role(extra_statements: Vec<Value>) -> Value {
    let mut statements = vec![
        artifact_bucket_access(),
        json!({
            "Effect": "Allow",
            "Action": ["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
            "Resource": "*"
        }),
    ];
    statements.extend(extra_statements);

    json!({
        "Type": "AWS::IAM::Role",
        "Properties": {
            "AssumeRolePolicyDocument": assume_role_policy("codebuild.amazonaws.com"),
            "Policies": [{
                "PolicyName": "codebuild",
                "PolicyDocument": { "Version": "2012-10-17", "Statement": statements }
            }]
        }
    })
}

fn webhook(action_name: &str, repository: &GitHubRepository) -> Value {
    json!({
        "Type": "AWS::CodePipeline::Webhook",
        "Properties": {
            "Authentication": "GITHUB_HMAC",
            "AuthenticationConfiguration": {
                "SecretToken": secret_reference(&repository.token_secret_name)
            },
            "Filters": [{
                "JsonPath": "$.ref",
                "MatchEquals": format!("refs/heads/{}", repository.branch)
            }],
            "TargetPipeline": { "Ref": PIPELINE },
            "TargetAction": action_name,
            "TargetPipelineVersion": { "Fn::GetAtt": [PIPELINE, "Version"] },
            "RegisterWithThirdParty": true
        }
    })
}
