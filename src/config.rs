use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashSet, fmt, fs, io, path::Path, str::FromStr};
use validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};

/// Role assumed in the target account when a stage does not name one.
pub const DEFAULT_DEPLOY_ROLE_NAME: &str = "OrganizationAccountAccessRole";

const MIN_REGION_LENGTH: usize = 5;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation errors:\n{0}")]
    ValidationError(Violations),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

/// The constraint a configuration value failed to satisfy.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Required,
    Length { min: Option<u64>, max: Option<u64> },
    Email(String),
    Region(String),
    RepositoryType(String),
    ApprovalWithoutSubscribers,
    DuplicateStageName(String),
    Malformed(String),
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Required => write!(f, "is required"),
            Constraint::Length {
                min: Some(min),
                max: Some(max),
            } => write!(f, "length must be between {} and {}", min, max),
            Constraint::Length { min: Some(min), .. } => write!(f, "length must be at least {}", min),
            Constraint::Length { max: Some(max), .. } => write!(f, "length must be at most {}", max),
            Constraint::Length { .. } => write!(f, "has an invalid length"),
            Constraint::Email(value) => write!(f, "`{}` is not a valid email address", value),
            Constraint::Region(value) => {
                write!(f, "`{}` is not a valid region, it must be at least 5 characters", value)
            }
            Constraint::RepositoryType(value) => {
                write!(f, "unsupported repository type `{}`, expected `GITHUB_REPO`", value)
            }
            Constraint::ApprovalWithoutSubscribers => write!(
                f,
                "manual approval is requested but no subscriber would be notified"
            ),
            Constraint::DuplicateStageName(name) => {
                write!(f, "stage name `{}` is used more than once", name)
            }
            Constraint::Malformed(message) => write!(f, "malformed value: {}", message),
        }
    }
}

impl From<&ValidationError> for Constraint {
    fn from(error: &ValidationError) -> Self {
        let param = |name: &str| error.params.get(name);
        let value = || {
            param("value")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        match &*error.code {
            "required" => Constraint::Required,
            "length" => Constraint::Length {
                min: param("min").and_then(Value::as_u64),
                max: param("max").and_then(Value::as_u64),
            },
            "repository_type" => Constraint::RepositoryType(value()),
            other => Constraint::Malformed(format!("failed the `{}` check", other)),
        }
    }
}

/// A single failed constraint, addressed by its JSON path (e.g. `stages[1].awsAccountId`).
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub path: String,
    pub constraint: Constraint,
}

impl Violation {
    pub fn new(path: impl Into<String>, constraint: Constraint) -> Self {
        Self {
            path: path.into(),
            constraint,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.constraint)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Violations(pub Vec<Violation>);

impl Violations {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.0.iter()
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, violation) in self.0.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "  - {}", violation)?;
        }
        Ok(())
    }
}

/// Repository providers understood by the `type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryKind {
    GitHub,
}

impl FromStr for RepositoryKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "GITHUB_REPO" => Ok(RepositoryKind::GitHub),
            other => Err(other.to_string()),
        }
    }
}

// Raw documents mirror the JSON layout. Every field is optional so that a
// missing value surfaces as a `required` violation instead of a parse failure.
// `Serialize` is needed by the validator derive, which attaches the offending
// value to each error.

#[derive(Debug, Default, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ParametersDocument {
    #[validate(required, length(min = 1, max = 15))]
    pub stack_name: Option<String>,

    #[validate(required)]
    pub repository_parameters: Option<RepositoryDocument>,

    #[validate(required, length(min = 1))]
    pub build_dockerfile_path: Option<String>,

    /// Entries that are not JSON objects are kept as `None` so indexes stay stable.
    #[validate(required, length(min = 1))]
    pub stages: Option<Vec<Option<StageDocument>>>,
}

#[derive(Debug, Default, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryDocument {
    #[serde(rename = "type")]
    #[validate(required, custom = "validate_repository_type")]
    pub kind: Option<String>,

    #[validate(required, length(min = 1))]
    pub personnal_token_secret_name: Option<String>,

    #[validate(required, length(min = 1))]
    pub owner: Option<String>,

    #[validate(required, length(min = 1))]
    pub repo: Option<String>,

    #[validate(required, length(min = 1))]
    pub branch: Option<String>,
}

#[derive(Debug, Default, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StageDocument {
    #[validate(required, length(min = 1))]
    pub name: Option<String>,

    #[validate(required, length(min = 12))]
    pub aws_account_id: Option<String>,

    #[validate(required, length(min = 1))]
    pub deploy_to_regions: Option<Vec<String>>,

    pub manual_approval_before_deployment: Option<bool>,

    pub manual_approval_subscribers: Option<Vec<String>>,

    #[validate(length(min = 1))]
    pub deploy_role_name: Option<String>,
}

/// Fields of one JSON object. Values of the wrong type are reported under
/// their own path and read as absent, so the remaining checks still run.
struct Fields<'a> {
    object: &'a Map<String, Value>,
    prefix: String,
}

impl<'a> Fields<'a> {
    fn new(object: &'a Map<String, Value>, prefix: String) -> Self {
        Self { object, prefix }
    }

    fn path(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.object.get(key).filter(|value| !value.is_null())
    }

    fn value<T: DeserializeOwned>(&self, key: &str, violations: &mut Vec<Violation>) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(value) => Some(value),
            Err(error) => {
                violations.push(Violation::new(
                    self.path(key),
                    Constraint::Malformed(error.to_string()),
                ));
                None
            }
        }
    }

    fn object(&self, key: &str, violations: &mut Vec<Violation>) -> Option<Fields<'a>> {
        let value = self.get(key)?;
        match value.as_object() {
            Some(object) => Some(Fields::new(object, format!("{}.", self.path(key)))),
            None => {
                violations.push(Violation::new(self.path(key), expected("an object", value)));
                None
            }
        }
    }

    fn list(&self, key: &str, violations: &mut Vec<Violation>) -> Option<&'a Vec<Value>> {
        let value = self.get(key)?;
        match value.as_array() {
            Some(items) => Some(items),
            None => {
                violations.push(Violation::new(self.path(key), expected("an array", value)));
                None
            }
        }
    }
}

fn expected(what: &str, value: &Value) -> Constraint {
    let found = match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    Constraint::Malformed(format!("expected {}, found {}", what, found))
}

impl ParametersDocument {
    fn read(fields: &Fields, violations: &mut Vec<Violation>) -> Self {
        let stages = fields.list("stages", violations).map(|items| {
            let mut stages = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let path = format!("stages[{}]", index);
                match item.as_object() {
                    Some(object) => stages.push(Some(StageDocument::read(
                        &Fields::new(object, format!("{}.", path)),
                        violations,
                    ))),
                    None => {
                        violations.push(Violation::new(path, expected("an object", item)));
                        stages.push(None);
                    }
                }
            }
            stages
        });

        Self {
            stack_name: fields.value("stackName", violations),
            repository_parameters: fields
                .object("repositoryParameters", violations)
                .map(|repository| RepositoryDocument::read(&repository, violations)),
            build_dockerfile_path: fields.value("buildDockerfilePath", violations),
            stages,
        }
    }

    fn violations(&self, mut violations: Vec<Violation>) -> Violations {
        collect("", self.validate(), &mut violations);

        if let Some(repository) = &self.repository_parameters {
            collect("repositoryParameters.", repository.validate(), &mut violations);
        }

        if let Some(stages) = &self.stages {
            let mut seen = HashSet::new();
            for (index, stage) in stages.iter().enumerate() {
                let stage = match stage {
                    Some(stage) => stage,
                    None => continue,
                };
                let prefix = format!("stages[{}].", index);
                collect(&prefix, stage.validate(), &mut violations);

                let regions = stage.deploy_to_regions.iter().flatten();
                for (position, region) in regions.enumerate() {
                    if region.chars().count() < MIN_REGION_LENGTH {
                        violations.push(Violation::new(
                            format!("{}deployToRegions[{}]", prefix, position),
                            Constraint::Region(region.clone()),
                        ));
                    }
                }

                let subscribers = stage.manual_approval_subscribers.iter().flatten();
                for (position, email) in subscribers.enumerate() {
                    if !validator::validate_email(email.as_str()) {
                        violations.push(Violation::new(
                            format!("{}manualApprovalSubscribers[{}]", prefix, position),
                            Constraint::Email(email.clone()),
                        ));
                    }
                }

                let has_subscribers = stage
                    .manual_approval_subscribers
                    .as_ref()
                    .map_or(false, |subscribers| !subscribers.is_empty());
                if stage.manual_approval_before_deployment == Some(true) && !has_subscribers {
                    violations.push(Violation::new(
                        format!("{}manualApprovalSubscribers", prefix),
                        Constraint::ApprovalWithoutSubscribers,
                    ));
                }

                if let Some(name) = &stage.name {
                    if !seen.insert(name.as_str()) {
                        violations.push(Violation::new(
                            format!("{}name", prefix),
                            Constraint::DuplicateStageName(name.clone()),
                        ));
                    }
                }
            }
        }

        // A value of the wrong type is already reported; do not also call it missing.
        let malformed: HashSet<String> = violations
            .iter()
            .filter(|violation| matches!(violation.constraint, Constraint::Malformed(_)))
            .map(|violation| violation.path.clone())
            .collect();
        violations.retain(|violation| {
            violation.constraint != Constraint::Required || !malformed.contains(&violation.path)
        });

        Violations(violations)
    }
}

impl RepositoryDocument {
    fn read(fields: &Fields, violations: &mut Vec<Violation>) -> Self {
        Self {
            kind: fields.value("type", violations),
            personnal_token_secret_name: fields.value("personnalTokenSecretName", violations),
            owner: fields.value("owner", violations),
            repo: fields.value("repo", violations),
            branch: fields.value("branch", violations),
        }
    }
}

impl StageDocument {
    fn read(fields: &Fields, violations: &mut Vec<Violation>) -> Self {
        Self {
            name: fields.value("name", violations),
            aws_account_id: fields.value("awsAccountId", violations),
            deploy_to_regions: fields.value("deployToRegions", violations),
            manual_approval_before_deployment: fields
                .value("manualApprovalBeforeDeployment", violations),
            manual_approval_subscribers: fields.value("manualApprovalSubscribers", violations),
            deploy_role_name: fields.value("deployRoleName", violations),
        }
    }
}

fn collect(prefix: &str, result: Result<(), ValidationErrors>, violations: &mut Vec<Violation>) {
    let errors = match result {
        Ok(_) => return,
        Err(errors) => errors,
    };

    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by_key(|(field, _)| **field);

    for (field, kind) in fields {
        if let ValidationErrorsKind::Field(field_errors) = kind {
            let path = format!("{}{}", prefix, json_field_name(field));
            for error in field_errors {
                violations.push(Violation::new(path.clone(), Constraint::from(error)));
            }
        }
    }
}

// The validator derive reports Rust field names; `rename_all` is not visible to it.
fn json_field_name(field: &str) -> String {
    if field == "kind" {
        return String::from("type");
    }

    let mut name = String::with_capacity(field.len());
    let mut upper = false;
    for character in field.chars() {
        if character == '_' {
            upper = true;
        } else if upper {
            name.extend(character.to_uppercase());
            upper = false;
        } else {
            name.push(character);
        }
    }
    name
}

// The derive attaches the checked string as the `value` param.
fn validate_repository_type(value: &str) -> Result<(), ValidationError> {
    match value.parse::<RepositoryKind>() {
        Ok(_) => Ok(()),
        Err(_) => Err(ValidationError::new("repository_type")),
    }
}

/// Validated parameters of a CI/CD pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CicdParameters {
    pub stack_name: String,
    pub repository: RepositoryParameters,
    pub build_dockerfile_path: String,
    pub stages: Vec<StageParameters>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum RepositoryParameters {
    #[serde(rename = "GITHUB_REPO")]
    GitHub(GitHubRepository),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubRepository {
    /// Name of the Secrets Manager secret holding the personal access token.
    pub token_secret_name: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageParameters {
    pub name: String,
    pub aws_account_id: String,
    pub deploy_to_regions: Vec<String>,
    pub manual_approval_before_deployment: bool,
    pub manual_approval_subscribers: Vec<String>,
    pub deploy_role_name: String,
}

impl StageParameters {
    /// An approval gate only has an effect when someone is notified.
    pub fn requires_approval(&self) -> bool {
        self.manual_approval_before_deployment && !self.manual_approval_subscribers.is_empty()
    }

    pub fn deploy_role_arn(&self) -> String {
        format!(
            "arn:aws:iam::{}:role/{}",
            self.aws_account_id, self.deploy_role_name
        )
    }
}

fn require<T>(value: Option<T>, path: &str) -> Result<T, Violations> {
    value.ok_or_else(|| Violations(vec![Violation::new(path, Constraint::Required)]))
}

impl TryFrom<ParametersDocument> for CicdParameters {
    type Error = Violations;

    fn try_from(document: ParametersDocument) -> Result<Self, Self::Error> {
        let repository = require(document.repository_parameters, "repositoryParameters")?;
        let kind = require(repository.kind, "repositoryParameters.type")?;
        let kind = kind.parse::<RepositoryKind>().map_err(|found| {
            Violations(vec![Violation::new(
                "repositoryParameters.type",
                Constraint::RepositoryType(found),
            )])
        })?;

        let repository = match kind {
            RepositoryKind::GitHub => RepositoryParameters::GitHub(GitHubRepository {
                token_secret_name: require(
                    repository.personnal_token_secret_name,
                    "repositoryParameters.personnalTokenSecretName",
                )?,
                owner: require(repository.owner, "repositoryParameters.owner")?,
                repo: require(repository.repo, "repositoryParameters.repo")?,
                branch: require(repository.branch, "repositoryParameters.branch")?,
            }),
        };

        let stages = require(document.stages, "stages")?
            .into_iter()
            .enumerate()
            .map(|(index, stage)| {
                let stage = require(stage, &format!("stages[{}]", index))?;
                Ok(StageParameters {
                    name: require(stage.name, &format!("stages[{}].name", index))?,
                    aws_account_id: require(
                        stage.aws_account_id,
                        &format!("stages[{}].awsAccountId", index),
                    )?,
                    deploy_to_regions: require(
                        stage.deploy_to_regions,
                        &format!("stages[{}].deployToRegions", index),
                    )?,
                    manual_approval_before_deployment: stage
                        .manual_approval_before_deployment
                        .unwrap_or(false),
                    manual_approval_subscribers: stage.manual_approval_subscribers.unwrap_or_default(),
                    deploy_role_name: stage
                        .deploy_role_name
                        .unwrap_or_else(|| DEFAULT_DEPLOY_ROLE_NAME.to_string()),
                })
            })
            .collect::<Result<Vec<_>, Violations>>()?;

        Ok(CicdParameters {
            stack_name: require(document.stack_name, "stackName")?,
            repository,
            build_dockerfile_path: require(document.build_dockerfile_path, "buildDockerfilePath")?,
            stages,
        })
    }
}

/// Verdict of validating a parameters document.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Valid(CicdParameters),
    Invalid(Violations),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }

    pub fn violations(&self) -> Option<&Violations> {
        match self {
            Validation::Valid(_) => None,
            Validation::Invalid(violations) => Some(violations),
        }
    }
}

/// Validates an arbitrary JSON value. Never fails: malformed input yields an
/// `Invalid` verdict.
pub fn validate(value: &Value) -> Validation {
    let object = match value.as_object() {
        Some(object) => object,
        None => {
            return Validation::Invalid(Violations(vec![Violation::new(
                "$",
                expected("an object", value),
            )]))
        }
    };

    let mut read_violations = Vec::new();
    let fields = Fields::new(object, String::new());
    let document = ParametersDocument::read(&fields, &mut read_violations);
    let violations = document.violations(read_violations);
    if !violations.is_empty() {
        return Validation::Invalid(violations);
    }

    match CicdParameters::try_from(document) {
        Ok(parameters) => Validation::Valid(parameters),
        Err(violations) => Validation::Invalid(violations),
    }
}

/// Validated parameters along with the exact text they were read from.
#[derive(Debug, Clone)]
pub struct LoadedParameters {
    pub raw: String,
    pub parameters: CicdParameters,
}

pub fn parse(path: &Path) -> Result<LoadedParameters, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    parse_str(contents)
}

pub fn parse_str(contents: String) -> Result<LoadedParameters, Error> {
    let document: Value = match serde_json::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    match validate(&document) {
        Validation::Valid(parameters) => Ok(LoadedParameters {
            raw: contents,
            parameters,
        }),
        Validation::Invalid(violations) => Err(Error::ValidationError(violations)),
    }
}
