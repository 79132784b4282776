use aws_config::BehaviorVersion;
use aws_sdk_cloudformation::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_types::region::Region;
use tracing::debug;

use crate::deployer::PIPELINE_REGION;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),

    #[error("Stack {0} not found")]
    NotFoundError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackOutput {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
}

impl From<&aws_sdk_cloudformation::types::Output> for StackOutput {
    fn from(output: &aws_sdk_cloudformation::types::Output) -> Self {
        Self {
            key: output.output_key().unwrap_or_default().to_string(),
            value: output.output_value().unwrap_or_default().to_string(),
            description: output.description().map(str::to_string),
        }
    }
}

/// A deployed pipeline stack, looked up in the pipeline region.
pub struct Stack {
    pub stack_name: String,

    client: aws_sdk_cloudformation::Client,
}

impl Stack {
    pub async fn new(stack_name: String, profile: Option<&str>) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(PIPELINE_REGION));
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }

        let sdk_config = loader.load().await;
        let client = aws_sdk_cloudformation::Client::new(&sdk_config);

        return Self { stack_name, client };
    }

    pub async fn get_outputs(&self) -> Result<Vec<StackOutput>, Error> {
        debug!(stack = %self.stack_name, "describing stack");
        let result = self
            .client
            .describe_stacks()
            .stack_name(&self.stack_name)
            .send()
            .await;

        let result = match result {
            Ok(data) => data,
            Err(SdkError::ServiceError(context)) => {
                let err = context.err();
                if is_missing_stack(err.message()) {
                    return Err(Error::NotFoundError(self.stack_name.clone()));
                }
                return Err(Error::ServiceError(DisplayErrorContext(err).to_string()));
            }
            Err(err) => return Err(Error::UnknownError(DisplayErrorContext(&err).to_string())),
        };

        let stack = match result.stacks().first() {
            Some(stack) => stack,
            None => return Err(Error::NotFoundError(self.stack_name.clone())),
        };

        let outputs = stack.outputs().iter().map(StackOutput::from).collect();

        return Ok(outputs);
    }
}

// CloudFormation reports a missing stack as a generic validation error.
fn is_missing_stack(message: Option<&str>) -> bool {
    message.map_or(false, |message| message.contains("does not exist"))
}
