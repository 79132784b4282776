//! Generates AWS CodePipeline CI/CD stacks from a JSON parameters file.

pub mod config;
pub mod deployer;
pub mod outputs;
pub mod pipeline;
pub mod store;
pub mod template;
pub mod writer;
