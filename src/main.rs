use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use codepipeline_cicd::config::{self, LoadedParameters};
use codepipeline_cicd::deployer::{self, DeployCommand, Deployer, DEFAULT_DEPLOY_TOOL};
use codepipeline_cicd::store::Workspace;
use codepipeline_cicd::writer::{self, Format};
use codepipeline_cicd::{outputs, pipeline, template};

#[derive(Parser)]
#[command(
    name = "cicd",
    about = "Creates CI/CD pipelines for your project with AWS CodePipeline",
    version
)]
struct Cli {
    /// Print debug logs
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ParamsArgs {
    /// Path to a JSON file containing parameters for your CICD pipeline
    #[arg(long = "params-file")]
    params_file: PathBuf,
}

#[derive(Args)]
struct DeployArgs {
    #[command(flatten)]
    params: ParamsArgs,

    /// The AWS profile with which you want to deploy the CICD pipeline. If not provided, your default profile is used
    #[arg(long = "aws-profile")]
    aws_profile: Option<String>,

    /// Program invoked to deploy the pipeline stack
    #[arg(long, env = "CICD_DEPLOY_TOOL", default_value = DEFAULT_DEPLOY_TOOL)]
    deploy_tool: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Creates a CICD pipeline for your project with AWS CodePipeline
    Create {
        #[command(flatten)]
        deploy: DeployArgs,

        /// Keep the parameters and template of this run under the given directory
        #[arg(long, env = "CICD_ARTIFACTS_DIR")]
        artifacts_dir: Option<PathBuf>,
    },

    /// Removes the CICD pipeline previously created with the provided json parameters
    Remove {
        #[command(flatten)]
        deploy: DeployArgs,
    },

    /// Validates a parameters file and prints the resulting pipeline layout
    Validate {
        #[command(flatten)]
        params: ParamsArgs,
    },

    /// Prints the CloudFormation template of the pipeline
    Synth {
        #[command(flatten)]
        params: ParamsArgs,

        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,

        /// Write the template to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Shows the outputs of a deployed pipeline stack
    Status {
        #[command(flatten)]
        params: ParamsArgs,

        /// The AWS profile used to look up the stack
        #[arg(long = "aws-profile")]
        aws_profile: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Reads and validates a parameters file. Violations are printed and yield `None`.
fn load(path: &Path) -> anyhow::Result<Option<LoadedParameters>> {
    match config::parse(path) {
        Ok(loaded) => Ok(Some(loaded)),
        Err(config::Error::ValidationError(violations)) => {
            eprintln!("Invalid parameters file!");
            eprintln!("{}", violations);
            Ok(None)
        }
        Err(error) => Err(error).with_context(|| format!("cannot load {}", path.display())),
    }
}

async fn deploy(
    deploy: DeployArgs,
    artifacts_dir: Option<&Path>,
    create: bool,
) -> anyhow::Result<ExitCode> {
    let loaded = match load(&deploy.params.params_file)? {
        Some(loaded) => loaded,
        None => return Ok(ExitCode::FAILURE),
    };

    let workspace = Workspace::create(artifacts_dir, &loaded.parameters.stack_name)?;
    info!(workspace = %workspace.path().display(), "prepared workspace");
    workspace.persist_parameters(&loaded.raw)?;
    let parameters = workspace.load_parameters()?;

    let deployer = Deployer::new(deploy.deploy_tool, &parameters.stack_name, deploy.aws_profile);
    let command = if create {
        let template = template::synthesize(&pipeline::build(&parameters))?;
        let template_path = workspace.template_path(Format::Json);
        writer::write(&template_path, &template, Format::Json)?;
        DeployCommand::Create {
            template: template_path,
        }
    } else {
        DeployCommand::Remove
    };

    info!(stack = %deployer.stack_name(), "handing over to the deployment tool");
    let status = deployer.run(&command).await?;
    Ok(ExitCode::from(deployer::exit_code(status)))
}

async fn run(command: Commands) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Create {
            deploy: args,
            artifacts_dir,
        } => deploy(args, artifacts_dir.as_deref(), true).await,
        Commands::Remove { deploy: args } => deploy(args, None, false).await,
        Commands::Validate { params } => {
            let loaded = match load(&params.params_file)? {
                Some(loaded) => loaded,
                None => return Ok(ExitCode::FAILURE),
            };

            let pipeline = pipeline::build(&loaded.parameters);
            println!("Parameters file is valid. Pipeline {}:", pipeline.name);
            for stage in &pipeline.stages {
                println!("  {} ({} actions)", stage.name, stage.actions.len());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Synth {
            params,
            format,
            output,
        } => {
            let loaded = match load(&params.params_file)? {
                Some(loaded) => loaded,
                None => return Ok(ExitCode::FAILURE),
            };

            let template = template::synthesize(&pipeline::build(&loaded.parameters))?;
            match output {
                Some(path) => writer::write(&path, &template, format)?,
                None => println!("{}", writer::render(&template, format)?),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status {
            params,
            aws_profile,
        } => {
            let loaded = match load(&params.params_file)? {
                Some(loaded) => loaded,
                None => return Ok(ExitCode::FAILURE),
            };

            let stack_name = deployer::pipeline_stack_name(&loaded.parameters.stack_name);
            let stack = outputs::Stack::new(stack_name, aws_profile.as_deref()).await;
            for output in stack.get_outputs().await? {
                println!("{}\t{}", output.key, output.value);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli.command).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {:#}", error);
            ExitCode::FAILURE
        }
    }
}
