//! Per-invocation workspace holding the validated parameters and the
//! synthesized template handed to the deployment tool.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use tracing::{debug, info};

use crate::config::{self, CicdParameters};
use crate::writer::Format;

pub const PARAMETERS_FILE_NAME: &str = "cicd_parameters.json";
pub const TEMPLATE_FILE_NAME: &str = "template";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to prepare a workspace in {0}: {1}")]
    WorkspaceError(String, io::Error),

    #[error("Unable to write {0}: {1}")]
    WriteError(String, io::Error),

    #[error("Persisted parameters cannot be read back: {0}")]
    ParametersError(#[from] config::Error),
}

/// A uniquely named directory owned by one invocation. Temporary workspaces
/// are removed on drop; workspaces created under an artifacts directory are kept.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    _temporary: Option<TempDir>,
}

impl Workspace {
    pub fn create(artifacts_dir: Option<&Path>, stack_name: &str) -> Result<Self, Error> {
        let prefix = format!("{}-", directory_prefix(stack_name));
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);

        let workspace = match artifacts_dir {
            Some(dir) => {
                let dir = fs::create_dir_all(dir)
                    .and_then(|_| builder.tempdir_in(dir))
                    .map_err(|error| Error::WorkspaceError(dir.display().to_string(), error))?;
                Self {
                    path: dir.keep(),
                    _temporary: None,
                }
            }
            None => {
                let dir = builder.tempdir().map_err(|error| {
                    Error::WorkspaceError(std::env::temp_dir().display().to_string(), error)
                })?;
                Self {
                    path: dir.path().to_path_buf(),
                    _temporary: Some(dir),
                }
            }
        };

        debug!(path = %workspace.path.display(), "created workspace");
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parameters_path(&self) -> PathBuf {
        self.path.join(PARAMETERS_FILE_NAME)
    }

    pub fn template_path(&self, format: Format) -> PathBuf {
        self.path
            .join(format!("{}.{}", TEMPLATE_FILE_NAME, format.extension()))
    }

    /// Writes the parameters verbatim, replacing any previous copy in this workspace.
    pub fn persist_parameters(&self, raw: &str) -> Result<PathBuf, Error> {
        let path = self.parameters_path();
        fs::write(&path, raw)
            .map_err(|error| Error::WriteError(path.display().to_string(), error))?;

        info!(path = %path.display(), "persisted parameters");
        Ok(path)
    }

    pub fn load_parameters(&self) -> Result<CicdParameters, Error> {
        let loaded = config::parse(&self.parameters_path())?;
        Ok(loaded.parameters)
    }
}

// Stack names are only length checked; path separators must not leave the parent.
fn directory_prefix(stack_name: &str) -> String {
    let prefix: String = stack_name
        .chars()
        .filter(|character| character.is_ascii_alphanumeric() || matches!(character, '-' | '_'))
        .collect();

    if prefix.is_empty() {
        String::from("workspace")
    } else {
        prefix
    }
}
