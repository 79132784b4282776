use std::fs::{self};
use std::path::Path;

use crate::template::Template;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to serialize the template: {0}")]
    SerializationError(String),

    #[error("Unable to write {0}: {1}")]
    WriteError(String, std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Yaml => "yaml",
        }
    }
}

pub fn render(template: &Template, format: Format) -> Result<String, Error> {
    let contents = match format {
        Format::Json => serde_json::to_string_pretty(template)
            .map_err(|error| Error::SerializationError(error.to_string())),
        Format::Yaml => serde_yaml::to_string(template)
            .map_err(|error| Error::SerializationError(error.to_string())),
    }?;

    return Ok(contents);
}

pub fn write(path: &Path, template: &Template, format: Format) -> Result<(), Error> {
    let file_contents = render(template, format)?;
    fs::write(path, file_contents)
        .map_err(|error| Error::WriteError(path.display().to_string(), error))
}
