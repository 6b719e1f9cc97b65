use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration directory not found")]
    ConfigDirNotFound,

    #[error(
        "No configuration file found. Looked in:\n\
        - the path in MACHINEFLOW_CONFIG\n\
        - the current directory: machineflow.yaml, .machineflow.yaml\n\
        - ~/.config/machineflow/config.yaml"
    )]
    ConfigFileNotFound,

    #[error("Invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("No ARM access token; set MACHINEFLOW_ARM_TOKEN or AZURE_ACCESS_TOKEN")]
    MissingToken,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
