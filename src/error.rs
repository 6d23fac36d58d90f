use thiserror::Error;

use crate::command::CommandError;
use crate::election::ElectionError;

#[derive(Error, Debug)]
pub enum TewError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Template error in {name}: {message}")]
    Template { name: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to extract embedded file {filename}: {source}")]
    Extraction {
        filename: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server {name} failed to start: {message}")]
    ServerStart { name: String, message: String },

    #[error("Server {name} failed to stop: {message}")]
    ServerStop { name: String, message: String },

    #[error("Cluster setup failed at command {name}: {source}")]
    SetupFailed {
        name: String,
        #[source]
        source: CommandError,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Election error: {0}")]
    Election(#[from] ElectionError),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TewError>;
