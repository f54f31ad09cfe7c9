use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum XnatError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("not found on XNAT: {0}")]
    NotFound(String),

    #[error("no direct mount for {frequency} rows when mounted at {mount_frequency} level")]
    NoDirectMount {
        frequency: String,
        mount_frequency: String,
    },

    #[error("could not unpack downloaded archive {path}")]
    Transfer {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("downloaded archive has no `files` directory under {0}")]
    MissingFilesDir(PathBuf),

    #[error("unrecognised format: {0}")]
    FormatRecognition(String),

    #[error("invalid XNAT URI: {0}")]
    InvalidUri(String),

    #[error("missing config file xnat-store.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("XNAT request failed: {0}")]
    XnatHttp(String),

    #[error("XNAT returned status {status}: {message}")]
    XnatStatus { status: u16, message: String },

    #[error("unexpected XNAT response: {0}")]
    XnatResponse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
