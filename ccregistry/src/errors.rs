use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Backend '{name}' failed to start: {source}")]
    BackendStart {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Backend '{name}' failed to stop: {source}")]
    BackendStop {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Media server failed to start on {host}:{port}: {source}")]
    MediaServerStart {
        host: String,
        port: u16,
        #[source]
        source: anyhow::Error,
    },
    #[error("Media server failed to stop: {0}")]
    MediaServerStop(#[source] anyhow::Error),
    #[error("Media server unavailable")]
    MediaServerUnavailable,
    #[error("Media payload '{id}' could not be registered: {source}")]
    MediaPayload {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl RegistryError {
    pub fn backend_start(name: &str, source: anyhow::Error) -> Self {
        RegistryError::BackendStart {
            name: name.to_string(),
            source,
        }
    }

    pub fn backend_stop(name: &str, source: anyhow::Error) -> Self {
        RegistryError::BackendStop {
            name: name.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
