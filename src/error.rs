use thiserror::Error;

pub type Result<T> = std::result::Result<T, WardenError>;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Agent parameter is required")]
    AgentRequired,

    #[error("Task not found for session: {0}")]
    TaskNotFound(String),

    #[error("Failed to create background session: {0}")]
    SessionCreate(String),

    #[error("Prompt rejected: {0}")]
    Prompt(String),

    #[error("Session client error: {0}")]
    Client(String),

    #[error("Orchestrator is shut down")]
    Shutdown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration file: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    TomlWrite(#[from] toml::ser::Error),
}

impl WardenError {
    /// Whether the error came from the external session system rather than
    /// this orchestrator's own bookkeeping.
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            Self::SessionCreate(_) | Self::Prompt(_) | Self::Client(_)
        )
    }
}
