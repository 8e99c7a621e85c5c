use crate::submission::SubmissionId;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Broker Error: {0}")]
    Broker(String),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource Not Found: {resource_type} with ID {resource_id}")]
    NotFound {
        resource_type: String,
        resource_id: String,
    },

    #[error("Invalid Input: {0}")]
    InvalidInput(String),

    #[error("State Transition Error: {0}")]
    StateTransition(String),

    #[error("Protocol Error: {0}")]
    Protocol(String),

    #[error("Queue Full: submission {submission_id} already holds {limit} pending files")]
    QueueFull {
        submission_id: SubmissionId,
        limit: usize,
    },

    #[error("Tool Execution Error: {0}")]
    ToolExecution(String),

    #[error("Channel Communication Error: {0}")]
    ChannelComm(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(resource_type: &str, resource_id: impl ToString) -> Self {
        Error::NotFound {
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
        }
    }
}
