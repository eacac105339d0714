use futures::task::SpawnError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FeedError>;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("native engine returned a null stream handle")]
    Create,
    #[error("native attach failed with status {status}")]
    Attach { status: i32 },
    #[error("data handler failed: {0}")]
    Handler(#[source] anyhow::Error),
    #[error("feed has been destroyed")]
    Destroyed,
    #[error("scheduler rejected task: {0}")]
    Spawn(#[from] SpawnError),
}

impl FeedError {
    /// Native status code carried by the error, if any.
    pub fn status(&self) -> Option<i32> {
        match self {
            Self::Attach { status } => Some(*status),
            _ => None,
        }
    }
}
