use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Event handler failed: {0}")]
    HandlerFailed(String),

    #[error("Event handler panicked")]
    HandlerPanicked,
}

pub type Result<T> = std::result::Result<T, EventBusError>;
