use thiserror::Error;

/// Top-level error type for the delivery pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::app::ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] crate::buffer::ChannelError),

    #[error("Sender error: {0}")]
    Sender(#[from] crate::sender::SenderError),

    #[error("Disk error: {0}")]
    Disk(#[from] crate::reliability::DiskError),

    #[error("Input error: {0}")]
    Input(String),
}
