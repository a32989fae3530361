use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Invalid channel configuration: {0}")]
    InvalidConfig(String),
    #[error("No async runtime available: {0}")]
    NoRuntime(String),
}
