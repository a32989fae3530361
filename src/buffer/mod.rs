pub mod batch;
pub mod channel;
pub mod error;

pub use batch::{Batch, ChannelConfig};
pub use channel::{BatchingChannel, FlushOutcome};
pub use error::ChannelError;
