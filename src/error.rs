use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The publisher limit was reached, a subscription has to catch up first.
    #[error("publisher limit reached")]
    Backpressure,

    /// The active partition filled up during this call and the buffer moved
    /// (or tried to move) on to the next partition. Offer again.
    #[error("end of partition reached, retry on the next partition")]
    EndOfPartition,

    #[error("dispatcher is closed")]
    Closed,

    #[error("frame length {length} is larger than the max frame length of {max}")]
    FrameTooLarge { length: usize, max: usize },

    #[error("a batch needs at least one fragment")]
    EmptyBatch,

    #[error("fragment of {requested} bytes does not fit into the {remaining} bytes left in the batch")]
    FragmentOverflow { requested: usize, remaining: usize },

    #[error("illegal topology operation: {reason}")]
    IllegalTopology { reason: String },

    #[error("subscription with name '{name}' not registered")]
    UnknownSubscription { name: String },

    #[error("invalid dispatcher config: {reason}")]
    InvalidConfig { reason: String },

    #[error("conductor is not running")]
    ConductorStopped,

    #[error("{context}: {source}")]
    Memory {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn memory(context: &'static str) -> Error {
        return Error::Memory {
            context,
            source: io::Error::last_os_error(),
        };
    }

    /// True for the hot path outcomes a producer is expected to simply retry.
    pub fn is_retryable(&self) -> bool {
        return matches!(self, Error::Backpressure | Error::EndOfPartition);
    }
}
