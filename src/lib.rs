mod claimed_fragment;
mod conductor;
mod config;
mod constants;
mod dispatcher;
mod error;
mod log_appender;
mod log_buffer;
mod mem_fd;
mod partition;
mod position;
mod subscription;
mod utils;

pub use crate::claimed_fragment::{ClaimedFragment, ClaimedFragmentBatch};
pub use crate::conductor::Completion;
pub use crate::config::{DispatcherBuilder, DispatcherConfig, Mode, DEFAULT_CONDUCTOR_IDLE};
pub use crate::dispatcher::Dispatcher;
pub use crate::error::{Error, Result};
pub use crate::log_appender::{Appended, LogAppender};
pub use crate::log_buffer::LogBuffer;
pub use crate::partition::{FrameView, LogBufferPartition, ReadFrame, Reservation};
pub use crate::position::Position;
pub use crate::subscription::{BlockPeek, Fragment, FragmentHandler, FragmentResult, Subscription};
