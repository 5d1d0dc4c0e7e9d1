use crate::constants::{
    DEFAULT_PARTITION_COUNT, DEFAULT_PARTITION_SIZE, FRAME_ALIGNMENT, FRAME_HEADER_SIZE,
    MAX_FRAME_LENGTH_DIVISOR, MAX_PARTITION_SIZE, MIN_PARTITION_COUNT,
};
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::utils::align;
use std::time::Duration;

/// Default conductor duty cycle period.
pub const DEFAULT_CONDUCTOR_IDLE: Duration = Duration::from_millis(1);

/// How subscriptions relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Every subscription sees every fragment, at its own pace.
    #[default]
    Broadcast,
    /// Subscriptions form a chain, each one only reads what the previous one
    /// has already consumed. The stages are fixed at construction.
    Pipeline,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub name: String,
    pub partition_size: u32,
    pub partition_count: u32,
    /// Backpressure margin, `None` means a quarter of a partition.
    pub window_length: Option<u32>,
    pub mode: Mode,
    /// Subscriptions opened at construction, in stage order for pipelines.
    pub subscription_names: Vec<String>,
    pub conductor_idle: Duration,
    pub verify_checksums: bool,
}

impl DispatcherConfig {
    pub fn new(name: &str) -> DispatcherConfig {
        return DispatcherConfig {
            name: name.to_string(),
            partition_size: DEFAULT_PARTITION_SIZE,
            partition_count: DEFAULT_PARTITION_COUNT,
            window_length: None,
            mode: Mode::Broadcast,
            subscription_names: vec![],
            conductor_idle: DEFAULT_CONDUCTOR_IDLE,
            verify_checksums: false,
        };
    }

    pub fn max_frame_length(&self) -> u32 {
        return self.partition_size / MAX_FRAME_LENGTH_DIVISOR;
    }

    /// Bytes one frame of `max_frame_length` takes on the buffer, and the
    /// most any single offer or claim may reserve.
    pub fn max_reservation(&self) -> u32 {
        return align(FRAME_HEADER_SIZE + self.max_frame_length() as usize, FRAME_ALIGNMENT) as u32;
    }

    pub fn effective_window_length(&self) -> u32 {
        return self.window_length.unwrap_or(self.partition_size / 4);
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |reason: String| Err(Error::InvalidConfig { reason });

        if self.partition_count < MIN_PARTITION_COUNT {
            return invalid(format!(
                "need at least {} partitions, got {}",
                MIN_PARTITION_COUNT, self.partition_count
            ));
        }
        if self.partition_size as usize % FRAME_ALIGNMENT != 0 {
            return invalid(format!(
                "partition size {} is not a multiple of {}",
                self.partition_size, FRAME_ALIGNMENT
            ));
        }
        if self.partition_size > MAX_PARTITION_SIZE {
            return invalid(format!(
                "partition size {} is larger than {}",
                self.partition_size, MAX_PARTITION_SIZE
            ));
        }
        if self.max_frame_length() == 0 {
            return invalid(format!(
                "partition size {} leaves no room for frames",
                self.partition_size
            ));
        }

        let window = self.effective_window_length();
        if window == 0 {
            return invalid("window length must be positive".to_string());
        }
        // a producer admitted just below the limit must not be able to reach
        // the end of the partition after the one the slowest reader is in
        let needed = window as u64 + self.max_reservation() as u64;
        if needed > self.partition_size as u64 {
            return invalid(format!(
                "window length {} plus a max size frame of {} bytes does not fit a partition of {}",
                window,
                self.max_reservation(),
                self.partition_size
            ));
        }

        if self.mode == Mode::Pipeline && self.subscription_names.is_empty() {
            return invalid("pipeline mode needs its stages up front".to_string());
        }
        for (i, name) in self.subscription_names.iter().enumerate() {
            if self.subscription_names[..i].contains(name) {
                return invalid(format!("subscription name '{}' is used twice", name));
            }
        }
        return Ok(());
    }
}

/// Builds a [`Dispatcher`], see [`Dispatcher::builder`].
#[derive(Debug, Clone)]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    pub fn new(name: &str) -> DispatcherBuilder {
        return DispatcherBuilder {
            config: DispatcherConfig::new(name),
        };
    }

    pub fn partition_size(mut self, partition_size: u32) -> Self {
        self.config.partition_size = partition_size;
        return self;
    }

    pub fn partition_count(mut self, partition_count: u32) -> Self {
        self.config.partition_count = partition_count;
        return self;
    }

    pub fn window_length(mut self, window_length: u32) -> Self {
        self.config.window_length = Some(window_length);
        return self;
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        return self;
    }

    pub fn subscriptions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.subscription_names = names.into_iter().map(Into::into).collect();
        return self;
    }

    pub fn conductor_idle(mut self, idle: Duration) -> Self {
        self.config.conductor_idle = idle;
        return self;
    }

    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.config.verify_checksums = verify;
        return self;
    }

    pub fn config(&self) -> &DispatcherConfig {
        return &self.config;
    }

    pub fn build(self) -> Result<Dispatcher, Error> {
        self.config.validate()?;
        return Dispatcher::new(self.config);
    }
}
