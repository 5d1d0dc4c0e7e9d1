/*
 * The dispatcher ties it all together: producers offer or claim into the
 * active partition of the log buffer, admitted only while they stay below the
 * publisher limit, and subscriptions read behind them. The limit only moves
 * forward, driven by the slowest subscription, which is all the backpressure
 * there is.
*/
use crate::claimed_fragment::{ClaimedFragment, ClaimedFragmentBatch};
use crate::conductor::{Command, Completion, Conductor};
use crate::config::{DispatcherBuilder, DispatcherConfig, Mode};
use crate::error::Error;
use crate::log_appender::{Appended, LogAppender};
use crate::log_buffer::LogBuffer;
use crate::partition::LogBufferPartition;
use crate::position::Position;
use crate::subscription::{Subscription, SubscriptionState};
use arc_swap::ArcSwap;
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Raises `value` to `proposed` unless it is already at or past it. Returns
/// whether it moved.
fn propose_max(value: &AtomicU64, proposed: Position) -> bool {
    let mut current = value.load(Ordering::Acquire);
    loop {
        if proposed.as_raw() <= current {
            return false;
        }
        match value.compare_exchange_weak(
            current,
            proposed.as_raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// State shared by the dispatcher handle, its subscriptions and the conductor.
pub(crate) struct DispatcherInner {
    name: String,
    mode: Mode,
    log_buffer: LogBuffer,
    appender: LogAppender,
    window_length: u32,
    verify_checksums: bool,
    publisher_limit: AtomicU64,
    publisher_position: AtomicU64,
    // replaced as a whole, only by the conductor
    subscriptions: ArcSwap<Vec<Arc<SubscriptionState>>>,
    next_subscription_id: AtomicU32,
    closed: AtomicBool,
}

impl DispatcherInner {
    pub(crate) fn name(&self) -> &str {
        return &self.name;
    }

    pub(crate) fn log_buffer(&self) -> &LogBuffer {
        return &self.log_buffer;
    }

    pub(crate) fn verify_checksums(&self) -> bool {
        return self.verify_checksums;
    }

    pub(crate) fn is_closed(&self) -> bool {
        return self.closed.load(Ordering::Acquire);
    }

    fn publisher_position(&self) -> Position {
        return Position::from_raw(self.publisher_position.load(Ordering::Acquire));
    }

    fn publisher_limit(&self) -> Position {
        return Position::from_raw(self.publisher_limit.load(Ordering::Acquire));
    }

    /// How far `subscription` may read. `None` once it is no longer part of
    /// the topology.
    pub(crate) fn subscriber_limit_for(&self, subscription: &SubscriptionState) -> Option<Position> {
        if subscription.is_closed() {
            return None;
        }
        match self.mode {
            Mode::Broadcast => return Some(self.publisher_position()),
            Mode::Pipeline => {
                let subscriptions = self.subscriptions.load();
                let stage = subscriptions
                    .iter()
                    .position(|s| s.id() == subscription.id())?;
                if stage == 0 {
                    return Some(self.publisher_position());
                }
                return Some(subscriptions[stage - 1].position());
            }
        }
    }

    /// Moves the publisher limit to `window_length` past the slowest
    /// subscription. Returns whether the limit moved.
    pub(crate) fn update_publisher_limit(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let subscriptions = self.subscriptions.load();
        let reference = match self.mode {
            _ if subscriptions.is_empty() => self.publisher_position(),
            Mode::Broadcast => subscriptions
                .iter()
                .map(|s| s.position())
                .min()
                .unwrap_or_else(|| self.publisher_position()),
            // the last stage frees the buffer
            Mode::Pipeline => subscriptions
                .last()
                .map(|s| s.position())
                .unwrap_or_else(|| self.publisher_position()),
        };

        let proposed = reference.advance_window(self.window_length, self.log_buffer.partition_size());
        return propose_max(&self.publisher_limit, proposed);
    }

    /// The active partition, if a producer starting at its current tail would
    /// stay below the publisher limit.
    fn admit(&self) -> Result<(u32, &LogBufferPartition), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let limit = self.publisher_limit();
        let (partition_id, partition) = self.log_buffer.active_partition();
        if partition.partition_id() != partition_id {
            // we read the active id just before a rotation and the partition
            // has been recycled since
            return Err(Error::EndOfPartition);
        }
        let position = Position::new(partition_id, partition.tail_volatile());
        if position >= limit {
            return Err(Error::Backpressure);
        }
        return Ok((partition_id, partition));
    }

    fn on_end_of_partition(&self, partition_id: u32) -> Error {
        self.log_buffer.on_partition_filled(partition_id);
        return Error::EndOfPartition;
    }

    fn on_published(&self, position: Position) -> Position {
        propose_max(&self.publisher_position, position);
        return position;
    }

    pub(crate) fn do_open_subscription(
        inner: &Arc<DispatcherInner>,
        name: &str,
    ) -> Result<Subscription, Error> {
        if inner.is_closed() {
            return Err(Error::Closed);
        }
        if inner.mode == Mode::Pipeline {
            return Err(Error::IllegalTopology {
                reason: format!("cannot open subscription '{}' in pipeline mode", name),
            });
        }
        let state = inner.add_subscription(name)?;
        // brand new, nobody else can hold it
        state.try_take();
        return Ok(Subscription::new(state, inner.clone()));
    }

    fn add_subscription(&self, name: &str) -> Result<Arc<SubscriptionState>, Error> {
        let current = self.subscriptions.load();
        if current.iter().any(|s| s.name() == name) {
            return Err(Error::IllegalTopology {
                reason: format!("subscription with name '{}' already exists", name),
            });
        }

        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let start = Position::new(self.log_buffer.active_partition_id(), 0);
        let state = Arc::new(SubscriptionState::new(id, name, start));

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(state.clone());
        self.subscriptions.store(Arc::new(next));

        info!("{} opened subscription {} ({}) at {}", self.name, name, id, start);
        return Ok(state);
    }

    pub(crate) fn do_close_subscription(&self, id: u32) -> Result<(), Error> {
        if self.is_closed() {
            return Ok(());
        }
        if self.mode == Mode::Pipeline {
            return Err(Error::IllegalTopology {
                reason: "cannot close a subscription in pipeline mode".to_string(),
            });
        }

        let current = self.subscriptions.load();
        let state = match current.iter().find(|s| s.id() == id) {
            Some(state) => state.clone(),
            None => {
                return Err(Error::UnknownSubscription {
                    name: format!("#{}", id),
                })
            }
        };
        let next: Vec<_> = current.iter().filter(|s| s.id() != id).cloned().collect();
        self.subscriptions.store(Arc::new(next));
        state.close();

        info!("{} closed subscription {} ({})", self.name, state.name(), id);
        // the slowest reader may just have left
        self.update_publisher_limit();
        return Ok(());
    }

    pub(crate) fn do_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for subscription in self.subscriptions.load().iter() {
            subscription.close();
        }
        self.log_buffer.release();
        info!("{} closed", self.name);
    }
}

/// A many-producer, many-consumer message hub over a shared memory ring.
///
/// Producers call [`Dispatcher::offer`] or [`Dispatcher::claim`] from any
/// thread. Consumers each own a [`Subscription`] and poll it from one thread.
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
    conductor: Conductor,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("mode", &self.inner.mode)
            .field("publisher_position", &self.inner.publisher_position())
            .field("publisher_limit", &self.inner.publisher_limit())
            .field("log_buffer", &self.inner.log_buffer)
            .finish()
    }
}

impl fmt::Display for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dispatcher [{}]", self.inner.name)
    }
}

impl Dispatcher {
    pub fn builder(name: &str) -> DispatcherBuilder {
        return DispatcherBuilder::new(name);
    }

    pub fn new(config: DispatcherConfig) -> Result<Dispatcher, Error> {
        config.validate()?;

        let log_buffer = LogBuffer::new(&config.name, config.partition_count, config.partition_size)?;
        let window_length = config.effective_window_length();
        let inner = Arc::new(DispatcherInner {
            name: config.name.clone(),
            mode: config.mode,
            log_buffer: log_buffer,
            appender: LogAppender::new(config.max_frame_length() as usize),
            window_length: window_length,
            verify_checksums: config.verify_checksums,
            publisher_limit: AtomicU64::new(Position::new(0, window_length).as_raw()),
            publisher_position: AtomicU64::new(Position::ZERO.as_raw()),
            subscriptions: ArcSwap::from_pointee(vec![]),
            next_subscription_id: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });

        // nothing else sees the topology yet
        for name in &config.subscription_names {
            inner.add_subscription(name)?;
        }

        let conductor = Conductor::start(inner.clone(), config.conductor_idle)?;
        info!(
            "Created {} in {:?} mode, window {}, max frame length {}",
            config.name,
            config.mode,
            window_length,
            config.max_frame_length()
        );
        return Ok(Dispatcher { inner, conductor });
    }

    pub fn name(&self) -> &str {
        return &self.inner.name;
    }

    pub fn mode(&self) -> Mode {
        return self.inner.mode;
    }

    pub fn max_frame_length(&self) -> usize {
        return self.inner.appender.max_frame_length();
    }

    pub fn log_buffer(&self) -> &LogBuffer {
        return &self.inner.log_buffer;
    }

    /// Writes `payload` on stream 0, see [`Dispatcher::offer_with_stream`].
    pub fn offer(&self, payload: &[u8]) -> Result<Position, Error> {
        return self.offer_with_stream(payload, 0);
    }

    /// Copies `payload` into the log as one committed fragment and returns
    /// the position right after it.
    ///
    /// `Backpressure` and `EndOfPartition` are expected under load, retry
    /// them (see [`Error::is_retryable`]).
    pub fn offer_with_stream(&self, payload: &[u8], stream_id: u32) -> Result<Position, Error> {
        let inner: &DispatcherInner = &self.inner;
        let (partition_id, partition) = inner.admit()?;
        match inner.appender.append_frame(partition, payload, stream_id)? {
            Appended::Ok(end) => return Ok(inner.on_published(Position::new(partition_id, end))),
            Appended::EndOfPartition => return Err(inner.on_end_of_partition(partition_id)),
        }
    }

    pub fn claim(&self, length: usize) -> Result<ClaimedFragment<'_>, Error> {
        return self.claim_with_stream(length, 0);
    }

    /// Reserves room for a `length` byte fragment. Write it through
    /// [`ClaimedFragment::buffer`], then commit or abort it.
    pub fn claim_with_stream(
        &self,
        length: usize,
        stream_id: u32,
    ) -> Result<ClaimedFragment<'_>, Error> {
        let inner: &DispatcherInner = &self.inner;
        let (partition_id, partition) = inner.admit()?;
        match inner.appender.claim(partition, partition_id, length, stream_id)? {
            Appended::Ok(fragment) => {
                inner.on_published(fragment.position());
                return Ok(fragment);
            }
            Appended::EndOfPartition => return Err(inner.on_end_of_partition(partition_id)),
        }
    }

    /// Reserves room for up to `fragment_count` fragments carrying
    /// `batch_length` payload bytes in total. Readers see all of them or
    /// none.
    pub fn claim_batch(
        &self,
        fragment_count: usize,
        batch_length: usize,
    ) -> Result<ClaimedFragmentBatch<'_>, Error> {
        let inner: &DispatcherInner = &self.inner;
        let (partition_id, partition) = inner.admit()?;
        match inner
            .appender
            .claim_batch(partition, partition_id, fragment_count, batch_length)?
        {
            Appended::Ok(batch) => {
                inner.on_published(batch.position());
                return Ok(batch);
            }
            Appended::EndOfPartition => return Err(inner.on_end_of_partition(partition_id)),
        }
    }

    /// How far `subscription` may currently read, `None` if it is closed.
    pub fn subscriber_limit(&self, subscription: &Subscription) -> Option<Position> {
        return self.inner.subscriber_limit_for(subscription.state());
    }

    pub fn update_publisher_limit(&self) -> bool {
        return self.inner.update_publisher_limit();
    }

    /// The furthest position producers may currently write to.
    pub fn publisher_limit(&self) -> Position {
        return self.inner.publisher_limit();
    }

    /// The end of the furthest fragment published so far, `None` once
    /// closed.
    pub fn publisher_position(&self) -> Option<Position> {
        if self.inner.is_closed() {
            return None;
        }
        return Some(self.inner.publisher_position());
    }

    pub fn open_subscription(&self, name: &str) -> Result<Subscription, Error> {
        return self.open_subscription_async(name).join();
    }

    /// Opens a broadcast subscription starting at the beginning of the active
    /// partition. Not allowed in pipeline mode.
    pub fn open_subscription_async(&self, name: &str) -> Completion<Subscription> {
        if self.inner.mode == Mode::Pipeline {
            return Completion::ready(Err(Error::IllegalTopology {
                reason: format!("cannot open subscription '{}' in pipeline mode", name),
            }));
        }
        let name = name.to_string();
        return self
            .conductor
            .submit(|reply| Command::OpenSubscription { name, reply });
    }

    pub fn close_subscription(&self, subscription: &Subscription) -> Result<(), Error> {
        return self.close_subscription_async(subscription).join();
    }

    pub fn close_subscription_async(&self, subscription: &Subscription) -> Completion<()> {
        let id = subscription.id();
        return self
            .conductor
            .submit(|reply| Command::CloseSubscription { id, reply });
    }

    /// The handle on one of the dispatcher's subscriptions, e.g. a pipeline
    /// stage. There is at most one live handle per subscription; it becomes
    /// available again once the previous one is dropped.
    pub fn subscription_by_name(&self, name: &str) -> Result<Subscription, Error> {
        let subscriptions = self.inner.subscriptions.load();
        match subscriptions.iter().find(|s| s.name() == name) {
            Some(state) => {
                if !state.try_take() {
                    return Err(Error::IllegalTopology {
                        reason: format!("subscription '{}' is already held by a consumer", name),
                    });
                }
                return Ok(Subscription::new(state.clone(), self.inner.clone()));
            }
            None => {
                return Err(Error::UnknownSubscription {
                    name: name.to_string(),
                })
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        return self.inner.subscriptions.load().len();
    }

    pub fn is_closed(&self) -> bool {
        return self.inner.is_closed();
    }

    /// Stops accepting offers, closes every subscription and releases the log
    /// buffer. Claims still outstanding may be completed, nobody reads them.
    pub fn close(&self) -> Result<(), Error> {
        return self.close_async().join();
    }

    pub fn close_async(&self) -> Completion<()> {
        if self.inner.is_closed() {
            return Completion::ready(Ok(()));
        }
        return self.conductor.submit(|reply| Command::Close { reply });
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if !self.inner.is_closed() {
            if let Err(err) = self.close() {
                warn!("{} did not close cleanly: {}", self.inner.name, err);
                self.inner.do_close();
            }
        }
        self.conductor.shutdown();
        debug!("Dropped {}", self.inner.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{Fragment, FragmentResult};
    use std::time::Duration;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn builder(name: &str) -> DispatcherBuilder {
        // keep the conductor out of the way, tests drive the limit themselves
        return Dispatcher::builder(name)
            .partition_size(1024)
            .window_length(256)
            .conductor_idle(Duration::from_secs(60));
    }

    fn drain(subscription: &mut Subscription) -> usize {
        let mut total = 0;
        loop {
            let read = subscription.poll(&mut |_: &Fragment<'_>| FragmentResult::Consume, 64);
            if read == 0 {
                return total;
            }
            total += read;
        }
    }

    /// Offers until it goes through, moving the buffer along on partition
    /// ends.
    fn offer_retrying(dispatcher: &Dispatcher, payload: &[u8]) -> Result<Position, Error> {
        loop {
            match dispatcher.offer(payload) {
                Err(Error::EndOfPartition) => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn single_subscription_catches_up() {
        init();
        let dispatcher = builder("catch-up").subscriptions(["sub"]).build().expect("Should build");
        let mut sub = dispatcher.subscription_by_name("sub").expect("Should exist");

        let mut positions = vec![];
        for _ in 0..20 {
            let position = loop {
                match offer_retrying(&dispatcher, &[9; 64]) {
                    Ok(position) => break position,
                    Err(Error::Backpressure) => {
                        drain(&mut sub);
                    }
                    Err(err) => panic!("Unexpected {}", err),
                }
            };
            positions.push(position);
        }
        drain(&mut sub);

        assert_eq!(positions.len(), 20);
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(Some(sub.position()), dispatcher.publisher_position());
        assert_eq!(dispatcher.publisher_position(), positions.last().copied());
    }

    #[test]
    fn stalled_subscription_applies_backpressure() {
        init();
        let dispatcher = builder("stalled")
            .subscriptions(["fast", "stalled"])
            .build()
            .expect("Should build");
        let mut fast = dispatcher.subscription_by_name("fast").expect("Should exist");
        let stalled = dispatcher.subscription_by_name("stalled").expect("Should exist");

        let mut rejected = false;
        for _ in 0..64 {
            match offer_retrying(&dispatcher, &[1; 32]) {
                Ok(_) => {
                    drain(&mut fast);
                }
                Err(Error::Backpressure) => {
                    rejected = true;
                    break;
                }
                Err(err) => panic!("Unexpected {}", err),
            }
        }
        assert!(rejected);
        assert_eq!(fast.position(), dispatcher.publisher_position().expect("Open"));
        assert!(dispatcher.publisher_position().expect("Open") > stalled.position());

        // still stuck, the stalled one has not moved
        dispatcher.update_publisher_limit();
        assert!(matches!(dispatcher.offer(&[1; 32]), Err(Error::Backpressure)));
    }

    #[test]
    fn backpressure_lifts_when_subscription_advances() {
        init();
        let dispatcher = builder("lift").subscriptions(["sub"]).build().expect("Should build");
        let mut sub = dispatcher.subscription_by_name("sub").expect("Should exist");

        while offer_retrying(&dispatcher, &[3; 48]).is_ok() {}
        assert!(matches!(dispatcher.offer(&[3; 48]), Err(Error::Backpressure)));

        assert!(drain(&mut sub) > 0);
        assert!(offer_retrying(&dispatcher, &[3; 48]).is_ok());
    }

    #[test]
    fn aborted_claim_is_skipped() {
        init();
        let dispatcher = builder("abort").subscriptions(["sub"]).build().expect("Should build");
        let mut sub = dispatcher.subscription_by_name("sub").expect("Should exist");

        let mut claim = dispatcher.claim(60).expect("Should claim");
        claim.buffer().fill(0xAB);
        let claimed_position = claim.position();
        claim.abort();

        let offered = dispatcher.offer(b"after").expect("Should offer");
        assert!(offered > claimed_position);

        let mut seen = vec![];
        sub.poll(
            &mut |fragment: &Fragment<'_>| {
                seen.push(fragment.payload().to_vec());
                FragmentResult::Consume
            },
            10,
        );
        assert_eq!(seen, vec![b"after".to_vec()]);
        assert_eq!(sub.position(), offered);
    }

    #[test]
    fn frame_too_large_changes_nothing() {
        init();
        let dispatcher = builder("too-large").build().expect("Should build");
        assert_eq!(dispatcher.max_frame_length(), 64);

        let tail = dispatcher.log_buffer().active_partition().1.tail_volatile();
        assert!(matches!(
            dispatcher.claim(65),
            Err(Error::FrameTooLarge { length: 65, max: 64 })
        ));
        assert!(matches!(
            dispatcher.offer(&[0; 65]),
            Err(Error::FrameTooLarge { .. })
        ));
        assert_eq!(dispatcher.log_buffer().active_partition().1.tail_volatile(), tail);
        assert_eq!(dispatcher.publisher_position(), Some(Position::ZERO));
    }

    #[test]
    fn oversized_batch_changes_nothing() {
        init();
        let dispatcher = builder("batch-too-large").build().expect("Should build");

        // 64 payload bytes in 28 fragments reserve 960 bytes, not 64
        assert!(matches!(
            dispatcher.claim_batch(28, 64),
            Err(Error::FrameTooLarge { length: 960, max: 80 })
        ));
        assert!(matches!(
            dispatcher.claim_batch(usize::MAX, 1),
            Err(Error::FrameTooLarge { .. })
        ));
        assert_eq!(dispatcher.log_buffer().active_partition_id(), 0);
        assert_eq!(dispatcher.log_buffer().active_partition().1.tail_volatile(), 0);
        assert_eq!(dispatcher.publisher_position(), Some(Position::ZERO));
    }

    #[test]
    fn lagging_subscription_survives_rotation() {
        init();
        let dispatcher = builder("lagging").subscriptions(["sub"]).build().expect("Should build");
        let mut sub = dispatcher.subscription_by_name("sub").expect("Should exist");

        // 64 byte frames, stop with the subscription caught up at 0:960
        for _ in 0..15 {
            loop {
                match offer_retrying(&dispatcher, &[1; 48]) {
                    Ok(_) => break,
                    Err(Error::Backpressure) => {
                        drain(&mut sub);
                    }
                    Err(err) => panic!("Unexpected {}", err),
                }
            }
        }
        drain(&mut sub);
        assert_eq!(sub.position(), Position::new(0, 960));
        assert_eq!(dispatcher.publisher_limit(), Position::new(1, 256));

        // one frame left unread in partition 0, three more after the rotation
        let mut unread = vec![];
        for i in 0..4u8 {
            unread.push(offer_retrying(&dispatcher, &[i; 48]).expect("Should be below the limit"));
        }
        assert_eq!(unread[0], Position::new(0, 1024));
        assert_eq!(dispatcher.log_buffer().active_partition_id(), 1);
        let tail = dispatcher.log_buffer().active_partition().1.tail_volatile();
        assert_eq!(tail, 192);

        // would run off the end of partition 1 and rotate again
        assert!(matches!(
            dispatcher.claim_batch(28, 64),
            Err(Error::FrameTooLarge { .. })
        ));
        assert_eq!(dispatcher.log_buffer().active_partition_id(), 1);
        assert_eq!(dispatcher.log_buffer().active_partition().1.tail_volatile(), tail);

        // partition 0 still holds the unread frame and is not up for cleaning
        assert_eq!(dispatcher.log_buffer().clean_partitions(), 0);
        assert_eq!(dispatcher.log_buffer().partition(0).partition_id(), 0);

        let mut delivered = vec![];
        loop {
            let read = sub.poll(
                &mut |fragment: &Fragment<'_>| {
                    delivered.push((fragment.position(), fragment.payload()[0]));
                    FragmentResult::Consume
                },
                64,
            );
            if read == 0 {
                break;
            }
        }
        assert_eq!(
            delivered,
            unread.iter().copied().zip(0..4u8).collect::<Vec<_>>()
        );
        assert_eq!(Some(sub.position()), dispatcher.publisher_position());
        assert!(dispatcher.offer(&[9; 48]).is_ok());
    }

    #[test]
    fn pipeline_stages_read_in_order() {
        init();
        let dispatcher = builder("pipeline")
            .mode(Mode::Pipeline)
            .subscriptions(["a", "b", "c"])
            .build()
            .expect("Should build");
        let mut a = dispatcher.subscription_by_name("a").expect("Should exist");
        let mut b = dispatcher.subscription_by_name("b").expect("Should exist");
        let mut c = dispatcher.subscription_by_name("c").expect("Should exist");

        for i in 0..5u8 {
            dispatcher.offer(&[i; 8]).expect("Should offer");
        }

        let consume = |_: &Fragment<'_>| FragmentResult::Consume;
        assert_eq!(c.poll(&mut consume.clone(), 10), 0);
        assert_eq!(a.poll(&mut consume.clone(), 3), 3);
        assert_eq!(b.poll(&mut consume.clone(), 10), 3);
        assert_eq!(b.poll(&mut consume.clone(), 10), 0);
        assert_eq!(dispatcher.subscriber_limit(&b), Some(a.position()));
        assert_eq!(c.poll(&mut consume.clone(), 10), 3);

        assert_eq!(a.poll(&mut consume.clone(), 10), 2);
        assert_eq!(b.poll(&mut consume.clone(), 10), 2);
        assert_eq!(c.poll(&mut consume.clone(), 10), 2);
        assert_eq!(Some(c.position()), dispatcher.publisher_position());
        assert_eq!(dispatcher.subscriber_limit(&a), dispatcher.publisher_position());
    }

    #[test]
    fn pipeline_topology_is_fixed() {
        init();
        let dispatcher = builder("fixed")
            .mode(Mode::Pipeline)
            .subscriptions(["a", "b"])
            .build()
            .expect("Should build");
        assert!(matches!(
            dispatcher.open_subscription("c"),
            Err(Error::IllegalTopology { .. })
        ));
        let a = dispatcher.subscription_by_name("a").expect("Should exist");
        assert!(matches!(
            dispatcher.close_subscription(&a),
            Err(Error::IllegalTopology { .. })
        ));
        assert_eq!(dispatcher.subscriber_count(), 2);
    }

    #[test]
    fn pipeline_limit_follows_last_stage() {
        init();
        let dispatcher = builder("last-stage")
            .mode(Mode::Pipeline)
            .subscriptions(["a", "b"])
            .build()
            .expect("Should build");
        let mut a = dispatcher.subscription_by_name("a").expect("Should exist");

        while offer_retrying(&dispatcher, &[5; 32]).is_ok() {
            a.poll(&mut |_: &Fragment<'_>| FragmentResult::Consume, 64);
        }
        // the first stage keeping up does not help, the last one holds the buffer
        assert!(matches!(dispatcher.offer(&[5; 32]), Err(Error::Backpressure)));
        assert_eq!(Some(a.position()), dispatcher.publisher_position());
    }

    #[test]
    fn subscription_names_are_unique() {
        init();
        let dispatcher = builder("unique").build().expect("Should build");
        let first = dispatcher.open_subscription("sub").expect("Should open");
        assert_eq!(first.name(), "sub");
        assert!(matches!(
            dispatcher.open_subscription("sub"),
            Err(Error::IllegalTopology { .. })
        ));
        let second = dispatcher.open_subscription("other").expect("Should open");
        assert_ne!(first.id(), second.id());
        assert_eq!(dispatcher.subscriber_count(), 2);

        dispatcher.close_subscription(&first).expect("Should close");
        assert_eq!(dispatcher.subscriber_count(), 1);
        assert!(matches!(
            dispatcher.close_subscription(&first),
            Err(Error::UnknownSubscription { .. })
        ));
        assert!(matches!(
            dispatcher.subscription_by_name("sub"),
            Err(Error::UnknownSubscription { .. })
        ));
        // still held by `second`
        assert!(matches!(
            dispatcher.subscription_by_name("other"),
            Err(Error::IllegalTopology { .. })
        ));
        drop(second);
        assert!(dispatcher.subscription_by_name("other").is_ok());
    }

    #[test]
    fn one_handle_per_subscription() {
        init();
        let dispatcher = builder("handoff")
            .mode(Mode::Pipeline)
            .subscriptions(["a", "b"])
            .build()
            .expect("Should build");
        let mut first = dispatcher.subscription_by_name("a").expect("Should exist");
        assert!(matches!(
            dispatcher.subscription_by_name("a"),
            Err(Error::IllegalTopology { .. })
        ));

        dispatcher.offer(b"one").expect("Should offer");
        assert_eq!(first.poll(&mut |_: &Fragment<'_>| FragmentResult::Consume, 10), 1);
        let position = first.position();
        drop(first);

        // handed over to a new consumer, the cursor stays where it was
        let second = dispatcher.subscription_by_name("a").expect("Should be free again");
        assert_eq!(second.position(), position);
        assert!(dispatcher.subscription_by_name("b").is_ok());
    }

    #[test]
    fn new_subscription_starts_at_active_partition() {
        init();
        let dispatcher = builder("late-join").build().expect("Should build");
        // nobody listening, the buffer runs free
        for _ in 0..100 {
            offer_retrying(&dispatcher, &[7; 48]).expect("Should not be held back");
            dispatcher.update_publisher_limit();
        }
        let active = dispatcher.log_buffer().active_partition_id();
        assert!(active > 0);

        let mut sub = dispatcher.open_subscription("late").expect("Should open");
        assert_eq!(sub.position(), Position::new(active, 0));
        drain(&mut sub);
        assert_eq!(Some(sub.position()), dispatcher.publisher_position());
    }

    #[test]
    fn async_open_and_close() {
        init();
        let dispatcher = builder("async").build().expect("Should build");
        let sub = futures::executor::block_on(dispatcher.open_subscription_async("sub"))
            .expect("Should open");
        futures::executor::block_on(dispatcher.close_subscription_async(&sub))
            .expect("Should close");
        assert!(sub.is_closed());
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        init();
        let dispatcher = builder("close").subscriptions(["sub"]).build().expect("Should build");
        let mut sub = dispatcher.subscription_by_name("sub").expect("Should exist");
        dispatcher.offer(b"before").expect("Should offer");

        dispatcher.close().expect("Should close");
        dispatcher.close().expect("Should close again");
        assert!(dispatcher.is_closed());
        assert!(dispatcher.log_buffer().is_released());
        assert_eq!(dispatcher.publisher_position(), None);
        assert!(sub.is_closed());
        assert_eq!(drain(&mut sub), 0);

        assert!(matches!(dispatcher.offer(b"after"), Err(Error::Closed)));
        assert!(matches!(dispatcher.claim(8), Err(Error::Closed)));
        assert!(matches!(dispatcher.claim_batch(1, 8), Err(Error::Closed)));
        assert!(matches!(dispatcher.open_subscription("new"), Err(Error::Closed)));
        // administrative no-op
        dispatcher.close_subscription(&sub).expect("Should be a no-op");
    }

    #[test]
    fn outstanding_claim_survives_close() {
        init();
        let dispatcher = builder("claim-close").subscriptions(["sub"]).build().expect("Should build");
        let mut claim = dispatcher.claim(16).expect("Should claim");
        dispatcher.close().expect("Should close");
        claim.buffer().fill(1);
        claim.commit();
    }

    #[test]
    fn conductor_moves_the_limit() {
        init();
        let dispatcher = Dispatcher::builder("duty-cycle")
            .partition_size(1024)
            .window_length(256)
            .subscriptions(["sub"])
            .conductor_idle(Duration::from_millis(1))
            .build()
            .expect("Should build");
        let mut sub = dispatcher.subscription_by_name("sub").expect("Should exist");
        let initial = dispatcher.publisher_limit();

        // move the subscription without going through poll, only the
        // conductor can notice
        sub.set_position_on_open(Position::new(0, 512));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while dispatcher.publisher_limit() == initial && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(dispatcher.publisher_limit(), Position::new(0, 768));
    }

    #[test]
    fn concurrent_producers_and_consumer() {
        init();
        let dispatcher = Arc::new(
            Dispatcher::builder("concurrent")
                .partition_size(4096)
                .subscriptions(["sub"])
                .build()
                .expect("Should build"),
        );
        let mut sub = dispatcher.subscription_by_name("sub").expect("Should exist");
        let producers = 4;
        let per_producer = 500u32;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let dispatcher = dispatcher.clone();
                std::thread::spawn(move || {
                    let mut last = Position::ZERO;
                    for i in 0..per_producer {
                        let mut payload = [0u8; 8];
                        payload[..4].copy_from_slice(&(p as u32).to_le_bytes());
                        payload[4..].copy_from_slice(&i.to_le_bytes());
                        loop {
                            match dispatcher.offer_with_stream(&payload, p as u32) {
                                Ok(position) => {
                                    assert!(position > last);
                                    last = position;
                                    break;
                                }
                                Err(err) if err.is_retryable() => std::thread::yield_now(),
                                Err(err) => panic!("Unexpected {}", err),
                            }
                        }
                    }
                })
            })
            .collect();

        let mut next = vec![0u32; producers];
        let mut received = 0;
        let expected = producers * per_producer as usize;
        while received < expected {
            received += sub.poll(
                &mut |fragment: &Fragment<'_>| {
                    let payload = fragment.payload();
                    let p = u32::from_le_bytes(payload[..4].try_into().expect("4 bytes")) as usize;
                    let i = u32::from_le_bytes(payload[4..].try_into().expect("4 bytes"));
                    // per producer order is kept
                    assert_eq!(i, next[p]);
                    assert_eq!(fragment.stream_id(), p as u32);
                    next[p] += 1;
                    FragmentResult::Consume
                },
                64,
            );
        }
        for handle in handles {
            handle.join().expect("Should join");
        }
        assert!(next.iter().all(|n| *n == per_producer));
        assert!(dispatcher.log_buffer().active_partition_id() > 0);
    }

    #[test]
    fn display() {
        init();
        let dispatcher = builder("shown").build().expect("Should build");
        assert_eq!(dispatcher.to_string(), "Dispatcher [shown]");
    }
}
