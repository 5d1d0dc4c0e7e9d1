/*
 * The conductor is the one thread allowed to change a dispatcher's topology.
 * Subscription changes and close arrive as commands on a channel and are
 * applied in order; between commands it keeps the publisher limit fresh and
 * recycles partitions the producers have left behind.
*/
use crate::dispatcher::DispatcherInner;
use crate::error::Error;
use crate::subscription::Subscription;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use futures::channel::oneshot;
use log::{debug, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, Error>>;

pub(crate) enum Command {
    OpenSubscription { name: String, reply: Reply<Subscription> },
    CloseSubscription { id: u32, reply: Reply<()> },
    Close { reply: Reply<()> },
    Shutdown,
}

/// The outcome of an administrative operation handed to the conductor.
/// Await it, or block on it with [`Completion::join`].
#[must_use = "the operation may not have happened yet"]
#[derive(Debug)]
pub struct Completion<T> {
    receiver: oneshot::Receiver<Result<T, Error>>,
}

impl<T> Completion<T> {
    fn new(receiver: oneshot::Receiver<Result<T, Error>>) -> Completion<T> {
        return Completion { receiver: receiver };
    }

    /// An operation that finished before it was queued.
    pub(crate) fn ready(result: Result<T, Error>) -> Completion<T> {
        let (sender, receiver) = oneshot::channel();
        // the receiver is right here, this cannot fail
        let _ = sender.send(result);
        return Completion::new(receiver);
    }

    /// Blocks the calling thread until the conductor is done.
    pub fn join(self) -> Result<T, Error> {
        return futures::executor::block_on(self);
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().receiver).poll(cx) {
            Poll::Ready(Ok(result)) => return Poll::Ready(result),
            // reply sender dropped, the conductor died with our command queued
            Poll::Ready(Err(oneshot::Canceled)) => return Poll::Ready(Err(Error::ConductorStopped)),
            Poll::Pending => return Poll::Pending,
        }
    }
}

pub(crate) struct Conductor {
    commands: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl Conductor {
    pub(crate) fn start(inner: Arc<DispatcherInner>, idle: Duration) -> Result<Conductor, Error> {
        let (commands, receiver) = unbounded();
        let handle = thread::Builder::new()
            .name(format!("{}-conductor", inner.name()))
            .spawn(move || Conductor::run(inner, receiver, idle))?;
        return Ok(Conductor {
            commands: commands,
            handle: Some(handle),
        });
    }

    /// Queues the command built by `command` and returns its completion.
    pub(crate) fn submit<T, F>(&self, command: F) -> Completion<T>
    where
        F: FnOnce(Reply<T>) -> Command,
    {
        let (reply, receiver) = oneshot::channel();
        if self.commands.send(command(reply)).is_err() {
            // the command, and its reply sender, came back to us and is gone
            return Completion::ready(Err(Error::ConductorStopped));
        }
        return Completion::new(receiver);
    }

    pub(crate) fn shutdown(&mut self) {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return,
        };
        let _ = self.commands.send(Command::Shutdown);
        if handle.join().is_err() {
            warn!("Conductor thread panicked");
        }
    }

    fn run(inner: Arc<DispatcherInner>, commands: Receiver<Command>, idle: Duration) {
        info!("Conductor for {} started", inner.name());
        loop {
            match commands.recv_timeout(idle) {
                Ok(Command::OpenSubscription { name, reply }) => {
                    let _ = reply.send(DispatcherInner::do_open_subscription(&inner, &name));
                }
                Ok(Command::CloseSubscription { id, reply }) => {
                    let _ = reply.send(inner.do_close_subscription(id));
                }
                Ok(Command::Close { reply }) => {
                    inner.do_close();
                    let _ = reply.send(Ok(()));
                }
                Ok(Command::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {
                    Conductor::duty_cycle(&inner);
                }
                // every sender is gone, nobody can reach us anymore
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("Conductor for {} stopped", inner.name());
    }

    fn duty_cycle(inner: &DispatcherInner) -> usize {
        if inner.is_closed() {
            return 0;
        }
        let mut work_count = 0;
        if inner.update_publisher_limit() {
            work_count += 1;
        }
        let cleaned = inner.log_buffer().clean_partitions();
        if cleaned > 0 {
            debug!("{} cleaned {} partitions", inner.name(), cleaned);
        }
        return work_count + cleaned;
    }
}

impl Drop for Conductor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
