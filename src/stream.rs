//! Response streaming core.
//!
//! [`channel`] builds the two halves of one invocation's stream: the
//! producer-side [`Emitter`] and the consumer-side [`Response`]. Values
//! cross a rendezvous: `emit` returns only after `next` has taken the
//! value, so a slow consumer stalls the producer and at most one value is
//! in flight.
//!
//! State transitions on the producer side (`emit`, `close`,
//! `close_with_error`, `set_length`) are serialised by a single mutex.
//! The consumer never takes that mutex: it reads the terminal outcome and
//! the frozen length from write-once cells, which are populated before the
//! signals that make them observable.

use std::fmt;
use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::{Arc, OnceLock};

use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::CmdError;
use crate::{AppError, Result};

/// Outcome of one [`Response::next`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Received<V> {
    /// The next emitted value.
    Value(V),
    /// The producer closed the stream successfully.
    EndOfStream,
    /// The producer closed with an error, or the invocation was cancelled.
    Error(AppError),
}

impl<V> Received<V> {
    /// Fold into a `Result`, mapping end of stream to `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns the terminal or cancellation error carried by
    /// [`Received::Error`].
    pub fn into_result(self) -> Result<Option<V>> {
        match self {
            Self::Value(v) => Ok(Some(v)),
            Self::EndOfStream => Ok(None),
            Self::Error(err) => Err(err),
        }
    }

    /// Whether this is [`Received::EndOfStream`].
    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

/// How the stream ended.
#[derive(Debug, Clone)]
enum Terminal {
    Completed,
    Failed(AppError),
}

/// A value on its way to the consumer.
enum Emitted<V> {
    Value(V),
    /// The only value of this stream; the producer closes right after.
    Single(V),
}

impl<V> Emitted<V> {
    fn into_inner(self) -> V {
        match self {
            Self::Value(v) | Self::Single(v) => v,
        }
    }
}

/// One hand-off: the value plus the acknowledgement the consumer fires
/// when it accepts it.
type Handoff<V> = (Emitted<V>, oneshot::Sender<()>);

/// Producer state guarded by [`Shared::producer`].
struct Producer<V> {
    sender: Option<mpsc::Sender<Handoff<V>>>,
    closed: bool,
    declared_length: u64,
}

struct Shared<V> {
    producer: Mutex<Producer<V>>,
    /// Fired once, on the first emit or close.
    activity: watch::Sender<bool>,
    /// Length frozen at first activity.
    length: OnceLock<u64>,
    /// Written once when the stream closes; set before the channel closes.
    terminal: OnceLock<Terminal>,
    cancel: CancellationToken,
}

impl<V> Shared<V> {
    /// Freeze the declared length and release `length()` waiters.
    fn mark_active(&self, producer: &Producer<V>) {
        if self.length.set(producer.declared_length).is_ok() {
            self.activity.send_replace(true);
        }
    }

    /// Transition to closed. Caller holds the producer lock and has
    /// checked `closed` is false.
    fn finish(&self, producer: &mut Producer<V>, terminal: Terminal) {
        producer.closed = true;
        // Record the outcome before the channel closes so a consumer that
        // observes the closed channel always finds it.
        let _ = self.terminal.set(terminal);
        producer.sender = None;
        self.mark_active(producer);
    }

    fn terminal_received<T>(&self) -> Received<T> {
        match self.terminal.get() {
            Some(Terminal::Failed(err)) => Received::Error(err.clone()),
            Some(Terminal::Completed) | None => Received::EndOfStream,
        }
    }
}

fn cancelled() -> AppError {
    AppError::Cancelled("context canceled".into())
}

/// Create the paired producer and consumer handles of one invocation.
///
/// `cancel` is the invocation's cancellation context; every blocking
/// operation on either half races it.
#[must_use]
pub fn channel<V>(cancel: CancellationToken) -> (Emitter<V>, Response<V>) {
    let (sender, receiver) = mpsc::channel(1);
    let (activity, _) = watch::channel(false);
    let shared = Arc::new(Shared {
        producer: Mutex::new(Producer {
            sender: Some(sender),
            closed: false,
            declared_length: 0,
        }),
        activity,
        length: OnceLock::new(),
        terminal: OnceLock::new(),
        cancel,
    });

    let emitter = Emitter {
        inner: Arc::new(EmitterInner {
            shared: Arc::clone(&shared),
        }),
    };
    let response = Response { receiver, shared };
    (emitter, response)
}

struct EmitterInner<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Drop for EmitterInner<V> {
    fn drop(&mut self) {
        // Every producer handle is gone, so nobody else can hold the lock.
        if let Ok(mut producer) = self.shared.producer.try_lock() {
            if !producer.closed {
                debug!("emitter dropped without close; ending stream");
                self.shared.finish(&mut producer, Terminal::Completed);
            }
        }
    }
}

/// Producer half of a stream.
///
/// Clones share the same stream; dropping the last clone without closing
/// ends the stream successfully, the same as returning from a handler.
pub struct Emitter<V> {
    inner: Arc<EmitterInner<V>>,
}

impl<V> Clone for Emitter<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for Emitter<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("length", &self.inner.shared.length.get())
            .field("closed", &self.inner.shared.terminal.get().is_some())
            .finish_non_exhaustive()
    }
}

impl<V: Send> Emitter<V> {
    fn shared(&self) -> &Shared<V> {
        &self.inner.shared
    }

    /// Deliver one value, waiting until the consumer takes it.
    ///
    /// # Errors
    ///
    /// - `AppError::ClosedEmitter` if the stream is already closed.
    /// - `AppError::Cancelled` if the invocation is cancelled or the
    ///   consumer goes away before the value is taken; the value is not
    ///   delivered in that case.
    pub async fn emit(&self, value: V) -> Result<()> {
        self.send(Emitted::Value(value)).await
    }

    /// Deliver `value` as the only value of the stream, then close it
    /// successfully.
    ///
    /// # Errors
    ///
    /// Same as [`Emitter::emit`].
    pub async fn emit_once(&self, value: V) -> Result<()> {
        self.send(Emitted::Single(value)).await
    }

    /// Forward every value of `source` as an individual emit. Returns when
    /// the source ends or the invocation is cancelled.
    ///
    /// # Errors
    ///
    /// Propagates the first failing emit, or `AppError::Cancelled`.
    pub async fn emit_stream<S>(&self, source: S) -> Result<()>
    where
        S: Stream<Item = V> + Send,
    {
        let mut source = pin!(source);
        let cancel = self.shared().cancel.clone();
        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled()),
                item = source.next() => item,
            };
            match item {
                Some(value) => self.emit(value).await?,
                None => return Ok(()),
            }
        }
    }

    /// Drain a channel, forwarding each value as an individual emit.
    ///
    /// # Errors
    ///
    /// Same as [`Emitter::emit_stream`].
    pub async fn emit_chan(&self, mut receiver: mpsc::Receiver<V>) -> Result<()> {
        self.emit_stream(futures_util::stream::poll_fn(move |cx| {
            receiver.poll_recv(cx)
        }))
        .await
    }

    /// Declare the number of items or bytes this stream will carry.
    /// Ignored once the first value was emitted or the stream closed.
    pub async fn set_length(&self, length: u64) {
        let mut producer = self.shared().producer.lock().await;
        if self.shared().length.get().is_none() {
            producer.declared_length = length;
        }
    }

    /// Close the stream successfully.
    ///
    /// # Errors
    ///
    /// Returns `AppError::DoubleClose` if the stream was already closed;
    /// the recorded outcome is left untouched.
    pub async fn close(&self) -> Result<()> {
        self.close_with(Terminal::Completed).await
    }

    /// Close the stream with a terminal error the consumer receives after
    /// every value emitted so far.
    ///
    /// # Errors
    ///
    /// Returns `AppError::DoubleClose` if the stream was already closed;
    /// the recorded outcome is left untouched.
    pub async fn close_with_error(&self, err: impl Into<AppError>) -> Result<()> {
        self.close_with(Terminal::Failed(err.into())).await
    }

    /// Whether the stream has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared().terminal.get().is_some()
    }

    /// Cancellation context of the invocation.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.shared().cancel
    }

    async fn close_with(&self, terminal: Terminal) -> Result<()> {
        let shared = self.shared();
        let mut producer = shared.producer.lock().await;
        if producer.closed {
            return Err(AppError::DoubleClose);
        }
        shared.finish(&mut producer, terminal);
        Ok(())
    }

    async fn send(&self, item: Emitted<V>) -> Result<()> {
        let shared = self.shared();
        let mut producer = shared.producer.lock().await;
        shared.mark_active(&producer);

        if producer.closed {
            return Err(AppError::ClosedEmitter);
        }
        let Some(sender) = producer.sender.as_ref() else {
            return Err(AppError::ClosedEmitter);
        };

        let single = matches!(item, Emitted::Single(_));
        let (ack, mut accepted) = oneshot::channel();

        tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return Err(cancelled()),
            sent = sender.send((item, ack)) => {
                if sent.is_err() {
                    return Err(AppError::Cancelled("response dropped".into()));
                }
            }
        }

        tokio::select! {
            biased;
            taken = &mut accepted => {
                if taken.is_err() {
                    return Err(AppError::Cancelled("response dropped".into()));
                }
            }
            () = shared.cancel.cancelled() => {
                // Withdraw the offer; it only counts if the consumer took
                // it before the withdrawal.
                accepted.close();
                if accepted.try_recv().is_err() {
                    return Err(cancelled());
                }
            }
        }

        if single {
            shared.finish(&mut producer, Terminal::Completed);
        }
        Ok(())
    }
}

/// Consumer half of a stream.
pub struct Response<V> {
    receiver: mpsc::Receiver<Handoff<V>>,
    shared: Arc<Shared<V>>,
}

impl<V> fmt::Debug for Response<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("length", &self.shared.length.get())
            .field("closed", &self.shared.terminal.get().is_some())
            .finish_non_exhaustive()
    }
}

impl<V: Send> Response<V> {
    /// Wait for the next value, the end of the stream, or cancellation.
    ///
    /// After the stream has ended every further call returns the same
    /// terminal outcome.
    pub async fn next(&mut self) -> Received<V> {
        loop {
            let handoff = tokio::select! {
                biased;
                handoff = self.receiver.recv() => handoff,
                () = self.shared.cancel.cancelled() => return Received::Error(cancelled()),
            };

            match handoff {
                Some((item, ack)) => {
                    // The producer withdrew this value after cancellation.
                    if ack.send(()).is_err() {
                        continue;
                    }
                    return Received::Value(item.into_inner());
                }
                None => return self.shared.terminal_received(),
            }
        }
    }

    /// Declared length. Waits until the producer emits its first value or
    /// closes; zero when no length was declared.
    pub async fn length(&self) -> u64 {
        wait_length(Arc::clone(&self.shared)).await
    }

    /// Terminal error, if the stream has closed with one. Never blocks.
    #[must_use]
    pub fn error(&self) -> Option<CmdError> {
        match self.shared.terminal.get() {
            Some(Terminal::Failed(err)) => Some(CmdError::from(err)),
            _ => None,
        }
    }

    /// Cancellation context of the invocation.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.shared.cancel
    }
}

async fn wait_length<V>(shared: Arc<Shared<V>>) -> u64 {
    let mut activity = shared.activity.subscribe();
    // The sender lives in `shared`, which we hold, so this cannot fail.
    let _ = activity.wait_for(|fired| *fired).await;
    shared.length.get().copied().unwrap_or(0)
}

/// Boxed future returned by [`Consumer`] methods.
pub type ConsumerFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Consumer-side contract shared by the in-process [`Response`] and the
/// HTTP client response.
pub trait Consumer: Send {
    /// Value type yielded by the stream.
    type Item: Send;

    /// Wait for the next value, the end of the stream, or cancellation.
    fn next(&mut self) -> ConsumerFuture<'_, Received<Self::Item>>;

    /// Declared length of the stream, zero when unknown.
    fn length(&self) -> ConsumerFuture<'static, u64>;

    /// Terminal error, if the stream has closed with one.
    fn error(&self) -> Option<CmdError>;
}

impl<V: Send + 'static> Consumer for Response<V> {
    type Item = V;

    fn next(&mut self) -> ConsumerFuture<'_, Received<V>> {
        Box::pin(Response::next(self))
    }

    fn length(&self) -> ConsumerFuture<'static, u64> {
        Box::pin(wait_length(Arc::clone(&self.shared)))
    }

    fn error(&self) -> Option<CmdError> {
        Response::error(self)
    }
}

/// An absent consumer behaves as an empty, successful stream.
impl<C: Consumer> Consumer for Option<C> {
    type Item = C::Item;

    fn next(&mut self) -> ConsumerFuture<'_, Received<C::Item>> {
        match self {
            Some(inner) => inner.next(),
            None => Box::pin(std::future::ready(Received::EndOfStream)),
        }
    }

    fn length(&self) -> ConsumerFuture<'static, u64> {
        match self {
            Some(inner) => inner.length(),
            None => Box::pin(std::future::ready(0)),
        }
    }

    fn error(&self) -> Option<CmdError> {
        self.as_ref().and_then(Consumer::error)
    }
}

/// Drain a consumer into a vector.
///
/// # Errors
///
/// Returns the terminal error after the values that preceded it are
/// discarded.
pub async fn collect<C: Consumer + ?Sized>(consumer: &mut C) -> Result<Vec<C::Item>> {
    let mut values = Vec::new();
    while let Some(value) = consumer.next().await.into_result()? {
        values.push(value);
    }
    Ok(values)
}
