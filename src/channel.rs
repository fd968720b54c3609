//! Live-delivery channels.
//!
//! A channel connects the dispatcher (producer, [`ChannelSender`]) to one
//! open client stream (consumer, [`Session`]). It ends exactly once, through
//! [`ChannelSender::end`] or [`Session::end`], whichever cause comes first:
//! the consumer finishing, the session deadline, a full queue, or a failed
//! transport write.

use crate::error::Result;
use crate::event::{EventKind, FeedEntry};
use crate::types::{ChannelId, EventId, RecipientId};
use crossbeam_channel::{after, bounded, never, select, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of channel ids. Ids are never reused within a process.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Session configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Max queued live deliveries before the channel is ended as overflowed.
    /// Default: 1000
    pub buffer_size: usize,

    /// How long a live push may wait for queue space. Zero never blocks.
    pub push_timeout: Duration,

    /// Session lifetime. `None` keeps the session open until it is ended.
    /// Default: 60s
    pub session_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            push_timeout: Duration::ZERO,
            session_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// One event ready to go out on a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub event_id: EventId,
    pub kind: EventKind,
    /// Serialized feed entry. Shared between every channel of a fan-out.
    pub payload: Arc<str>,
}

impl Delivery {
    pub fn from_entry(entry: &FeedEntry) -> Result<Self> {
        Ok(Self {
            event_id: entry.id(),
            kind: entry.kind(),
            payload: Arc::from(entry.to_json()?),
        })
    }
}

/// Why a channel ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// The consumer finished or dropped its session.
    Completed,
    /// The session lifetime elapsed.
    TimedOut,
    /// The live queue stayed full (slow consumer).
    Overflow,
    /// The other side of the channel is gone.
    Disconnected,
    /// Writing to the transport failed.
    DeliveryFailed(String),
    /// The dispatcher closed every channel.
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Completed => write!(f, "completed"),
            EndReason::TimedOut => write!(f, "timed out"),
            EndReason::Overflow => write!(f, "buffer overflow"),
            EndReason::Disconnected => write!(f, "disconnected"),
            EndReason::DeliveryFailed(e) => write!(f, "delivery failed: {}", e),
            EndReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Outbound side of a client stream.
pub trait Transport {
    /// Write one event. `payload` is already serialized.
    fn send(&mut self, event_id: EventId, kind: EventKind, payload: &str) -> io::Result<()>;
}

type EndCallback = Box<dyn FnOnce(&EndReason) + Send>;

struct Ending {
    reason: Option<EndReason>,
    callbacks: Vec<EndCallback>,
    /// Dropped on end to wake a receiver blocked in `select!`.
    closed: Option<Sender<()>>,
}

/// State shared by both halves of a channel.
struct ChannelState {
    id: ChannelId,
    recipient: RecipientId,
    push_timeout: Duration,
    deadline: Option<Instant>,
    ended: AtomicBool,
    ending: Mutex<Ending>,
}

impl ChannelState {
    fn end(&self, reason: EndReason) -> bool {
        if self.ended.swap(true, Ordering::AcqRel) {
            return false;
        }

        let (callbacks, closed) = {
            let mut ending = self.ending.lock();
            ending.reason = Some(reason.clone());
            (std::mem::take(&mut ending.callbacks), ending.closed.take())
        };
        drop(closed);

        tracing::debug!(
            channel = %self.id,
            recipient = %self.recipient,
            reason = %reason,
            "Channel ended"
        );

        for callback in callbacks {
            callback(&reason);
        }
        true
    }

    fn on_end(&self, callback: EndCallback) {
        let reason = {
            let mut ending = self.ending.lock();
            match ending.reason.clone() {
                Some(reason) => reason,
                None => {
                    ending.callbacks.push(callback);
                    return;
                }
            }
        };
        callback(&reason);
    }

    fn reason(&self) -> Option<EndReason> {
        self.ending.lock().reason.clone()
    }

    /// End the channel as timed out once its deadline has passed. Returns
    /// whether the channel is still open.
    fn check_deadline(&self) -> bool {
        if self.ended.load(Ordering::Acquire) {
            return false;
        }
        if matches!(self.deadline, Some(deadline) if Instant::now() >= deadline) {
            self.end(EndReason::TimedOut);
            return false;
        }
        true
    }
}

/// Create a channel for `recipient`.
///
/// The live queue holds at most `buffer_size` deliveries. With a
/// `session_timeout` the session ends as [`EndReason::TimedOut`] once it
/// elapses.
pub fn channel(recipient: RecipientId, config: &SessionConfig) -> (ChannelSender, Session) {
    let (sender, receiver) = bounded(config.buffer_size.max(1));
    let (closed_tx, closed_rx) = bounded(0);

    let state = Arc::new(ChannelState {
        id: ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)),
        recipient,
        push_timeout: config.push_timeout,
        deadline: config.session_timeout.map(|t| Instant::now() + t),
        ended: AtomicBool::new(false),
        ending: Mutex::new(Ending {
            reason: None,
            callbacks: Vec::new(),
            closed: Some(closed_tx),
        }),
    });

    let session = Session {
        state: Arc::clone(&state),
        replay: VecDeque::new(),
        receiver,
        closed: closed_rx,
    };

    (ChannelSender { state, sender }, session)
}

/// Producer half. Cheap to clone; the registry holds one per open channel.
#[derive(Clone)]
pub struct ChannelSender {
    state: Arc<ChannelState>,
    sender: Sender<Delivery>,
}

impl ChannelSender {
    pub fn id(&self) -> ChannelId {
        self.state.id
    }

    pub fn recipient(&self) -> RecipientId {
        self.state.recipient
    }

    pub fn is_ended(&self) -> bool {
        self.state.ended.load(Ordering::Acquire)
    }

    /// Whether the channel can still take deliveries. A channel past its
    /// session deadline is ended as [`EndReason::TimedOut`] here, without
    /// waiting for the consumer to notice.
    pub fn is_open(&self) -> bool {
        self.state.check_deadline()
    }

    /// End the channel. Returns false if it had already ended.
    pub fn end(&self, reason: EndReason) -> bool {
        self.state.end(reason)
    }

    /// Run `callback` once the channel ends (immediately if it already has).
    pub fn on_end<F>(&self, callback: F)
    where
        F: FnOnce(&EndReason) + Send + 'static,
    {
        self.state.on_end(Box::new(callback));
    }

    /// Enqueue a live delivery.
    ///
    /// Waits up to the session's `push_timeout` for queue space. On failure
    /// the caller is expected to end the channel with the returned reason.
    pub fn push(&self, delivery: Delivery) -> std::result::Result<(), EndReason> {
        if !self.is_open() {
            return Err(self.state.reason().unwrap_or(EndReason::Disconnected));
        }

        let wait = self.state.push_timeout;
        if wait.is_zero() {
            self.sender.try_send(delivery).map_err(|e| match e {
                TrySendError::Full(_) => EndReason::Overflow,
                TrySendError::Disconnected(_) => EndReason::Disconnected,
            })
        } else {
            self.sender
                .send_timeout(delivery, wait)
                .map_err(|e| match e {
                    crossbeam_channel::SendTimeoutError::Timeout(_) => EndReason::Overflow,
                    crossbeam_channel::SendTimeoutError::Disconnected(_) => EndReason::Disconnected,
                })
        }
    }

    /// Number of queued live deliveries.
    pub fn queued(&self) -> usize {
        self.sender.len()
    }
}

impl fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("id", &self.state.id)
            .field("recipient", &self.state.recipient)
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Consumer half, owned by the transport layer.
///
/// Replayed backlog is handed out first, then live deliveries in the order
/// they were pushed. Dropping the session ends the channel as
/// [`EndReason::Completed`].
pub struct Session {
    state: Arc<ChannelState>,
    replay: VecDeque<Delivery>,
    receiver: Receiver<Delivery>,
    closed: Receiver<()>,
}

impl Session {
    pub fn id(&self) -> ChannelId {
        self.state.id
    }

    pub fn recipient(&self) -> RecipientId {
        self.state.recipient
    }

    pub fn is_ended(&self) -> bool {
        self.state.ended.load(Ordering::Acquire)
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.state.reason()
    }

    /// End the channel. Returns false if it had already ended.
    pub fn end(&self, reason: EndReason) -> bool {
        self.state.end(reason)
    }

    /// End the channel as completed by the consumer.
    pub fn complete(&self) -> bool {
        self.end(EndReason::Completed)
    }

    /// Run `callback` once the channel ends (immediately if it already has).
    pub fn on_end<F>(&self, callback: F)
    where
        F: FnOnce(&EndReason) + Send + 'static,
    {
        self.state.on_end(Box::new(callback));
    }

    /// Deliveries waiting to be received, replay included.
    pub fn pending(&self) -> usize {
        self.replay.len() + self.receiver.len()
    }

    pub(crate) fn enqueue_replay(&mut self, deliveries: impl IntoIterator<Item = Delivery>) {
        self.replay.extend(deliveries);
    }

    /// Block until the next delivery or until the channel ends.
    pub fn recv(&mut self) -> std::result::Result<Delivery, EndReason> {
        loop {
            if let Some(delivery) = self.wait(None)? {
                return Ok(delivery);
            }
        }
    }

    /// Wait up to `timeout` for the next delivery. `Ok(None)` means nothing
    /// arrived but the channel is still open.
    pub fn recv_timeout(&mut self, timeout: Duration) -> std::result::Result<Option<Delivery>, EndReason> {
        self.wait(Some(Instant::now() + timeout))
    }

    /// Take the next delivery without blocking.
    pub fn try_recv(&mut self) -> std::result::Result<Option<Delivery>, EndReason> {
        self.check_open()?;
        if let Some(delivery) = self.replay.pop_front() {
            return Ok(Some(delivery));
        }

        match self.receiver.try_recv() {
            Ok(delivery) => Ok(Some(delivery)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.finish(EndReason::Disconnected)),
        }
    }

    /// Forward deliveries to `transport` until the channel ends.
    pub fn pump<T: Transport + ?Sized>(&mut self, transport: &mut T) -> EndReason {
        loop {
            let delivery = match self.recv() {
                Ok(delivery) => delivery,
                Err(reason) => return reason,
            };

            if let Err(e) = transport.send(delivery.event_id, delivery.kind, &delivery.payload) {
                tracing::warn!(
                    channel = %self.state.id,
                    recipient = %self.state.recipient,
                    event = %delivery.event_id,
                    error = %e,
                    "Transport write failed"
                );
                return self.finish(EndReason::DeliveryFailed(e.to_string()));
            }
        }
    }

    /// Fail if the channel has ended or its deadline has passed.
    fn check_open(&self) -> std::result::Result<(), EndReason> {
        if let Some(reason) = self.state.reason() {
            return Err(reason);
        }
        if !self.state.check_deadline() {
            return Err(self.state.reason().unwrap_or(EndReason::TimedOut));
        }
        Ok(())
    }

    fn wait(&mut self, until: Option<Instant>) -> std::result::Result<Option<Delivery>, EndReason> {
        self.check_open()?;
        if let Some(delivery) = self.replay.pop_front() {
            return Ok(Some(delivery));
        }

        let wake = match (until, self.state.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let timer = match wake {
            Some(at) => after(at.saturating_duration_since(Instant::now())),
            None => never(),
        };

        select! {
            recv(self.receiver) -> msg => match msg {
                Ok(delivery) => Ok(Some(delivery)),
                Err(_) => Err(self.finish(EndReason::Disconnected)),
            },
            recv(self.closed) -> _ => Err(self.state.reason().unwrap_or(EndReason::Disconnected)),
            recv(timer) -> _ => self.check_open().map(|_| None),
        }
    }

    /// End with `reason` and report whichever reason actually won.
    fn finish(&self, reason: EndReason) -> EndReason {
        self.state.end(reason.clone());
        self.state.reason().unwrap_or(reason)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.state.id)
            .field("recipient", &self.state.recipient)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.state.end(EndReason::Completed);
    }
}
