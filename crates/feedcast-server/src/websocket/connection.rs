//! Per-client delivery pipeline.
//!
//! A [`ClientConnection`] owns one client's transport and two background
//! tasks:
//!
//! - the enqueue task moves serialized frames from the bounded outbound
//!   channel into the [`DelayQueue`], tagging each with the current artificial
//!   delay and then decaying it;
//! - the flush task drains the delay queue in order, sleeps out each tag and
//!   writes the frame to the transport.
//!
//! Every direct transport operation (read, raw write, ping, close) goes
//! through one async mutex, so reads and writes never interleave. The
//! transport sits behind a read buffer so a caller can wait for inbound data
//! without consuming a partial frame.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::deflate::FlateReader;
use super::delay_queue::{DelayQueue, ScheduledMessage};
use super::frame::{COMPILED_PING, IncomingMessage, read_message};
use super::manager::ConnectionManager;
use super::message::{MessageIndex, PreparedMessage, serialize_message};
use super::transport::Transport;
use crate::errors::{ConnectionError, FrameError};
use crate::lifecycle::TaskGroup;
use crate::metrics::{FEED_DELAY_QUEUE_DEPTH, FEED_WRITE_ERRORS_TOTAL};

/// Upper bound on a graceful transport shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type BufferedTransport = BufReader<Box<dyn Transport>>;

/// Transport and the inflate context that must advance with it.
struct IoState {
    transport: Option<BufferedTransport>,
    flate: Option<FlateReader>,
}

/// One subscriber.
pub struct ClientConnection {
    id: u64,
    name: String,
    connecting_ip: IpAddr,
    remote_addr: Option<SocketAddr>,
    created: Instant,
    /// Nanoseconds since `created` of the last read attempt.
    last_heard: AtomicU64,
    requested_seq_num: MessageIndex,
    compression: bool,
    io: tokio::sync::Mutex<IoState>,
    manager: Weak<dyn ConnectionManager>,
    max_message_size: usize,
    max_delay_queue: usize,
    out_tx: mpsc::Sender<Bytes>,
    /// Taken by the enqueue task on start, or dropped on stop.
    out_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    delay: Duration,
    delay_decay_rate: f64,
    closed: CancellationToken,
    tasks: TaskGroup,
}

impl ClientConnection {
    /// Wrap an upgraded transport.
    ///
    /// Queue depth and message limits are read from `manager` once here.
    /// `delay_decay_rate` must lie in `(0, 1]`.
    pub fn new<T, M>(
        transport: T,
        manager: &Arc<M>,
        requested_seq_num: MessageIndex,
        connecting_ip: IpAddr,
        compression: bool,
        delay: Duration,
        delay_decay_rate: f64,
    ) -> Result<Arc<Self>, ConnectionError>
    where
        T: Transport,
        M: ConnectionManager + 'static,
    {
        if !(delay_decay_rate > 0.0 && delay_decay_rate <= 1.0) {
            return Err(ConnectionError::InvalidConfig(format!(
                "delay decay rate must be in (0, 1], got {delay_decay_rate}"
            )));
        }
        let settings = manager.settings();
        if settings.max_send_queue == 0 {
            return Err(ConnectionError::InvalidConfig(
                "max send queue must be greater than zero".into(),
            ));
        }

        let remote_addr = transport.peer_addr();
        let remote = remote_addr.map_or_else(|| "unknown".to_owned(), |a| a.to_string());
        let name = format!(
            "{connecting_ip}@{remote}-{}",
            rand::rng().random_range(0..10)
        );
        let (out_tx, out_rx) = mpsc::channel(settings.max_send_queue);
        let manager: Weak<M> = Arc::downgrade(manager);

        Ok(Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            name,
            connecting_ip,
            remote_addr,
            created: Instant::now(),
            last_heard: AtomicU64::new(0),
            requested_seq_num,
            compression,
            io: tokio::sync::Mutex::new(IoState {
                transport: Some(BufReader::new(Box::new(transport))),
                flate: compression.then(FlateReader::new),
            }),
            manager,
            max_message_size: settings.max_message_size,
            max_delay_queue: settings.max_delay_queue,
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            delay,
            delay_decay_rate,
            closed: CancellationToken::new(),
            tasks: TaskGroup::new(),
        }))
    }

    /// Process-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Correlation tag for logs. Not unique.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the client connected from, as reported by the handshake.
    pub fn connecting_ip(&self) -> IpAddr {
        self.connecting_ip
    }

    /// Socket peer address, if the transport has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Time since construction.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Whether permessage-deflate was negotiated.
    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Feed position the client asked to resume from.
    pub fn requested_seq_num(&self) -> MessageIndex {
        self.requested_seq_num
    }

    /// Snapshot of the heartbeat. Equals the creation time until the first
    /// read.
    pub fn last_heard(&self) -> Instant {
        self.created + Duration::from_nanos(self.last_heard.load(Ordering::Acquire))
    }

    /// Time since the heartbeat was last updated.
    pub fn last_heard_elapsed(&self) -> Duration {
        self.last_heard().elapsed()
    }

    /// Messages waiting in the outbound channel.
    pub fn outbound_len(&self) -> usize {
        self.out_tx.max_capacity() - self.out_tx.capacity()
    }

    /// Whether the connection has been stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is stopped.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Launch the enqueue and flush tasks under a child of `parent`.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let Some(outbound) = self.out_rx.lock().take() else {
            return Err(ConnectionError::AlreadyStarted);
        };
        if !self.tasks.start(parent) {
            return Err(ConnectionError::AlreadyStarted);
        }

        let queue = Arc::new(DelayQueue::new());
        let conn = Arc::clone(self);
        let enqueue_queue = Arc::clone(&queue);
        let _ = self
            .tasks
            .launch(move |cancel| conn.run_enqueue(outbound, enqueue_queue, cancel));
        let conn = Arc::clone(self);
        let _ = self
            .tasks
            .launch(move |cancel| conn.run_flush(queue, cancel));

        debug!(client = %self.name, seq = %self.requested_seq_num, "client pipeline started");
        Ok(())
    }

    async fn run_enqueue(
        self: Arc<Self>,
        mut outbound: mpsc::Receiver<Bytes>,
        queue: Arc<DelayQueue>,
        cancel: CancellationToken,
    ) {
        let mut delay = self.delay;
        loop {
            let data = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                item = outbound.recv() => match item {
                    Some(data) => data,
                    None => return,
                },
            };

            let depth = queue.push_back(ScheduledMessage { data, delay });
            histogram!(FEED_DELAY_QUEUE_DEPTH).record(depth as f64);
            if self.max_delay_queue > 0 && depth > self.max_delay_queue {
                warn!(
                    client = %self.name,
                    depth,
                    limit = self.max_delay_queue,
                    "delay queue over limit, removing client"
                );
                self.request_removal().await;
                return;
            }

            if !delay.is_zero() {
                delay = decay_delay(delay, self.delay_decay_rate);
                if delay.is_zero() {
                    debug!(client = %self.name, "client now connected without delay");
                }
            }
        }
    }

    async fn run_flush(self: Arc<Self>, queue: Arc<DelayQueue>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = queue.pending() => {}
            }

            while let Some(item) = queue.pop_front() {
                if !item.delay.is_zero() {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(item.delay) => {}
                    }
                }
                if let Err(e) = self.write_raw(&item.data).await {
                    if self.is_closed() || cancel.is_cancelled() {
                        return;
                    }
                    warn!(client = %self.name, error = %e, "error writing data to client");
                    counter!(FEED_WRITE_ERRORS_TOTAL).increment(1);
                    self.request_removal().await;
                    return;
                }
            }
        }
    }

    async fn request_removal(self: &Arc<Self>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove(self).await;
        } else {
            self.stop_only().await;
        }
    }

    /// Serialize `msg` in this connection's encoding and enqueue it.
    ///
    /// Waits while the outbound channel is full. Returns once enqueued, not
    /// once delivered; write failures surface as removal from the manager.
    pub async fn write<T>(&self, msg: &T) -> Result<(), ConnectionError>
    where
        T: Serialize + ?Sized,
    {
        let data = serialize_message(msg, self.compression)?;
        self.enqueue(data).await
    }

    /// Enqueue a pre-serialized message, waiting for capacity.
    pub async fn write_prepared(&self, msg: &PreparedMessage) -> Result<(), ConnectionError> {
        let data = self.pick_encoding(msg)?;
        self.enqueue(data).await
    }

    /// Enqueue a pre-serialized message without waiting.
    pub fn try_write_prepared(&self, msg: &PreparedMessage) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let data = self.pick_encoding(msg)?;
        self.out_tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    fn pick_encoding(&self, msg: &PreparedMessage) -> Result<Bytes, ConnectionError> {
        msg.encoding(self.compression).cloned().ok_or_else(|| {
            ConnectionError::Serialization(format!(
                "message has no {} encoding",
                if self.compression { "compressed" } else { "plain" }
            ))
        })
    }

    async fn enqueue(&self, data: Bytes) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(ConnectionError::Closed),
            res = self.out_tx.send(data) => res.map_err(|_| ConnectionError::Closed),
        }
    }

    /// Write encoded frame bytes directly to the transport.
    pub async fn write_raw(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut io = self.io.lock().await;
        let Some(transport) = io.transport.as_mut() else {
            return Err(ConnectionError::Closed);
        };
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(ConnectionError::Closed),
            res = async {
                transport.write_all(data).await?;
                transport.flush().await
            } => res.map_err(ConnectionError::Write),
        }
    }

    /// Send a ping control frame. Failure is left to the caller.
    pub async fn ping(&self) -> Result<(), ConnectionError> {
        let mut io = self.io.lock().await;
        let Some(transport) = io.transport.as_mut() else {
            return Err(ConnectionError::Closed);
        };
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(ConnectionError::Closed),
            res = async {
                transport.write_all(&COMPILED_PING).await?;
                transport.flush().await
            } => res.map_err(ConnectionError::Ping),
        }
    }

    /// Read one message from the client.
    ///
    /// Updates the heartbeat before reading. Any failure, including the
    /// timeout, closes the transport.
    pub async fn receive(&self, timeout: Duration) -> Result<IncomingMessage, ConnectionError> {
        let mut io = self.io.lock().await;
        if io.transport.is_none() {
            return Err(ConnectionError::Closed);
        }
        self.touch();
        self.read_locked(&mut io, timeout).await
    }

    /// Read one message only if the client has already started sending.
    ///
    /// Waits at most `wait` for the first byte and returns `Ok(None)` if none
    /// arrived; nothing is consumed and the transport stays open. Once data is
    /// available this behaves like [`receive`](Self::receive) with `timeout`.
    pub async fn receive_pending(
        &self,
        wait: Duration,
        timeout: Duration,
    ) -> Result<Option<IncomingMessage>, ConnectionError> {
        let mut io = self.io.lock().await;
        let Some(stream) = io.transport.as_mut() else {
            return Err(ConnectionError::Closed);
        };

        let ready = tokio::select! {
            biased;
            () = self.closed.cancelled() => return Err(ConnectionError::Closed),
            res = tokio::time::timeout(wait, async {
                stream.fill_buf().await.map(|buf| !buf.is_empty())
            }) => res,
        };
        let failure = match ready {
            Err(_) => return Ok(None),
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(Err(e)) => Some(e),
        };
        if let Some(e) = failure {
            let err = ConnectionError::Read(FrameError::Io(e));
            debug!(client = %self.name, error = %err, "closing client after failed read");
            Self::close_transport(&mut io.transport).await;
            return Err(err);
        }

        self.touch();
        self.read_locked(&mut io, timeout).await.map(Some)
    }

    /// Decode one message with the I/O lock held. Any failure closes the
    /// transport.
    async fn read_locked(
        &self,
        io: &mut IoState,
        timeout: Duration,
    ) -> Result<IncomingMessage, ConnectionError> {
        let IoState { transport, flate } = io;
        let Some(stream) = transport.as_mut() else {
            return Err(ConnectionError::Closed);
        };

        let read = read_message(stream, self.max_message_size, flate.as_mut());
        let result = tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(ConnectionError::Closed),
            res = tokio::time::timeout(timeout, read) => match res {
                Ok(msg) => msg.map_err(ConnectionError::from),
                Err(_) => Err(ConnectionError::Timeout(timeout)),
            },
        };

        if let Err(e) = &result {
            debug!(client = %self.name, error = %e, "closing client after failed read");
            Self::close_transport(transport).await;
        }
        result
    }

    fn touch(&self) {
        let now = self.created.elapsed().as_nanos() as u64;
        let _ = self
            .last_heard
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev.saturating_add(1)))
            });
    }

    async fn close_transport(transport: &mut Option<BufferedTransport>) {
        if let Some(mut stream) = transport.take() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await;
        }
    }

    /// Close the transport and signal the background tasks. Idempotent.
    pub async fn stop_only(&self) {
        self.closed.cancel();
        self.tasks.stop_only();
        drop(self.out_rx.lock().take());
        let mut io = self.io.lock().await;
        Self::close_transport(&mut io.transport).await;
    }

    /// Stop and wait up to `timeout` for the background tasks to exit.
    ///
    /// Returns `false` if a task was still running at the deadline.
    pub async fn stop_and_wait(&self, timeout: Duration) -> bool {
        self.stop_only().await;
        self.tasks.stop_and_wait(timeout).await
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("requested_seq_num", &self.requested_seq_num)
            .field("compression", &self.compression)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// One decay step: scale the nanosecond count by `rate` and truncate.
pub fn decay_delay(delay: Duration, rate: f64) -> Duration {
    Duration::from_nanos((delay.as_nanos() as f64 * rate) as u64)
}
