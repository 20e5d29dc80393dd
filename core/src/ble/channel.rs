/// Byte-stream channel adapter
///
/// Wraps a platform duplex stream (an L2CAP CoC on most stacks) behind a
/// blocking read/write contract. The platform side only reports "not ready"
/// and signals a [`Readiness`] when something changes; this module is the
/// single place where that backpressure is turned into blocking calls.
/// Blocking calls belong on a worker thread (`spawn_blocking`), never on the
/// event-delivery path.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::radio::{ChannelRequestId, PeerHandle, RadioStack};
use crate::config::ChannelConfig;

/// Channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Channel I/O error: {0}")]
    Io(String),
    #[error("Read length must be non-zero")]
    InvalidLength,
    #[error("Channel open timed out")]
    OpenTimeout,
    #[error("Channel request failed: {0}")]
    RequestFailed(String),
}

impl From<ChannelError> for io::Error {
    fn from(err: ChannelError) -> Self {
        let kind = match err {
            ChannelError::ChannelClosed => io::ErrorKind::NotConnected,
            ChannelError::InvalidLength => io::ErrorKind::InvalidInput,
            ChannelError::OpenTimeout => io::ErrorKind::TimedOut,
            ChannelError::Io(_) | ChannelError::RequestFailed(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Change notification shared between a raw stream and its reader/writer
///
/// Platform callbacks call [`Readiness::notify`] whenever bytes arrive, space
/// frees up or the stream ends; blocked callers wait for the sequence number
/// to move instead of spinning.
#[derive(Debug, Clone, Default)]
pub struct Readiness {
    inner: Arc<(Mutex<u64>, Condvar)>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let (seq, condvar) = &*self.inner;
        *seq.lock() += 1;
        condvar.notify_all();
    }

    /// Current sequence number
    pub fn generation(&self) -> u64 {
        *self.inner.0.lock()
    }

    /// Block until the sequence moves past `seen` or `timeout` elapses
    pub fn wait_for_change(&self, seen: u64, timeout: Duration) -> u64 {
        let (seq, condvar) = &*self.inner;
        let mut current = seq.lock();
        if *current == seen {
            condvar.wait_for(&mut current, timeout);
        }
        *current
    }
}

/// Non-blocking duplex transport provided by the platform
///
/// `read_available` returns `Ok(0)` at end of stream and `WouldBlock` when no
/// bytes are buffered yet. `write_available` returns how many bytes were
/// accepted, or `WouldBlock` when the send buffer is full. Any other error is
/// fatal to the stream.
pub trait RawStream: Send + Sync {
    fn read_available(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_available(&self, buf: &[u8]) -> io::Result<usize>;
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
    fn close(&self);
    fn readiness(&self) -> Readiness;
}

struct ChannelShared {
    id: Uuid,
    stream: Box<dyn RawStream>,
    readiness: Readiness,
    closed: AtomicBool,
}

impl ChannelShared {
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.stream.close();
        self.readiness.notify();
        debug!("Channel {} closed", self.id.simple());
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Weak shutdown handle kept by controllers for bookkeeping
#[derive(Clone)]
pub struct ChannelCloser {
    shared: Weak<ChannelShared>,
}

impl ChannelCloser {
    /// Close the channel if it is still alive; false if already gone or closed
    pub fn close(&self) -> bool {
        self.shared
            .upgrade()
            .map(|shared| shared.close())
            .unwrap_or(false)
    }

    pub fn is_alive(&self) -> bool {
        self.shared
            .upgrade()
            .map(|shared| !shared.is_closed())
            .unwrap_or(false)
    }
}

/// One established bidirectional byte stream
///
/// Owned by whoever received it; not `Clone`. Once closed every read and
/// write fails with [`ChannelError::ChannelClosed`] without blocking.
pub struct ByteStreamChannel {
    shared: Arc<ChannelShared>,
    peer: Option<PeerHandle>,
    poll_interval: Duration,
}

impl ByteStreamChannel {
    pub fn new(peer: Option<PeerHandle>, stream: Box<dyn RawStream>, poll_interval: Duration) -> Self {
        let readiness = stream.readiness();
        let id = Uuid::new_v4();
        debug!(
            "Channel {} opened{}",
            id.simple(),
            peer.as_ref()
                .map(|p| format!(" with {}", p))
                .unwrap_or_default()
        );
        Self {
            shared: Arc::new(ChannelShared {
                id,
                stream,
                readiness,
                closed: AtomicBool::new(false),
            }),
            peer,
            poll_interval,
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn peer(&self) -> Option<&PeerHandle> {
        self.peer.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn closer(&self) -> ChannelCloser {
        ChannelCloser {
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn read_into(&self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        loop {
            if self.shared.is_closed() {
                return Err(ChannelError::ChannelClosed);
            }
            let seen = self.shared.readiness.generation();
            match self.shared.stream.read_available(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.shared.readiness.wait_for_change(seen, self.poll_interval);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if self.shared.is_closed() {
                        return Err(ChannelError::ChannelClosed);
                    }
                    return Err(ChannelError::Io(e.to_string()));
                }
            }
        }
    }

    /// Block until at least one byte is available; empty at end of stream
    pub fn read(&self, max_len: usize) -> Result<Vec<u8>, ChannelError> {
        if max_len == 0 {
            return Err(ChannelError::InvalidLength);
        }
        let mut buf = vec![0u8; max_len];
        let n = self.read_into(&mut buf)?;
        buf.truncate(n);
        trace!("Channel {} read {} bytes", self.shared.id.simple(), n);
        Ok(buf)
    }

    /// Block until every byte is accepted
    ///
    /// A fatal error after partial progress returns the partial count; with
    /// no progress it is returned as the error.
    pub fn write(&self, data: &[u8]) -> Result<usize, ChannelError> {
        let mut written = 0;
        while written < data.len() {
            if self.shared.is_closed() {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(ChannelError::ChannelClosed)
                };
            }
            let seen = self.shared.readiness.generation();
            match self.shared.stream.write_available(&data[written..]) {
                Ok(0) => {
                    self.shared.readiness.wait_for_change(seen, self.poll_interval);
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.shared.readiness.wait_for_change(seen, self.poll_interval);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if written > 0 {
                        warn!(
                            "Channel {} write failed after {} of {} bytes: {}",
                            self.shared.id.simple(),
                            written,
                            data.len(),
                            e
                        );
                        return Ok(written);
                    }
                    if self.shared.is_closed() {
                        return Err(ChannelError::ChannelClosed);
                    }
                    return Err(ChannelError::Io(e.to_string()));
                }
            }
        }
        trace!("Channel {} wrote {} bytes", self.shared.id.simple(), written);
        Ok(written)
    }

    /// Best-effort drain hint
    pub fn flush(&self) -> Result<(), ChannelError> {
        if self.shared.is_closed() {
            return Err(ChannelError::ChannelClosed);
        }
        if let Err(e) = self.shared.stream.flush() {
            debug!("Channel {} flush: {}", self.shared.id.simple(), e);
        }
        Ok(())
    }

    /// Idempotent; wakes any blocked reader or writer
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for ByteStreamChannel {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for ByteStreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStreamChannel")
            .field("id", &self.shared.id)
            .field("peer", &self.peer)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl io::Read for ByteStreamChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        Ok(self.read_into(buf)?)
    }
}

impl io::Write for ByteStreamChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(ByteStreamChannel::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(ByteStreamChannel::flush(self)?)
    }
}

/// Correlates outbound stream requests with the streams the radio delivers
pub struct ChannelBroker {
    radio: Arc<dyn RadioStack>,
    pending: PendingMap,
    config: ChannelConfig,
}

impl ChannelBroker {
    pub fn new(radio: Arc<dyn RadioStack>, config: ChannelConfig) -> Self {
        Self {
            radio,
            pending: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Ask the radio for a stream to `peer` on `psm` and wait for it
    ///
    /// The request stays registered only while the returned future is alive;
    /// dropping it withdraws the request.
    pub async fn open(&self, peer: &PeerHandle, psm: u16) -> Result<ByteStreamChannel, ChannelError> {
        let request = ChannelRequestId::new();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request, tx);
        let _registration = PendingRequest {
            pending: &self.pending,
            request,
        };

        debug!("Requesting channel {} to {} on PSM {:#06x}", request, peer, psm);
        self.radio
            .open_channel(request, peer, psm)
            .map_err(|e| ChannelError::RequestFailed(e.to_string()))?;

        match tokio::time::timeout(self.config.open_timeout(), rx).await {
            Ok(Ok(raw)) => Ok(ByteStreamChannel::new(
                Some(peer.clone()),
                raw,
                self.config.poll_interval(),
            )),
            Ok(Err(_)) => Err(ChannelError::RequestFailed(format!(
                "request {} abandoned",
                request
            ))),
            Err(_) => {
                warn!("Channel request {} to {} timed out", request, peer);
                Err(ChannelError::OpenTimeout)
            }
        }
    }

    /// Deliver the stream for `request`; unknown or late streams are closed
    pub fn fulfil(&self, request: ChannelRequestId, raw: Box<dyn RawStream>) -> bool {
        let sender = self.pending.lock().remove(&request);
        match sender {
            Some(tx) => match tx.send(raw) {
                Ok(()) => true,
                Err(raw) => {
                    debug!("Channel request {} no longer awaited", request);
                    raw.close();
                    false
                }
            },
            None => {
                warn!("Dropping stream for unknown channel request {}", request);
                raw.close();
                false
            }
        }
    }

    /// The radio could not open the stream for `request`
    pub fn fail(&self, request: ChannelRequestId) -> bool {
        self.pending.lock().remove(&request).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Abandon every outstanding request
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }
}

type PendingMap = Mutex<HashMap<ChannelRequestId, oneshot::Sender<Box<dyn RawStream>>>>;

/// Removes an open request from the broker when its caller goes away
struct PendingRequest<'a> {
    pending: &'a PendingMap,
    request: ChannelRequestId,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if self.pending.lock().remove(&self.request).is_some() {
            trace!("Channel request {} withdrawn", self.request);
        }
    }
}

#[derive(Debug, Default)]
struct PipeState {
    data: VecDeque<u8>,
    writer_closed: bool,
    reader_closed: bool,
}

#[derive(Debug)]
struct Pipe {
    state: Mutex<PipeState>,
    capacity: usize,
}

impl Pipe {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipeState::default()),
            capacity: capacity.max(1),
        })
    }
}

/// In-process stream end produced by [`loopback_pair`]
#[derive(Debug)]
pub struct LoopbackStream {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
    readiness: Readiness,
}

/// Two connected in-process stream ends with bounded buffers
///
/// Used for same-host links and to exercise channel consumers without a radio.
pub fn loopback_pair(capacity: usize) -> (LoopbackStream, LoopbackStream) {
    let a_to_b = Pipe::new(capacity);
    let b_to_a = Pipe::new(capacity);
    let readiness = Readiness::new();
    (
        LoopbackStream {
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
            readiness: readiness.clone(),
        },
        LoopbackStream {
            inbound: a_to_b,
            outbound: b_to_a,
            readiness,
        },
    )
}

impl RawStream for LoopbackStream {
    fn read_available(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.inbound.state.lock();
        if state.reader_closed {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if !state.data.is_empty() {
            let n = buf.len().min(state.data.len());
            for (slot, byte) in buf.iter_mut().zip(state.data.drain(..n)) {
                *slot = byte;
            }
            drop(state);
            self.readiness.notify();
            return Ok(n);
        }
        if state.writer_closed {
            return Ok(0);
        }
        Err(io::Error::from(io::ErrorKind::WouldBlock))
    }

    fn write_available(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.outbound.state.lock();
        if state.writer_closed {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if state.reader_closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let space = self.outbound.capacity - state.data.len();
        if space == 0 {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = space.min(buf.len());
        state.data.extend(&buf[..n]);
        drop(state);
        self.readiness.notify();
        Ok(n)
    }

    fn close(&self) {
        self.inbound.state.lock().reader_closed = true;
        self.outbound.state.lock().writer_closed = true;
        self.readiness.notify();
    }

    fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }
}
