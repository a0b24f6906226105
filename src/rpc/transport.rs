//! TCP transport exchanging length prefixed [DhtMessage] frames.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{DhtMessage, MessageError};

use super::config::Config;
use super::request_tracker::{DuplicateRequestId, RequestOutcome, RequestTracker};

/// The maximum duration to backoff checking the listener after it had no pending connection.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);
/// Inbound connections without a frame for this long are closed.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
/// Inbound connections beyond this count are refused.
pub const MAX_INBOUND_CONNECTIONS: usize = 256;

const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(thiserror::Error, Debug)]
/// Failure to deliver a message, or to get its response.
pub enum TransportError {
    #[error(transparent)]
    /// Connection refused, reset, or any other socket error.
    Io(#[from] io::Error),

    #[error("No response before the request timeout")]
    Timeout,

    #[error("Frame of {size} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Decode(#[from] MessageError),

    #[error("Transport was shut down")]
    Shutdown,

    #[error("Connection closed before a response arrived")]
    NoResponse,

    #[error(transparent)]
    DuplicateRequest(#[from] DuplicateRequestId),
}

/// Receives verified inbound requests.
pub trait InboundHandler: Send + Sync {
    /// Handle a request received from the observed address `from`, returning
    /// the response to write back on the same connection, if any.
    fn handle_request(&self, from: SocketAddr, request: DhtMessage) -> Option<DhtMessage>;
}

/// Write one `[4-byte big-endian length][body]` frame.
pub fn write_frame<W: Write>(
    writer: &mut W,
    body: &[u8],
    max_frame_size: usize,
) -> Result<(), TransportError> {
    if body.len() > max_frame_size || body.len() > u32::MAX as usize {
        return Err(TransportError::FrameTooLarge {
            size: body.len(),
            max: max_frame_size,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);

    writer.write_all(&frame)?;
    writer.flush()?;

    Ok(())
}

/// Read one frame, returns `None` if the stream ended cleanly before a new frame.
pub fn read_frame<R: Read>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut prefix = [0_u8; LENGTH_PREFIX_SIZE];

    match reader.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    }

    let size = u32::from_be_bytes(prefix) as usize;
    if size > max_frame_size {
        return Err(TransportError::FrameTooLarge {
            size,
            max: max_frame_size,
        });
    }

    let mut body = vec![0_u8; size];
    reader.read_exact(&mut body)?;

    Ok(Some(body))
}

#[derive(Debug)]
/// Listens for inbound connections and opens one connection per outbound request.
pub struct TcpTransport {
    shared: Arc<Shared>,
    listener: Mutex<Option<TcpListener>>,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct Shared {
    local_addr: SocketAddr,
    tracker: Arc<RequestTracker>,

    request_timeout: Duration,
    max_clock_skew: Duration,
    max_frame_size: usize,

    closing: AtomicBool,
    next_connection: AtomicU64,
    /// Clones of open inbound streams, to tear them down on shutdown.
    connections: Mutex<HashMap<u64, TcpStream>>,
}

impl TcpTransport {
    /// Bind the listening socket, connections are accepted once [Self::serve] is called.
    pub fn bind(config: &Config, tracker: Arc<RequestTracker>) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(SocketAddr::new(
            config.bind_address,
            config.port.unwrap_or(0),
        ))?;
        let local_addr = listener.local_addr()?;

        listener.set_nonblocking(true)?;

        Ok(Self {
            shared: Arc::new(Shared {
                local_addr,
                tracker,
                request_timeout: config.request_timeout,
                max_clock_skew: config.max_clock_skew,
                max_frame_size: config.max_frame_size,
                closing: AtomicBool::new(false),
                next_connection: AtomicU64::new(0),
                connections: Mutex::new(HashMap::new()),
            }),
            listener: Mutex::new(Some(listener)),
            accept_loop: Mutex::new(None),
        })
    }

    // === Getters ===

    /// Returns the address the transport is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Number of inbound connections currently open.
    pub fn inbound_connections(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    // === Public Methods ===

    /// Start accepting connections, dispatching verified requests to `handler`.
    ///
    /// Calling it more than once has no effect.
    pub fn serve(&self, handler: Weak<dyn InboundHandler>) -> Result<(), io::Error> {
        let Some(listener) = lock(&self.listener).take() else {
            return Ok(());
        };

        let shared = self.shared.clone();
        let accept_loop = thread::Builder::new()
            .name("mangamesh-accept".to_string())
            .spawn(move || accept_loop(listener, shared, handler))?;

        *lock(&self.accept_loop) = Some(accept_loop);

        Ok(())
    }

    /// Stop accepting, give inflight handlers `grace` to finish, then tear down
    /// what is left.
    pub fn shutdown(&self, grace: Duration) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        lock(&self.listener).take();
        if let Some(accept_loop) = lock(&self.accept_loop).take() {
            let _ = accept_loop.join();
        }

        // No new frames, handlers still busy can write their response.
        for stream in lock(&self.shared.connections).values() {
            let _ = stream.shutdown(Shutdown::Read);
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && self.inbound_connections() > 0 {
            thread::sleep(MAX_THREAD_BLOCK_DURATION);
        }

        let remaining = {
            let mut connections = lock(&self.shared.connections);
            connections.drain().map(|(_, stream)| stream).collect::<Vec<_>>()
        };

        if !remaining.is_empty() {
            debug!(
                context = "transport_shutdown",
                count = remaining.len(),
                "Forcibly closing connections after grace period"
            );
        }

        for stream in remaining {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Send a request and wait for its correlated response.
    pub fn request(
        &self,
        address: SocketAddr,
        request: DhtMessage,
    ) -> Result<DhtMessage, TransportError> {
        if self.is_shutdown() {
            return Err(TransportError::Shutdown);
        }

        trace!(context = "transport_request", ?address, message = ?request);

        let request_id = request.request_id;
        let handle = self
            .shared
            .tracker
            .register(request_id, self.shared.request_timeout)?;

        if let Err(error) = self.exchange(address, &request, handle.deadline()) {
            // Only surface the error if nothing resolved the request meanwhile.
            if self.shared.tracker.fail(&request_id, error.to_string()) {
                debug!(context = "transport_request", ?address, %error, "Request failed");
                return Err(error);
            }
        }

        match handle.wait() {
            RequestOutcome::Response(response) => Ok(response),
            RequestOutcome::TimedOut => Err(TransportError::Timeout),
            RequestOutcome::Failed(_) => Err(TransportError::Shutdown),
        }
    }

    fn exchange(
        &self,
        address: SocketAddr,
        request: &DhtMessage,
        deadline: Instant,
    ) -> Result<(), TransportError> {
        let budget = remaining(deadline)?;

        let mut stream = TcpStream::connect_timeout(&address, budget)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(budget))?;

        write_frame(
            &mut stream,
            &request.to_bytes()?,
            self.shared.max_frame_size,
        )?;

        loop {
            stream.set_read_timeout(Some(remaining(deadline)?))?;

            let frame = match read_frame(&mut stream, self.shared.max_frame_size) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(TransportError::NoResponse),
                Err(TransportError::Io(error))
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue
                }
                Err(error) => return Err(error),
            };

            let Some(message) = self.shared.verified(address, &frame) else {
                continue;
            };

            if message.message_type.is_response() {
                let request_id = message.request_id;
                let ours = request_id == request.request_id;

                self.shared.tracker.resolve(&request_id, message);

                if ours {
                    return Ok(());
                }
            } else {
                trace!(
                    context = "transport_outbound",
                    ?address,
                    message_type = %message.message_type,
                    "Ignoring request on an outbound connection"
                );
            }
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
    }
}

impl Shared {
    /// Decode and verify a frame, dropping it with a log line on failure.
    fn verified(&self, from: SocketAddr, frame: &[u8]) -> Option<DhtMessage> {
        let message = match DhtMessage::from_bytes(frame) {
            Ok(message) => message,
            Err(error) => {
                debug!(context = "transport_inbound", ?from, %error, "Dropping malformed frame");
                return None;
            }
        };

        if let Err(reason) = message.verify(self.max_clock_skew) {
            debug!(
                context = "transport_inbound",
                ?from,
                sender_id = %message.sender_id,
                message_type = %message.message_type,
                %reason,
                "Dropping unverified message"
            );
            return None;
        }

        trace!(context = "transport_inbound", ?from, ?message);

        Some(message)
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, handler: Weak<dyn InboundHandler>) {
    loop {
        if shared.closing.load(Ordering::Acquire) {
            break;
        }

        match listener.accept() {
            Ok((stream, from)) => {
                if lock(&shared.connections).len() >= MAX_INBOUND_CONNECTIONS {
                    debug!(context = "transport_accept", ?from, "Too many connections, refusing");
                    continue;
                }

                if let Err(error) = spawn_connection(stream, from, &shared, &handler) {
                    debug!(
                        context = "transport_accept",
                        ?from,
                        %error,
                        "Failed to set up connection"
                    );
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
            Err(error) => {
                debug!(context = "transport_accept", %error, "Accept failed");
                thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
        }
    }

    trace!(context = "transport_accept", "Accept loop stopped");
}

fn spawn_connection(
    stream: TcpStream,
    from: SocketAddr,
    shared: &Arc<Shared>,
    handler: &Weak<dyn InboundHandler>,
) -> Result<(), io::Error> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(IDLE_CONNECTION_TIMEOUT))?;
    stream.set_write_timeout(Some(shared.request_timeout))?;

    let connection_id = shared.next_connection.fetch_add(1, Ordering::Relaxed);
    lock(&shared.connections).insert(connection_id, stream.try_clone()?);

    let spawned = thread::Builder::new()
        .name("mangamesh-connection".to_string())
        .spawn({
            let shared = shared.clone();
            let handler = handler.clone();
            move || {
                serve_connection(stream, from, &shared, &handler);
                lock(&shared.connections).remove(&connection_id);
            }
        });

    if let Err(error) = spawned {
        lock(&shared.connections).remove(&connection_id);
        return Err(error);
    }

    Ok(())
}

fn serve_connection(
    mut stream: TcpStream,
    from: SocketAddr,
    shared: &Shared,
    handler: &Weak<dyn InboundHandler>,
) {
    loop {
        let frame = match read_frame(&mut stream, shared.max_frame_size) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(TransportError::FrameTooLarge { size, max }) => {
                debug!(
                    context = "transport_inbound",
                    ?from,
                    size,
                    max,
                    "Oversized frame, closing connection"
                );
                break;
            }
            Err(error) => {
                trace!(context = "transport_inbound", ?from, %error, "Connection closed");
                break;
            }
        };

        let Some(message) = shared.verified(from, &frame) else {
            continue;
        };

        if message.message_type.is_response() {
            let request_id = message.request_id;
            shared.tracker.resolve(&request_id, message);
            continue;
        }

        let Some(handler) = handler.upgrade() else {
            break;
        };

        if let Some(response) = handler.handle_request(from, message) {
            let written = response
                .to_bytes()
                .map_err(TransportError::from)
                .and_then(|body| write_frame(&mut stream, &body, shared.max_frame_size));

            if let Err(error) = written {
                debug!(context = "transport_inbound", ?from, %error, "Failed to write response");
                break;
            }
        }
    }

    let _ = stream.shutdown(Shutdown::Both);
}

fn remaining(deadline: Instant) -> Result<Duration, TransportError> {
    let remaining = deadline.saturating_duration_since(Instant::now());

    if remaining.is_zero() {
        return Err(TransportError::Timeout);
    }

    Ok(remaining)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
