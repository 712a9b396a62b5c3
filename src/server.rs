//! Unix domain socket server streaming a followed file as chunked HTTP.
//!
//! Connections are served strictly one at a time. The accept loop waits on a
//! mio poll holding the listener and a shutdown waker, so an interrupt ends
//! the loop without tearing down a connection mid-accept. Each connection
//! gets exactly one request/response exchange and is then closed.
//!
//! While a response streams, the same poll also watches the client socket and
//! the follower's stdout. A client that hangs up is noticed even when the
//! followed file is idle, and a shutdown request cuts the stream short.

use crate::config::Config;
use crate::http::{self, ChunkedWriter, RequestError};
use crate::tail::{Line, TailProcess};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::fs;
use std::io::{self, BufReader};
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const CLIENT_TOKEN: Token = Token(2);
const FOLLOWER_TOKEN: Token = Token(3);

/// Requests an orderly stop of the accept loop from another thread or a
/// signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake accept loop");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Why a response body stopped.
#[derive(Debug)]
enum RelayEnd {
    /// Follower output ended.
    SourceExhausted,
    /// Reading from the follower failed.
    SourceFailed(io::Error),
    /// Writing to the client failed, or the client hung up.
    ClientGone(io::Error),
    /// Shutdown was requested.
    Shutdown,
}

/// Streaming server instance
pub struct Server {
    config: Config,
    listener: UnixListener,
    poll: Poll,
    shutdown: ShutdownHandle,
    next_conn_id: u64,
}

impl Server {
    /// Bind the listening socket, replacing any stale filesystem object at
    /// the socket path.
    pub fn bind(config: Config) -> io::Result<Self> {
        remove_stale_socket(&config.socket_path)?;

        let listener = create_listener(&config.socket_path, config.backlog)?;

        match Self::with_listener(config.clone(), listener) {
            Ok(server) => Ok(server),
            Err(e) => {
                let _ = fs::remove_file(&config.socket_path);
                Err(e)
            }
        }
    }

    fn with_listener(config: Config, listener: UnixListener) -> io::Result<Self> {
        if let Some(mode) = config.socket_mode {
            fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(mode))?;
        }

        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER_TOKEN,
            Interest::READABLE,
        )?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        info!(
            socket = %config.socket_path.display(),
            backlog = config.backlog,
            "Server listening"
        );

        Ok(Server {
            config,
            listener,
            poll,
            shutdown: ShutdownHandle {
                requested: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
            next_conn_id: 0,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept and serve connections until shutdown is requested.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(8);

        while !self.shutdown.is_requested() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => debug!("Accept loop woken"),
                    _ => {}
                }
            }
        }

        info!(served = self.next_conn_id, "Accept loop stopped");
        Ok(())
    }

    /// Serve every pending connection, one after another, until the backlog
    /// is empty.
    fn accept_connections(&mut self) {
        while !self.shutdown.is_requested() {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let conn_id = self.next_conn_id;
                    self.next_conn_id += 1;
                    self.serve(stream, conn_id);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Run one exchange on `stream`, then close it whatever happened.
    fn serve(&mut self, stream: UnixStream, conn_id: u64) {
        info!(conn = conn_id, "Client connected");
        let start = Instant::now();

        let result = stream
            .set_nonblocking(false)
            .and_then(|_| self.handle_connection(&stream, conn_id));
        if let Err(e) = result {
            if is_disconnect(&e) {
                debug!(conn = conn_id, error = %e, "Connection closed by client");
            } else {
                warn!(conn = conn_id, error = %e, "Connection error");
            }
        }

        let _ = stream.shutdown(Shutdown::Both);
        drop(stream);

        info!(
            conn = conn_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Client disconnected"
        );
    }

    fn handle_connection(&mut self, stream: &UnixStream, conn_id: u64) -> io::Result<()> {
        let mut reader = BufReader::new(stream);
        let mut writer = stream;

        let request = match http::read_request(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(conn = conn_id, "Client sent no request");
                return Ok(());
            }
            Err(RequestError::Io(e)) => return Err(e),
            Err(e) => {
                if let Some((code, reason)) = e.status() {
                    warn!(conn = conn_id, status = code, error = %e, "Rejected request");
                    http::write_error_response(&mut writer, code, reason)?;
                }
                return Ok(());
            }
        };

        let mut tail = match TailProcess::spawn(
            &self.config.tail_program,
            &self.config.tail_args,
            &self.config.tail_file,
        ) {
            Ok(tail) => tail,
            Err(e) => {
                error!(
                    conn = conn_id,
                    program = %self.config.tail_program,
                    error = %e,
                    "Failed to start follower"
                );
                info!(conn = conn_id, request = %request.request_line(), status = 500, "Request");
                return http::write_error_response(&mut writer, 500, "Internal Server Error");
            }
        };

        info!(
            conn = conn_id,
            request = %request.request_line(),
            agent = request.header("User-Agent").unwrap_or("-"),
            status = 200,
            "Request"
        );
        http::write_stream_head(&mut writer)?;
        debug!(conn = conn_id, pid = tail.id(), "Streaming follower output");

        let mut body = ChunkedWriter::new(writer);
        let end = relay(&mut self.poll, &self.shutdown, &mut tail, stream, &mut body);
        tail.stop();

        debug!(
            conn = conn_id,
            chunks = body.chunks_written(),
            bytes = body.bytes_written(),
            "Stream ended"
        );

        match end {
            RelayEnd::ClientGone(e) => {
                if is_disconnect(&e) {
                    info!(conn = conn_id, error = %e, "Connection closed by client");
                    Ok(())
                } else {
                    Err(e)
                }
            }
            RelayEnd::SourceExhausted => {
                debug!(conn = conn_id, "Follower output ended");
                body.finish()
            }
            RelayEnd::SourceFailed(e) => {
                warn!(conn = conn_id, error = %e, "Failed to read from follower");
                body.finish()
            }
            RelayEnd::Shutdown => {
                info!(conn = conn_id, "Stream interrupted by shutdown");
                body.finish()
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        match fs::remove_file(&self.config.socket_path) {
            Ok(()) => info!(socket = %self.config.socket_path.display(), "Removed socket"),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                socket = %self.config.socket_path.display(),
                error = %e,
                "Failed to remove socket"
            ),
        }
    }
}

/// Copy follower lines to the client, one chunk per line.
///
/// Waits on the follower's stdout and the client socket together. A client
/// that closes its end fully ends the relay; one that only shuts down its
/// write half keeps receiving lines.
fn relay<W: io::Write>(
    poll: &mut Poll,
    shutdown: &ShutdownHandle,
    tail: &mut TailProcess,
    client: &UnixStream,
    body: &mut ChunkedWriter<W>,
) -> RelayEnd {
    let client_fd = client.as_raw_fd();
    let tail_fd = tail.as_raw_fd();

    if let Err(e) = poll.registry().register(
        &mut SourceFd(&client_fd),
        CLIENT_TOKEN,
        Interest::READABLE | Interest::WRITABLE,
    ) {
        return RelayEnd::ClientGone(e);
    }
    if let Err(e) = poll.registry().register(
        &mut SourceFd(&tail_fd),
        FOLLOWER_TOKEN,
        Interest::READABLE,
    ) {
        let _ = poll.registry().deregister(&mut SourceFd(&client_fd));
        return RelayEnd::SourceFailed(e);
    }

    let end = relay_lines(poll, shutdown, tail, body);

    for fd in [client_fd, tail_fd] {
        if let Err(e) = poll.registry().deregister(&mut SourceFd(&fd)) {
            debug!(fd, error = %e, "Failed to deregister relay source");
        }
    }

    end
}

fn relay_lines<W: io::Write>(
    poll: &mut Poll,
    shutdown: &ShutdownHandle,
    tail: &mut TailProcess,
    body: &mut ChunkedWriter<W>,
) -> RelayEnd {
    let mut events = Events::with_capacity(8);

    loop {
        // Drain every line that is ready before waiting again.
        loop {
            if shutdown.is_requested() {
                return RelayEnd::Shutdown;
            }

            match tail.try_next_line() {
                Ok(Line::Ready(line)) => {
                    if let Err(e) = body.write_chunk(&line) {
                        return RelayEnd::ClientGone(e);
                    }
                }
                Ok(Line::Pending) => break,
                Ok(Line::Exhausted) => return RelayEnd::SourceExhausted,
                Err(e) => return RelayEnd::SourceFailed(e),
            }
        }

        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return RelayEnd::SourceFailed(e);
        }

        for event in events.iter() {
            match event.token() {
                CLIENT_TOKEN if event.is_write_closed() || event.is_error() => {
                    return RelayEnd::ClientGone(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "client closed the connection",
                    ));
                }
                WAKER_TOKEN => debug!("Relay woken"),
                // Pending accepts are picked up once this connection is done.
                _ => {}
            }
        }
    }
}

/// Remove whatever is left at the socket path from a previous run.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(socket = %path.display(), "Removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create a non-blocking Unix stream listener with an explicit backlog.
fn create_listener(path: &Path, backlog: i32) -> io::Result<UnixListener> {
    let socket = socket2::Socket::new(socket2::Domain::UNIX, socket2::Type::STREAM, None)?;

    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::unix(path)?)?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
