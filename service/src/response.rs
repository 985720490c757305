//! Delivery of frames and error reports back to the client.
//!
//! Every message goes out as a header line followed by the payload:
//!
//! ```text
//! nv>image -type image -bytes 1234\n<1234 bytes>
//! ```
//!
//! There are two channels. `DirectChannel` writes on the calling thread. `QueuedChannel` hands
//! the message over to a dedicated writer thread, so a slow client never stalls the render
//! thread.

use atomic::Atomic;
use log::{debug, error, info};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::unix::io::AsFd;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to write a response: {0}")]
    Write(#[from] io::Error),
    #[error("the response writer has failed, the connection is broken")]
    Broken,
    #[error("the response channel is closed")]
    Closed,
    #[error("the response writer thread panicked")]
    WriterPanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Image,
    Legend,
    Error,
    Data,
    /// Acknowledges commands that did not produce a frame. Carries no payload.
    Ok,
    /// The version line sent once, before the first command. Written without a header.
    Greeting,
}

impl ResponseKind {
    fn tags(self) -> (&'static str, &'static str) {
        match self {
            ResponseKind::Image => ("image", "image"),
            ResponseKind::Legend => ("legend", "legend"),
            ResponseKind::Error => ("viserror", "error"),
            ResponseKind::Data => ("data", "data"),
            ResponseKind::Ok => ("ok", "ok"),
            ResponseKind::Greeting => ("", ""),
        }
    }
}

/// The bytes of a response and who is responsible for them.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Owned by the caller. Must be copied before it leaves the calling thread.
    Borrowed(&'a [u8]),
    /// Handed over to the channel.
    Owned(Vec<u8>),
}

impl<'a> Payload<'a> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Borrowed(bytes) => *bytes,
            Payload::Owned(bytes) => bytes.as_slice(),
        }
    }

    /// Copies a borrowed payload, moves an owned one.
    pub fn into_owned(self) -> Vec<u8> {
        match self {
            Payload::Borrowed(bytes) => bytes.to_vec(),
            Payload::Owned(bytes) => bytes,
        }
    }
}

#[derive(Debug)]
pub struct Response<'a> {
    kind: ResponseKind,
    payload: Payload<'a>,
    /// The number of commands executed when the response was produced.
    token: Option<u64>,
}

impl<'a> Response<'a> {
    pub fn new(kind: ResponseKind, payload: Payload<'a>) -> Self {
        Self {
            kind,
            payload,
            token: None,
        }
    }

    /// Tags the response with a command count, so the client can tell which command it is for.
    pub fn with_token(mut self, token: u64) -> Self {
        self.token = Some(token);
        self
    }

    pub fn token(&self) -> Option<u64> {
        self.token
    }

    pub fn borrowed(kind: ResponseKind, bytes: &'a [u8]) -> Self {
        Self::new(kind, Payload::Borrowed(bytes))
    }

    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    pub fn header(&self) -> String {
        let len = self.bytes().len();
        match (self.kind, self.token) {
            (ResponseKind::Greeting, _) => String::new(),
            (ResponseKind::Ok, token) => format!("nv>ok -token {}\n", token.unwrap_or(0)),
            (kind, Some(token)) => {
                let (tag, ty) = kind.tags();
                format!("nv>{} -type {} -token {} -bytes {}\n", tag, ty, token, len)
            }
            (kind, None) => {
                let (tag, ty) = kind.tags();
                format!("nv>{} -type {} -bytes {}\n", tag, ty, len)
            }
        }
    }

    pub fn into_owned(self) -> Response<'static> {
        Response {
            kind: self.kind,
            payload: Payload::Owned(self.payload.into_owned()),
            token: self.token,
        }
    }
}

impl Response<'static> {
    pub fn owned(kind: ResponseKind, bytes: Vec<u8>) -> Self {
        Self::new(kind, Payload::Owned(bytes))
    }

    pub fn image(bytes: Vec<u8>) -> Self {
        Self::owned(ResponseKind::Image, bytes)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::owned(ResponseKind::Error, text.into().into_bytes())
    }

    pub fn data(bytes: Vec<u8>) -> Self {
        Self::owned(ResponseKind::Data, bytes)
    }

    pub fn ack(token: u64) -> Self {
        Self::owned(ResponseKind::Ok, Vec::new()).with_token(token)
    }

    /// Tells the client that the server is up and which version it talks to.
    pub fn greeting() -> Self {
        let line = format!("vizserver {}\n", env!("CARGO_PKG_VERSION"));
        Self::owned(ResponseKind::Greeting, line.into_bytes())
    }
}

/// The way responses leave the process.
pub trait ResponseSink {
    /// Sends the response. Responses are delivered in the order of `send` calls.
    fn send(&mut self, response: Response<'_>) -> Result<(), ChannelError>;

    /// Delivers whatever is still pending and releases the channel.
    fn shutdown(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct,
    Queued,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Strategy::Direct),
            "queued" => Ok(Strategy::Queued),
            other => Err(format!("unknown response mode {:?}", other)),
        }
    }
}

/// Opens a channel of the given kind over `out`.
pub fn open<W: Write + Send + 'static>(
    strategy: Strategy,
    out: W,
) -> Result<Box<dyn ResponseSink>, ChannelError> {
    Ok(match strategy {
        Strategy::Direct => Box::new(DirectChannel::new(out)),
        Strategy::Queued => Box::new(QueuedChannel::start(out)?),
    })
}

/// Writes all of `bytes`, retrying after partial writes.
///
/// `out` is expected to block when the peer is slow. A non-blocking descriptor has to be wrapped
/// into `FdSink` first.
fn write_fully<W: Write>(out: &mut W, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        match out.write(bytes) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "the peer doesn't accept any more data",
                ))
            }
            Ok(n) => bytes = &bytes[n..],
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// An output descriptor that may be in the non-blocking mode, e.g. because it shares the open
/// file with the input. Writes that would block wait for the descriptor to drain instead.
pub struct FdSink<F> {
    inner: F,
}

impl<F: Write + AsFd> FdSink<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }

    fn wait_writable(&self) -> io::Result<()> {
        loop {
            let mut fds = [PollFd::new(self.inner.as_fd(), PollFlags::POLLOUT)];
            match poll(&mut fds, PollTimeout::NONE) {
                // Errors and hang ups are reported by the next write.
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl<F: Write + AsFd> Write for FdSink<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.inner.write(buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => self.wait_writable()?,
                other => return other,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        loop {
            match self.inner.flush() {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => self.wait_writable()?,
                other => return other,
            }
        }
    }
}

fn write_response<W: Write>(out: &mut W, response: &Response<'_>) -> io::Result<()> {
    write_fully(out, response.header().as_bytes())?;
    write_fully(out, response.bytes())?;
    out.flush()
}

pub struct DirectChannel<W> {
    out: W,
    broken: bool,
}

impl<W: Write> DirectChannel<W> {
    pub fn new(out: W) -> Self {
        Self { out, broken: false }
    }
}

impl<W: Write> ResponseSink for DirectChannel<W> {
    fn send(&mut self, response: Response<'_>) -> Result<(), ChannelError> {
        if self.broken {
            return Err(ChannelError::Broken);
        }
        if let Err(err) = write_response(&mut self.out, &response) {
            error!("failed to write {:?} response: {}", response.kind(), err);
            self.broken = true;
            return Err(err.into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterStatus {
    Running,
    /// A write has failed. Everything that was queued is dropped.
    Broken,
    Stopped,
}

#[derive(Default)]
struct Queue {
    items: VecDeque<Response<'static>>,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
    status: Atomic<WriterStatus>,
}

impl Shared {
    // A panic while holding the lock can't leave the queue half updated.
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> WriterStatus {
        self.status.load(atomic::Ordering::SeqCst)
    }

    /// Blocks until there is something to write. `None` means the queue is closed and drained.
    fn next(&self) -> Option<Response<'static>> {
        let mut queue = self.lock();
        while queue.items.is_empty() && !queue.closed {
            queue = self
                .ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
        queue.items.pop_front()
    }
}

pub struct QueuedChannel {
    shared: Arc<Shared>,
    writer: Option<thread::JoinHandle<()>>,
}

impl QueuedChannel {
    pub fn start<W: Write + Send + 'static>(out: W) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
            status: Atomic::new(WriterStatus::Running),
        });
        let writer = thread::Builder::new()
            .name("response-writer".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || writer_loop(&shared, out)
            })?;
        Ok(Self {
            shared,
            writer: Some(writer),
        })
    }

    pub fn status(&self) -> WriterStatus {
        self.shared.status()
    }

    /// The number of responses waiting for the writer.
    pub fn pending(&self) -> usize {
        self.shared.lock().items.len()
    }
}

impl ResponseSink for QueuedChannel {
    fn send(&mut self, response: Response<'_>) -> Result<(), ChannelError> {
        match self.shared.status() {
            WriterStatus::Running => {}
            WriterStatus::Broken => return Err(ChannelError::Broken),
            WriterStatus::Stopped => return Err(ChannelError::Closed),
        }
        // The payload crosses the thread boundary here, so a borrowed one gets copied.
        let response = response.into_owned();
        {
            let mut queue = self.shared.lock();
            if queue.closed {
                return Err(ChannelError::Closed);
            }
            queue.items.push_back(response);
        }
        self.shared.ready.notify_one();
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), ChannelError> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => return Ok(()),
        };
        self.shared.lock().closed = true;
        self.shared.ready.notify_all();
        if writer.join().is_err() {
            return Err(ChannelError::WriterPanicked);
        }
        match self.shared.status() {
            WriterStatus::Broken => Err(ChannelError::Broken),
            _ => Ok(()),
        }
    }
}

impl Drop for QueuedChannel {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            debug!("response channel dropped: {}", err);
        }
    }
}

fn writer_loop<W: Write>(shared: &Shared, mut out: W) {
    let mut written = 0u64;
    while let Some(response) = shared.next() {
        if let Err(err) = write_response(&mut out, &response) {
            error!(
                "failed to write {:?} response after {} responses: {}",
                response.kind(),
                written,
                err
            );
            shared.status.store(WriterStatus::Broken, atomic::Ordering::SeqCst);
            let mut queue = shared.lock();
            queue.closed = true;
            if !queue.items.is_empty() {
                info!("discarding {} queued responses", queue.items.len());
                queue.items.clear();
            }
            return;
        }
        written += 1;
    }
    shared.status.store(WriterStatus::Stopped, atomic::Ordering::SeqCst);
    debug!("response writer finished after {} responses", written);
}
