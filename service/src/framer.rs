//! Splits the raw input stream into newline terminated lines.
//!
//! The input descriptor is non-blocking. A read can come back short at any point, so the framer
//! keeps whatever it has not handed out yet and continues from there on the next call. Raw
//! payloads that some commands carry right after their text are read through the same buffer,
//! see `LineReader::following_data`.

use log::debug;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io::{self, Read};
use std::os::unix::io::AsFd;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("error while reading the input: {0}")]
    Io(#[from] io::Error),
    #[error("line exceeds the buffer capacity of {0} bytes")]
    LineTooLong(usize),
    #[error("premature EOF while reading data stream: got {got} of {expected} bytes")]
    Truncated { expected: usize, got: usize },
    #[error("payload of {len} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { len: usize, limit: usize },
}

/// How long `ByteSource::wait_readable` may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Forever,
    Immediate,
}

/// A descriptor the commands come from.
///
/// `read` reports the absence of data with `io::ErrorKind::WouldBlock` and a closed peer with
/// `Ok(0)`.
pub trait ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Returns `true` if a subsequent `read` won't block. End of file counts as readable.
    fn wait_readable(&mut self, wait: Wait) -> io::Result<bool>;
}

/// A `ByteSource` over a real descriptor: a pipe, a socket or the standard input.
pub struct FdSource<F> {
    inner: F,
}

impl<F: Read + AsFd> FdSource<F> {
    /// Wraps the descriptor and switches it to the non-blocking mode.
    pub fn new(inner: F) -> io::Result<Self> {
        set_nonblocking(&inner)?;
        Ok(Self { inner })
    }
}

impl<F: Read + AsFd> ByteSource for FdSource<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn wait_readable(&mut self, wait: Wait) -> io::Result<bool> {
        let timeout = match wait {
            Wait::Forever => PollTimeout::NONE,
            Wait::Immediate => PollTimeout::ZERO,
        };
        loop {
            let mut fds = [PollFd::new(self.inner.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                    return Ok(fds[0].revents().map_or(false, |r| r.intersects(ready)));
                }
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn set_nonblocking<F: AsFd>(fd: &F) -> io::Result<()> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// The outcome of `LineReader::next_line`.
#[derive(Debug, PartialEq, Eq)]
pub enum Framed<'a> {
    /// A complete line, including its trailing newline.
    Line(&'a [u8]),
    /// No complete line is available right now. Wait for the descriptor before trying again.
    Continue,
    /// The peer has closed the stream.
    EndOfFile,
}

enum Fill {
    /// The read filled all the free space.
    Full,
    /// The read returned less than asked for, possibly nothing.
    Short,
    EndOfFile,
}

/// Access to the raw bytes that follow a command, for the commands that announce them.
pub trait PayloadReader {
    fn following_data(&mut self, len: usize) -> Result<Vec<u8>, FrameError>;
}

pub struct LineReader<S> {
    source: S,
    buf: Box<[u8]>,
    /// The number of valid bytes in `buf`.
    fill: usize,
    /// The number of bytes already handed out. `mark <= fill <= buf.len()`.
    mark: usize,
    bytes_read: u64,
    payload_limit: usize,
}

impl<S: ByteSource> LineReader<S> {
    pub fn new(source: S, capacity: usize) -> Self {
        Self {
            source,
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            fill: 0,
            mark: 0,
            bytes_read: 0,
            payload_limit: usize::MAX,
        }
    }

    /// Caps the size of a raw payload `following_data` agrees to read.
    pub fn with_payload_limit(mut self, limit: usize) -> Self {
        self.payload_limit = limit;
        self
    }

    /// Returns the next line from the stream.
    pub fn next_line(&mut self) -> Result<Framed<'_>, FrameError> {
        self.reset_if_drained();
        let mut short = false;
        loop {
            if let Some(end) = self.find_newline() {
                let start = self.mark;
                self.mark = end;
                return Ok(Framed::Line(&self.buf[start..end]));
            }
            // Don't spin on a descriptor that just told us it has nothing more.
            if short {
                return Ok(Framed::Continue);
            }
            match self.refill()? {
                Fill::Full => {}
                Fill::Short => short = true,
                Fill::EndOfFile => return Ok(Framed::EndOfFile),
            }
        }
    }

    /// Is there a complete line that can be returned without touching the descriptor?
    pub fn has_line(&self) -> bool {
        self.find_newline().is_some()
    }

    /// The number of bytes received but not handed out yet.
    pub fn buffered(&self) -> usize {
        self.fill - self.mark
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn wait_readable(&mut self, wait: Wait) -> io::Result<bool> {
        self.source.wait_readable(wait)
    }

    /// Reads exactly `len` raw bytes that follow the last returned line.
    ///
    /// Bytes already sitting in the buffer are consumed first. Unlike `next_line` this does not
    /// return until all bytes are there: a command that announced a payload cannot proceed
    /// without it.
    ///
    /// A length over the payload limit is refused before anything is read or allocated.
    pub fn following_data(&mut self, len: usize) -> Result<Vec<u8>, FrameError> {
        if len > self.payload_limit {
            return Err(FrameError::PayloadTooLarge {
                len,
                limit: self.payload_limit,
            });
        }
        let buffered = self.buffered().min(len);
        let mut data = Vec::with_capacity(len);
        data.extend_from_slice(&self.buf[self.mark..self.mark + buffered]);
        self.mark += buffered;
        self.reset_if_drained();

        data.resize(len, 0);
        let mut got = buffered;
        while got < len {
            match self.source.read(&mut data[got..]) {
                Ok(0) => return Err(FrameError::Truncated { expected: len, got }),
                Ok(n) => {
                    got += n;
                    self.bytes_read += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.source.wait_readable(Wait::Forever)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        debug!("read {} bytes of following data ({} were buffered)", len, buffered);
        Ok(data)
    }

    fn find_newline(&self) -> Option<usize> {
        self.buf[self.mark..self.fill]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| self.mark + pos + 1)
    }

    fn reset_if_drained(&mut self) {
        if self.mark == self.fill {
            self.mark = 0;
            self.fill = 0;
        }
    }

    /// Moves the unconsumed bytes to the front and issues one read into the free space.
    fn refill(&mut self) -> Result<Fill, FrameError> {
        if self.mark > 0 {
            self.buf.copy_within(self.mark..self.fill, 0);
            self.fill -= self.mark;
            self.mark = 0;
        }
        let wanted = self.buf.len() - self.fill;
        if wanted == 0 {
            return Err(FrameError::LineTooLong(self.buf.len()));
        }
        loop {
            match self.source.read(&mut self.buf[self.fill..]) {
                Ok(0) => return Ok(Fill::EndOfFile),
                Ok(n) => {
                    self.fill += n;
                    self.bytes_read += n as u64;
                    return Ok(if n < wanted { Fill::Short } else { Fill::Full });
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::Short),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl<S: ByteSource> PayloadReader for LineReader<S> {
    fn following_data(&mut self, len: usize) -> Result<Vec<u8>, FrameError> {
        LineReader::following_data(self, len)
    }
}
