//! Absolute deadlines over a blocking `TcpStream`.
//!
//! Sockets only know relative timeouts, so before every read or write the
//! remaining time until the deadline is pushed down with
//! `set_read_timeout`/`set_write_timeout`. An expired deadline fails
//! immediately with `TimedOut` without touching the socket.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A shared, mutable absolute deadline. `None` means no deadline.
#[derive(Debug, Default)]
pub struct Deadline {
    at: Mutex<Option<Instant>>,
}

impl Deadline {
    pub fn set(&self, at: Option<Instant>) {
        *self.at.lock() = at;
    }

    pub fn get(&self) -> Option<Instant> {
        *self.at.lock()
    }

    /// Remaining time, `Ok(None)` for no deadline, `Err` once expired.
    pub fn remaining(&self) -> io::Result<Option<Duration>> {
        remaining_until(self.get())
    }
}

pub(crate) fn remaining_until(at: Option<Instant>) -> io::Result<Option<Duration>> {
    match at {
        None => Ok(None),
        Some(at) => {
            let now = Instant::now();
            if now >= at {
                Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"))
            } else {
                Ok(Some(at - now))
            }
        }
    }
}

/// Unix reports an expired `SO_RCVTIMEO` as `WouldBlock`; normalize it.
pub(crate) fn normalize_timeout(err: io::Error) -> io::Error {
    if err.kind() == io::ErrorKind::WouldBlock {
        io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")
    } else {
        err
    }
}

/// Read half of a connection, bound to the connection's read deadline.
#[derive(Debug)]
pub struct DeadlineReader {
    stream: TcpStream,
    deadline: Arc<Deadline>,
}

impl DeadlineReader {
    pub fn new(stream: TcpStream, deadline: Arc<Deadline>) -> Self {
        DeadlineReader { stream, deadline }
    }
}

impl Read for DeadlineReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.deadline.remaining()?;
        self.stream.set_read_timeout(timeout)?;
        self.stream.read(buf).map_err(normalize_timeout)
    }
}

/// Write `bytes` fully before `at`, or fail with `TimedOut`.
pub(crate) fn write_all_until(
    stream: &mut TcpStream,
    bytes: &[u8],
    at: Option<Instant>,
) -> io::Result<()> {
    let mut rest = bytes;
    while !rest.is_empty() {
        stream.set_write_timeout(remaining_until(at)?)?;
        match stream.write(rest) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => rest = &rest[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(normalize_timeout(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn expired_deadline_fails_without_blocking() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let deadline = Arc::new(Deadline::default());
        deadline.set(Some(Instant::now() - Duration::from_millis(1)));
        let mut reader = DeadlineReader::new(client, deadline);
        let err = reader.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn read_times_out_at_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let deadline = Arc::new(Deadline::default());
        let start = Instant::now();
        deadline.set(Some(start + Duration::from_millis(50)));
        let mut reader = DeadlineReader::new(client, deadline);
        let err = reader.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn cleared_deadline_reads_data() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        server.write_all(b"ok").unwrap();

        let deadline = Arc::new(Deadline::default());
        deadline.set(None);
        let mut reader = DeadlineReader::new(client, deadline);
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
    }
}
