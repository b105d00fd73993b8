//! # Protocol Connection
//!
//! Purpose: Own one broker TCP session, remember the selected tube, and run
//! one request/reply exchange at a time.
//!
//! ## Design Principles
//! 1. **Single Owner**: Methods take `&mut self`; no internal locking.
//! 2. **Whole-Frame Writes**: A request is encoded fully, then written once,
//!    so a reply is never read before the request has left.
//! 3. **Sticky Faults**: A network failure marks the connection unusable.
//!    A broker rejection is recorded but leaves it reusable.
//! 4. **Buffer Reuse**: Line and write buffers live on the connection.

use std::io::{self, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::error::{ClientError, ClientResult, Fault};
use crate::proto;

/// A reserved job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub body: Vec<u8>,
}

/// Single broker connection with reusable buffers.
pub struct Connection {
    // `None` once closed; dropping the reader releases the socket.
    reader: Option<BufReader<TcpStream>>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    using: Option<String>,
    last_used: Instant,
    fault: Fault,
}

impl Connection {
    /// Dials `addr` (`host:port`) with a bounded connect timeout.
    pub fn open(addr: &str, dial_timeout: Duration) -> ClientResult<Self> {
        let stream = connect_stream(addr, dial_timeout).map_err(|err| ClientError::network("dial", err))?;
        Self::from_stream(stream)
    }

    pub(crate) fn open_with(config: &PoolConfig, dial_timeout: Duration) -> ClientResult<Self> {
        let stream =
            connect_stream(&config.addr, dial_timeout).map_err(|err| ClientError::network("dial", err))?;
        let configure = || -> io::Result<()> {
            stream.set_read_timeout(config.read_timeout)?;
            stream.set_write_timeout(config.write_timeout)?;
            Ok(())
        };
        configure().map_err(|err| ClientError::network("dial", err))?;
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> ClientResult<Self> {
        // Disable Nagle to keep request latency low for small payloads.
        stream
            .set_nodelay(true)
            .map_err(|err| ClientError::network("dial", err))?;
        Ok(Connection {
            reader: Some(BufReader::new(stream)),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            using: None,
            last_used: Instant::now(),
            fault: Fault::None,
        })
    }

    /// Selects the tube subsequent puts go to. No-op if already selected.
    pub fn select_tube(&mut self, tube: &str) -> ClientResult<()> {
        if self.using.as_deref() == Some(tube) {
            return Ok(());
        }
        proto::validate_tube(tube)?;

        self.write_buf.clear();
        proto::encode_use(tube, &mut self.write_buf);
        let result = self.exchange("use").and_then(|line| {
            if proto::parse_using(line, tube) {
                Ok(())
            } else {
                Err(ClientError::broker("use", line))
            }
        });
        let result = self.record(result);
        if result.is_ok() {
            self.using = Some(tube.to_string());
        }
        result
    }

    /// Adds `tube` to the watch list. Returns the number of watched tubes.
    pub fn watch(&mut self, tube: &str) -> ClientResult<u64> {
        proto::validate_tube(tube)?;

        self.write_buf.clear();
        proto::encode_watch(tube, &mut self.write_buf);
        let result = self
            .exchange("watch")
            .and_then(|line| proto::parse_watching(line).ok_or_else(|| ClientError::broker("watch", line)));
        self.record(result)
    }

    /// Enqueues `body` into `tube`. Returns the broker-assigned job id.
    ///
    /// `delay` and `ttr` are sent with whole-second resolution.
    pub fn put(
        &mut self,
        tube: &str,
        body: &[u8],
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> ClientResult<u64> {
        self.select_tube(tube)?;

        self.write_buf.clear();
        proto::encode_put(priority, delay.as_secs(), ttr.as_secs(), body, &mut self.write_buf);
        let result = self
            .exchange("put")
            .and_then(|line| proto::parse_inserted(line).ok_or_else(|| ClientError::broker("put", line)));
        let result = self.record(result);
        if let Ok(id) = result {
            tracing::trace!(tube, id, bytes = body.len(), "job inserted");
        }
        result
    }

    /// Deletes a job by id.
    pub fn delete(&mut self, id: u64) -> ClientResult<()> {
        self.write_buf.clear();
        proto::encode_delete(id, &mut self.write_buf);
        let result = self.exchange("delete").and_then(|line| {
            if line == b"DELETED" {
                Ok(())
            } else {
                Err(ClientError::broker("delete", line))
            }
        });
        self.record(result)
    }

    /// Reserves a job from the watched tubes, waiting up to `timeout`
    /// (whole seconds) on the broker side.
    pub fn reserve_with_timeout(&mut self, timeout: Duration) -> ClientResult<Job> {
        self.write_buf.clear();
        proto::encode_reserve(timeout.as_secs(), &mut self.write_buf);
        let result = self.exchange("reserve").and_then(|line| {
            proto::parse_reserved(line).ok_or_else(|| ClientError::broker("reserve", line))
        });
        let result = match result {
            Ok((id, len)) => transport(&mut self.reader, self.fault, "reserve").and_then(|reader| {
                let body =
                    proto::read_body(reader, len).map_err(|err| ClientError::network("reserve", err))?;
                Ok(Job { id, body })
            }),
            Err(err) => Err(err),
        };
        self.record(result)
    }

    /// Releases the transport. Idempotent; ignores the fault state.
    pub fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            // Peer may already be gone; dropping the stream is what matters.
            let _ = reader.get_ref().shutdown(Shutdown::Both);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    /// Classification of the most recent failure.
    pub fn fault(&self) -> Fault {
        self.fault
    }

    /// Tube currently selected for puts.
    pub fn using(&self) -> Option<&str> {
        self.using.as_deref()
    }

    /// Time since the last successful exchange.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Clears a broker fault and refreshes the activity stamp.
    pub(crate) fn reset_for_reuse(&mut self) {
        if self.fault == Fault::Broker {
            self.fault = Fault::None;
        }
        self.last_used = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn mark_fault(&mut self, fault: Fault) {
        self.fault = fault;
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        if let Some(stamp) = self.last_used.checked_sub(by) {
            self.last_used = stamp;
        }
    }

    /// Writes `write_buf` as one unit and reads the reply line.
    fn exchange(&mut self, op: &'static str) -> ClientResult<&[u8]> {
        let reader = transport(&mut self.reader, self.fault, op)?;
        let stream = reader.get_mut();
        stream.write_all(&self.write_buf).map_err(|err| ClientError::network(op, err))?;
        stream.flush().map_err(|err| ClientError::network(op, err))?;
        proto::read_line(reader, &mut self.line_buf).map_err(|err| ClientError::network(op, err))?;
        Ok(&self.line_buf)
    }

    fn record<T>(&mut self, result: ClientResult<T>) -> ClientResult<T> {
        match &result {
            Ok(_) => {
                self.fault = Fault::None;
                self.last_used = Instant::now();
            }
            Err(err) => match err.fault() {
                Fault::Network => self.fault = Fault::Network,
                Fault::Broker => {
                    self.fault = Fault::Broker;
                    self.last_used = Instant::now();
                }
                Fault::None => {}
            },
        }
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("using", &self.using)
            .field("fault", &self.fault)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn transport<'a>(
    reader: &'a mut Option<BufReader<TcpStream>>,
    fault: Fault,
    op: &'static str,
) -> ClientResult<&'a mut BufReader<TcpStream>> {
    if fault == Fault::Network {
        return Err(ClientError::network(
            op,
            io::Error::new(io::ErrorKind::NotConnected, "connection tainted by earlier failure"),
        ));
    }
    reader.as_mut().ok_or_else(|| {
        ClientError::network(op, io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
    })
}

fn connect_stream(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for sock_addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&sock_addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("{addr} resolved to no addresses"))
    }))
}
