//! Client side of the control socket.
//!
//! A `Client` holds one session open. Requests are answered in order;
//! notifications that arrive while a response is awaited are queued and
//! handed out by [`Client::next_notification`].

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind as IoErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::protocol::{self, Incoming, Notification, Request, RequestId, Response, Verb};
use crate::rundir::RunDir;
use crate::schema::SchemaName;


pub struct Client {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
    partial: Vec<u8>,
    queued: VecDeque<Notification>,
    next_id: u64,
}


impl Client {
    /// Connect to a socket path. `timeout` bounds each response read;
    /// `None` blocks indefinitely.
    pub fn connect(socket: &Path, timeout: Option<Duration>) -> Result<Client> {
        let stream = UnixStream::connect(socket)
            .map_err(|e| ConfigError::Io(format!("cannot connect to {}: {}", socket.display(), e)))?;
        stream
            .set_read_timeout(timeout)
            .map_err(|e| ConfigError::Io(format!("cannot set timeout: {}", e)))?;
        let reader = stream
            .try_clone()
            .map_err(|e| ConfigError::Io(format!("cannot clone stream: {}", e)))?;
        Ok(Client {
            writer: stream,
            reader: BufReader::new(reader),
            partial: Vec::new(),
            queued: VecDeque::new(),
            next_id: 1,
        })
    }

    /// Connect to the leader `target` (a pid or a name) under `run_dir`.
    pub fn connect_target(run_dir: &RunDir, target: &str, timeout: Option<Duration>) -> Result<Client> {
        let socket = run_dir.resolve(target)?;
        Client::connect(&socket, timeout)
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.writer
            .set_read_timeout(timeout)
            .map_err(|e| ConfigError::Io(format!("cannot set timeout: {}", e)))
    }

    /// Negotiate the session schema. Must be the first request.
    pub fn hello(&mut self, schema: SchemaName) -> Result<Response> {
        self.request(Request::new(0, Verb::Hello).with_schema(schema.as_str()))
    }

    /// Send a request and wait for its response. The request's `id` is
    /// replaced with the next sequence number.
    pub fn request(&mut self, mut req: Request) -> Result<Response> {
        req.id = RequestId::Number(self.next_id);
        self.next_id += 1;
        let line = protocol::encode_line(&req)?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(|e| ConfigError::Io(format!("cannot send request: {}", e)))?;

        loop {
            match self.read_message()? {
                Some(Incoming::Response(resp)) if resp.id == req.id => return Ok(resp),
                Some(Incoming::Response(resp)) => {
                    debug!(expected = %req.id, got = %resp.id, "ignoring stray response");
                }
                Some(Incoming::Notification(n)) => self.queued.push_back(n),
                None => {
                    return Err(ConfigError::Io(format!(
                        "timed out waiting for response to request {}",
                        req.id
                    )))
                }
            }
        }
    }

    /// Subscribe this session to commits under `path`.
    pub fn listen(&mut self, path: &str) -> Result<Response> {
        self.request(Request::new(0, Verb::Listen).with_path(path))
    }

    /// The next pushed notification, or `None` if the read timeout passed
    /// without one.
    pub fn next_notification(&mut self) -> Result<Option<Notification>> {
        if let Some(n) = self.queued.pop_front() {
            return Ok(Some(n));
        }
        loop {
            match self.read_message()? {
                Some(Incoming::Notification(n)) => return Ok(Some(n)),
                Some(Incoming::Response(resp)) => {
                    debug!(id = %resp.id, "ignoring unsolicited response");
                }
                None => return Ok(None),
            }
        }
    }

    /// Read one line. `Ok(None)` on read timeout; a partially read line is
    /// kept for the next call.
    fn read_message(&mut self) -> Result<Option<Incoming>> {
        match self.reader.read_until(b'\n', &mut self.partial) {
            Ok(0) => Err(ConfigError::Io("connection closed by leader".into())),
            Ok(_) if self.partial.last() != Some(&b'\n') => {
                Err(ConfigError::Io("connection closed mid-message".into()))
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.partial).into_owned();
                self.partial.clear();
                protocol::decode_incoming(&line).map(Some)
            }
            Err(ref e) if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(ConfigError::Io(format!("cannot read from leader: {}", e))),
        }
    }
}


/// Wait for a socket to appear and accept a test connection.
///
/// Polls with backoff up to `timeout`.
pub fn wait_for_socket(socket: &Path, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut interval = Duration::from_millis(25);

    loop {
        if socket.exists() && UnixStream::connect(socket).is_ok() {
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(ConfigError::Io(format!(
                "timed out waiting for leader socket at {} ({}ms)",
                socket.display(),
                timeout.as_millis(),
            )));
        }

        std::thread::sleep(interval);
        // Exponential backoff capped at 200ms
        interval = std::cmp::min(interval * 2, Duration::from_millis(200));
    }
}


/// Split a printed counter container (`name value;` per line) into pairs.
pub fn parse_counters(text: &str) -> Vec<(String, u64)> {
    text.lines()
        .filter_map(|line| {
            let mut words = line.trim().trim_end_matches(';').split_whitespace();
            let name = words.next()?;
            let value = words.next()?.parse().ok()?;
            Some((name.to_string(), value))
        })
        .collect()
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
