//! Control socket: accepts connections and runs one session thread per
//! client.
//!
//! Wire format: newline-delimited JSON. Each session reads request lines,
//! answers each one in order, and, once it has issued `listen`, interleaves
//! notification lines between responses.

use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, Session};
use crate::error::{ConfigError, Result};
use crate::protocol::{self, Response};


/// Longest request line accepted before the session is dropped.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;


#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Read timeout on the stream; also bounds notification latency.
    pub poll: Duration,
    /// A partial request line older than this closes the session.
    pub request_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            poll: Duration::from_millis(20),
            request_timeout: Duration::from_millis(5_000),
        }
    }
}


/// Unix domain socket listener for the control protocol.
pub struct ServiceSocket {
    listener: UnixListener,
    path: PathBuf,
}


impl ServiceSocket {
    /// Bind a new Unix domain socket at the given path.
    /// Removes any stale socket file first.
    pub fn bind(path: &Path) -> Result<ServiceSocket> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                ConfigError::Io(format!("cannot remove stale socket {}: {}", path.display(), e))
            })?;
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| ConfigError::Io(format!("cannot bind socket {}: {}", path.display(), e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| ConfigError::Io(format!("cannot set non-blocking: {}", e)))?;
        info!(socket = %path.display(), "control socket bound");
        Ok(ServiceSocket {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept connections for up to `timeout`, spawning a session thread
    /// for each. Returns the spawned threads.
    pub fn accept_nonblocking(
        &self,
        dispatcher: &Arc<Dispatcher>,
        options: SessionOptions,
        stop: &Arc<AtomicBool>,
        timeout: Duration,
    ) -> Result<Vec<JoinHandle<()>>> {
        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_millis(5);
        let mut spawned = Vec::new();

        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let dispatcher = Arc::clone(dispatcher);
                    let stop = Arc::clone(stop);
                    let handle = thread::Builder::new()
                        .name("swconf-session".into())
                        .spawn(move || serve_connection(stream, &dispatcher, options, &stop))
                        .map_err(|e| ConfigError::Io(format!("cannot spawn session thread: {}", e)))?;
                    spawned.push(handle);
                }
                Err(ref e) if e.kind() == IoErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(spawned);
                    }
                    thread::sleep(poll_interval);
                }
                Err(e) => return Err(ConfigError::Io(format!("accept failed: {}", e))),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the socket file from disk.
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}


// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

/// Serve one client until it disconnects, stalls mid-request, or `stop`
/// is raised.
pub fn serve_connection(
    mut stream: UnixStream,
    dispatcher: &Dispatcher,
    options: SessionOptions,
    stop: &AtomicBool,
) {
    let mut session = Session::new();
    if let Err(e) = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(options.poll)))
    {
        warn!(error = %e, "cannot configure session stream");
        return;
    }
    debug!("session opened");

    let mut pending: Vec<u8> = Vec::new();
    let mut line_started: Option<Instant> = None;
    let mut chunk = [0u8; 4096];

    let reason = loop {
        if stop.load(Ordering::SeqCst) {
            break "daemon stopping";
        }
        if flush_notifications(&mut stream, &mut session).is_err() {
            break "write failed";
        }

        match stream.read(&mut chunk) {
            Ok(0) => break "peer closed",
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                line_started.get_or_insert_with(Instant::now);
                if pending.len() > MAX_LINE_BYTES && !pending.contains(&b'\n') {
                    break "request line too long";
                }
                let mut failed = false;
                let mut answered = 0usize;
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    answered += 1;
                    if answer(&mut stream, dispatcher, &mut session, &line).is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break "write failed";
                }
                // The stall clock runs from the start of the line still
                // pending, not from an already answered one.
                if pending.is_empty() {
                    line_started = None;
                } else if answered > 0 {
                    line_started = Some(Instant::now());
                }
            }
            Err(ref e) if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) => {
                if let Some(start) = line_started {
                    if start.elapsed() >= options.request_timeout {
                        warn!(bytes = pending.len(), "request stalled mid-line; closing session");
                        break "request timeout";
                    }
                }
            }
            Err(ref e) if e.kind() == IoErrorKind::Interrupted => {}
            Err(e) => {
                debug!(error = %e, "session read failed");
                break "read failed";
            }
        }
    };

    session.close();
    debug!(reason, "session closed");
}


/// Decode and dispatch one request line, writing the response.
fn answer(
    stream: &mut UnixStream,
    dispatcher: &Dispatcher,
    session: &mut Session,
    line: &[u8],
) -> std::io::Result<()> {
    let text = String::from_utf8_lossy(line);
    if text.trim().is_empty() {
        return Ok(());
    }
    let response = match protocol::decode_request(&text) {
        Ok(req) => dispatcher.handle(session, req),
        Err(e) => Response::error(protocol::salvage_id(&text), &e),
    };
    write_message(stream, &response)?;
    // Notifications for a commit made by this very request follow its
    // response.
    flush_notifications(stream, session)
}


fn flush_notifications(stream: &mut UnixStream, session: &mut Session) -> std::io::Result<()> {
    for note in session.drain_notifications() {
        write_message(stream, &note)?;
    }
    Ok(())
}


fn write_message<T: serde::Serialize>(stream: &mut UnixStream, msg: &T) -> std::io::Result<()> {
    let line = protocol::encode_line(msg)
        .map_err(|e| std::io::Error::new(IoErrorKind::InvalidData, e.to_string()))?;
    stream.write_all(line.as_bytes())?;
    stream.flush()
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_tree;
    use crate::instance::InstanceId;
    use crate::protocol::{decode_incoming, encode_line, Incoming, Request, RequestId, Verb};
    use crate::state::{CounterSet, CounterSource, StateAggregator};
    use crate::store::ConfigStore;
    use std::io::{BufRead, BufReader};

    struct NoInstances;

    impl CounterSource for NoInstances {
        fn counters(&self) -> Vec<(InstanceId, CounterSet)> {
            Vec::new()
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(ConfigStore::new(sample_tree())),
            Arc::new(StateAggregator::new(Arc::new(NoInstances))),
        ))
    }

    fn options() -> SessionOptions {
        SessionOptions {
            poll: Duration::from_millis(5),
            request_timeout: Duration::from_millis(100),
        }
    }

    /// Run a session over a socket pair; returns the client end.
    fn spawn_session(d: &Arc<Dispatcher>) -> (UnixStream, Arc<AtomicBool>, JoinHandle<()>) {
        let (client, server) = UnixStream::pair().unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let (d, s) = (Arc::clone(d), Arc::clone(&stop));
        let handle = thread::spawn(move || serve_connection(server, &d, options(), &s));
        (client, stop, handle)
    }

    fn send(client: &mut UnixStream, req: &Request) {
        client.write_all(encode_line(req).unwrap().as_bytes()).unwrap();
    }

    fn read_one(reader: &mut BufReader<UnixStream>) -> Incoming {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        decode_incoming(&line).unwrap()
    }

    fn expect_response(reader: &mut BufReader<UnixStream>) -> Response {
        match read_one(reader) {
            Incoming::Response(r) => r,
            other => panic!("expected response, got {:?}", other),
        }
    }

    // --- request/response ---

    #[test]
    fn answers_requests_in_order() {
        let d = dispatcher();
        let (mut client, stop, handle) = spawn_session(&d);
        let mut reader = BufReader::new(client.try_clone().unwrap());

        send(&mut client, &Request::new(1, Verb::Get).with_path("/softwire-config/name"));
        send(&mut client, &Request::new(2, Verb::Get).with_path("/softwire-config/bogus"));
        let first = expect_response(&mut reader);
        let second = expect_response(&mut reader);
        assert_eq!((first.id, first.value.as_deref()), (RequestId::Number(1), Some("lwaftr")));
        assert_eq!(second.id, RequestId::Number(2));
        assert!(second.status.starts_with("unknown-node"));

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn string_ids_are_echoed() {
        let d = dispatcher();
        let (mut client, stop, handle) = spawn_session(&d);
        let mut reader = BufReader::new(client.try_clone().unwrap());

        client
            .write_all(b"{ \"id\": \"0\", \"verb\": \"get\", \"path\": \"/softwire-config/name\" }\n")
            .unwrap();
        let resp = expect_response(&mut reader);
        assert_eq!(resp.id, RequestId::from("0"));
        assert_eq!(resp.value.as_deref(), Some("lwaftr"));

        client.write_all(b"{\"id\":\"bad-1\",\"verb\":\"explode\"}\n").unwrap();
        let resp = expect_response(&mut reader);
        assert_eq!(resp.id, RequestId::from("bad-1"));
        assert!(resp.status.starts_with("protocol-error"));

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn garbage_line_gets_protocol_error_and_session_survives() {
        let d = dispatcher();
        let (mut client, stop, handle) = spawn_session(&d);
        let mut reader = BufReader::new(client.try_clone().unwrap());

        client.write_all(b"not json\n").unwrap();
        let resp = expect_response(&mut reader);
        assert!(resp.status.starts_with("protocol-error"));

        send(&mut client, &Request::new(7, Verb::Get).with_path("/softwire-config/name"));
        assert!(expect_response(&mut reader).is_ok());

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn request_split_across_writes_is_reassembled() {
        let d = dispatcher();
        let (mut client, stop, handle) = spawn_session(&d);
        let mut reader = BufReader::new(client.try_clone().unwrap());

        let line = encode_line(&Request::new(3, Verb::Get).with_path("/softwire-config/name")).unwrap();
        let (a, b) = line.split_at(10);
        client.write_all(a.as_bytes()).unwrap();
        thread::sleep(Duration::from_millis(20));
        client.write_all(b.as_bytes()).unwrap();
        assert_eq!(expect_response(&mut reader).id, RequestId::Number(3));

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn stalled_partial_request_closes_session_without_mutation() {
        let d = dispatcher();
        let (mut client, _stop, handle) = spawn_session(&d);
        let seq = d.store().seq();

        client
            .write_all(br#"{"id":1,"verb":"set","path":"/softwire-config/name","value":"x""#)
            .unwrap();
        handle.join().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert_eq!(d.store().seq(), seq);
        assert_eq!(d.store().get("/softwire-config/name").unwrap(), "lwaftr");
    }

    #[test]
    fn pipelined_chunks_ending_mid_line_do_not_time_out() {
        let d = dispatcher();
        let (mut client, stop, handle) = spawn_session(&d);
        let mut reader = BufReader::new(client.try_clone().unwrap());

        let lines: Vec<String> = (1..=5)
            .map(|i| encode_line(&Request::new(i, Verb::Get).with_path("/softwire-config/name")).unwrap())
            .collect();
        let mut chunks = vec![lines[0][..10].to_string()];
        for pair in lines.windows(2) {
            chunks.push(format!("{}{}", &pair[0][10..], &pair[1][..10]));
        }
        chunks.push(lines[4][10..].to_string());

        // Each partial line is younger than the request timeout, but the
        // whole exchange takes longer than it.
        for chunk in &chunks {
            client.write_all(chunk.as_bytes()).unwrap();
            thread::sleep(Duration::from_millis(40));
        }
        for i in 1..=5 {
            let resp = expect_response(&mut reader);
            assert_eq!(resp.id, RequestId::Number(i));
            assert!(resp.is_ok());
        }

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn peer_close_ends_session() {
        let d = dispatcher();
        let (client, _stop, handle) = spawn_session(&d);
        drop(client);
        handle.join().unwrap();
    }

    // --- notifications ---

    #[test]
    fn listener_receives_notifications_between_responses() {
        let d = dispatcher();
        let (mut listener, stop_l, handle_l) = spawn_session(&d);
        let mut lreader = BufReader::new(listener.try_clone().unwrap());
        send(&mut listener, &Request::new(1, Verb::Listen).with_path("/softwire-config"));
        assert!(expect_response(&mut lreader).is_ok());

        let (mut writer, stop_w, handle_w) = spawn_session(&d);
        let mut wreader = BufReader::new(writer.try_clone().unwrap());
        send(
            &mut writer,
            &Request::new(1, Verb::Set)
                .with_path("/softwire-config/name")
                .with_value("renamed"),
        );
        assert!(expect_response(&mut wreader).is_ok());

        match read_one(&mut lreader) {
            Incoming::Notification(n) => {
                assert_eq!(n.verb, "set");
                assert_eq!(n.path, "/softwire-config/name");
                assert_eq!(n.value.as_deref(), Some("renamed"));
            }
            other => panic!("expected notification, got {:?}", other),
        }

        // The listening session still answers requests.
        send(&mut listener, &Request::new(2, Verb::Get).with_path("/softwire-config/name"));
        let resp = expect_response(&mut lreader);
        assert_eq!(resp.value.as_deref(), Some("renamed"));

        stop_l.store(true, Ordering::SeqCst);
        stop_w.store(true, Ordering::SeqCst);
        handle_l.join().unwrap();
        handle_w.join().unwrap();
    }

    // --- socket ---

    #[test]
    fn bind_replaces_stale_socket_and_accepts() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.sock");
        std::fs::write(&path, b"stale").unwrap();
        let sock = ServiceSocket::bind(&path).unwrap();

        let d = dispatcher();
        let stop = Arc::new(AtomicBool::new(false));
        let mut client = UnixStream::connect(&path).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let spawned = sock
            .accept_nonblocking(&d, options(), &stop, Duration::from_millis(50))
            .unwrap();
        assert_eq!(spawned.len(), 1);

        send(&mut client, &Request::new(1, Verb::Hello));
        let mut reader = BufReader::new(client.try_clone().unwrap());
        assert_eq!(expect_response(&mut reader).value.as_deref(), Some("snabb-softwire-v2"));

        stop.store(true, Ordering::SeqCst);
        for h in spawned {
            h.join().unwrap();
        }
        sock.cleanup();
        assert!(!path.exists());
    }
}
