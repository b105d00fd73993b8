//! In-memory broker speaking just enough of the line protocol for unit tests.

use std::collections::{HashSet, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// `reserve-with-timeout` with this many seconds makes the broker hang up.
pub(crate) const HANGUP_SECS: u64 = 4242;

#[derive(Default)]
struct Jobs {
    next_id: u64,
    ready: VecDeque<(u64, Vec<u8>)>,
    live: HashSet<u64>,
}

pub(crate) struct FakeBroker {
    addr: String,
    accepted: Arc<AtomicUsize>,
    uses: Arc<AtomicUsize>,
}

impl FakeBroker {
    pub(crate) fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let uses = Arc::new(AtomicUsize::new(0));
        let jobs = Arc::new(Mutex::new(Jobs::default()));

        {
            let accepted = accepted.clone();
            let uses = uses.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let jobs = jobs.clone();
                    let uses = uses.clone();
                    thread::spawn(move || {
                        let _ = serve(stream, jobs, uses);
                    });
                }
            });
        }

        FakeBroker { addr, accepted, uses }
    }

    /// An address nothing listens on.
    pub(crate) fn unused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").to_string()
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Number of `use` commands received across all connections.
    pub(crate) fn uses(&self) -> usize {
        self.uses.load(Ordering::SeqCst)
    }

    pub(crate) fn wait_accepted(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.accepted() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.accepted() >= count
    }
}

fn serve(stream: TcpStream, jobs: Arc<Mutex<Jobs>>, uses: Arc<AtomicUsize>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut watched: HashSet<String> = HashSet::from(["default".to_string()]);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let words: Vec<&str> = line.trim_end_matches("\r\n").split(' ').collect();
        let reply: Vec<u8> = match words.as_slice() {
            ["use", tube] => {
                uses.fetch_add(1, Ordering::SeqCst);
                format!("USING {tube}\r\n").into_bytes()
            }
            ["watch", tube] => {
                watched.insert(tube.to_string());
                format!("WATCHING {}\r\n", watched.len()).into_bytes()
            }
            ["put", _pri, _delay, _ttr, len] => {
                let len: usize = len.parse().unwrap_or(0);
                let mut body = vec![0u8; len + 2];
                reader.read_exact(&mut body)?;
                if &body[len..] != b"\r\n" {
                    b"EXPECTED_CRLF\r\n".to_vec()
                } else {
                    body.truncate(len);
                    let mut jobs = jobs.lock().unwrap();
                    jobs.next_id += 1;
                    let id = jobs.next_id;
                    jobs.ready.push_back((id, body));
                    jobs.live.insert(id);
                    format!("INSERTED {id}\r\n").into_bytes()
                }
            }
            ["delete", id] => {
                let id: u64 = id.parse().unwrap_or(0);
                let mut jobs = jobs.lock().unwrap();
                if jobs.live.remove(&id) {
                    jobs.ready.retain(|(ready, _)| *ready != id);
                    b"DELETED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                }
            }
            ["reserve-with-timeout", secs] => {
                if secs.parse::<u64>().ok() == Some(HANGUP_SECS) {
                    return Ok(());
                }
                match jobs.lock().unwrap().ready.pop_front() {
                    Some((id, body)) => {
                        let mut reply = format!("RESERVED {id} {}\r\n", body.len()).into_bytes();
                        reply.extend_from_slice(&body);
                        reply.extend_from_slice(b"\r\n");
                        reply
                    }
                    None => b"TIMED_OUT\r\n".to_vec(),
                }
            }
            _ => b"UNKNOWN_COMMAND\r\n".to_vec(),
        };
        writer.write_all(&reply)?;
        writer.flush()?;
    }
}
