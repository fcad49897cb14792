use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::RefBlock;
use crate::source::Source;

pub const CLIENT_ACTIVE: u32 = 1 << 0;
pub const CLIENT_AUTHENTICATED: u32 = 1 << 1;
/// Producer allowed to take over a running mount.
pub const CLIENT_HIJACKER: u32 = 1 << 2;
/// Listener response buffer is chained with seeded intro blocks.
pub const CLIENT_HAS_INTRO_CONTENT: u32 = 1 << 3;
pub const CLIENT_HAS_MOVED: u32 = 1 << 4;
/// Relay slave connection, bypasses listener limits.
pub const CLIENT_IS_SLAVE: u32 = 1 << 5;
pub const CLIENT_IN_FSERVE: u32 = 1 << 6;

/// Non-blocking socket surface the core drives. Real connections are
/// wrapped outside the crate; ticks only ever issue zero-timeout calls.
pub trait ClientIo: Send {
    /// Zero-timeout readability poll. `Err` is a hard socket failure.
    fn poll_readable(&mut self) -> io::Result<bool>;
    /// Non-blocking read; `WouldBlock` when nothing is pending.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Non-blocking write of as much of `buf` as the socket accepts.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Cross-worker flags for a client. A client's bulk state is owned by
/// whichever worker currently runs it; other threads communicate only
/// through these atomics (and the owning worker folds them in at tick
/// boundaries).
#[derive(Debug, Default)]
pub struct ClientSignal {
    /// Run the client as soon as possible.
    pub wake: AtomicBool,
    /// Treat the connection as dead at the next tick.
    pub error: AtomicBool,
    /// Producer was replaced by a hijacker; detach without touching the
    /// source.
    pub deposed: AtomicBool,
    /// Restart stream position accounting (set on hijack).
    pub reset_pos: AtomicBool,
    /// Worker currently owning the client, for targeted wakeups.
    pub worker: AtomicUsize,
    /// Deadline the owning worker last scheduled, for drift checks.
    pub next_due_ms: AtomicU64,
    /// Byte count handed to a deposed producer for its access-log line.
    pub deposed_read_bytes: AtomicU64,
}

/// Request knobs the core consults (burst size etc). Parsing happened
/// upstream; keys are stored lower-cased.
#[derive(Debug, Default, Clone)]
pub struct RequestInfo {
    headers: BTreeMap<String, String>,
    query: BTreeMap<String, String>,
}

impl RequestInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(&name.to_lowercase()).map(String::as_str)
    }
}

#[derive(Debug)]
pub struct Connection {
    pub id: u64,
    pub ip: String,
    /// Seconds (engine clock) the connection was accepted.
    pub con_time: u64,
    /// Forced disconnect deadline in seconds; 0 = none.
    pub discon_time: u64,
    pub sent_bytes: u64,
    pub error: bool,
}

/// Which tick handler runs the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOps {
    /// Producer: sending the HTTP 200 handshake.
    SourceHttpSend,
    /// Producer: live read loop.
    SourceRead,
    /// Producer: mount drained, winding down / holding the reservation.
    SourceTerminate,
    /// Listener: live send loop.
    Listener,
    /// Listener: parked while an on-demand source restarts.
    ListenerPause,
    /// Listener: done with a sync step, waiting for the rest.
    ListenerWait,
    /// Listener: handed to the static file server.
    Fserve,
}

/// Which buffer-filling stage a listener is in. Each send pass
/// dispatches on this tag until the stage reports it cannot progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckBuffer {
    HttpHeaders,
    Intro,
    IntroFile,
    QueueAdvance,
    /// Draining a private buffer after detach.
    Write,
}

pub struct Client {
    pub connection: Connection,
    pub parser: RequestInfo,
    pub username: Option<String>,
    pub io: Box<dyn ClientIo>,
    pub signal: Arc<ClientSignal>,
    pub flags: u32,
    pub ops: ClientOps,
    pub check_buffer: CheckBuffer,
    pub refbuf: Option<Arc<RefBlock>>,
    pub pos: usize,
    /// Bytes of source timeline this client has been matched against.
    pub queue_pos: u64,
    /// Read offset into the intro file; -1 = not in intro replay.
    pub intro_offset: i64,
    pub respcode: u32,
    /// Absolute engine-ms deadline of the next tick.
    pub schedule_ms: u64,
    /// Engine-seconds anchor for state timeouts.
    pub timer_start: u64,
    pub source: Option<Arc<Source>>,
}

impl Client {
    pub fn new(id: u64, ip: impl Into<String>, io: Box<dyn ClientIo>, now_sec: u64) -> Self {
        Self {
            connection: Connection {
                id,
                ip: ip.into(),
                con_time: now_sec,
                discon_time: 0,
                sent_bytes: 0,
                error: false,
            },
            parser: RequestInfo::default(),
            username: None,
            io,
            signal: Arc::new(ClientSignal::default()),
            flags: 0,
            ops: ClientOps::Listener,
            check_buffer: CheckBuffer::HttpHeaders,
            refbuf: None,
            pos: 0,
            queue_pos: 0,
            intro_offset: 0,
            respcode: 0,
            schedule_ms: 0,
            timer_start: 0,
            source: None,
        }
    }

    pub fn has_flag(&self, mask: u32) -> bool {
        self.flags & mask != 0
    }

    pub fn set_flag(&mut self, mask: u32) {
        self.flags |= mask;
    }

    pub fn clear_flag(&mut self, mask: u32) {
        self.flags &= !mask;
    }

    pub fn set_queue(&mut self, block: Option<Arc<RefBlock>>) {
        self.refbuf = block;
        self.pos = 0;
    }

    /// Fold cross-thread signals into owned state at a tick boundary.
    pub fn fold_signals(&mut self) {
        if self.signal.error.load(Ordering::Acquire) {
            self.connection.error = true;
        }
        if self.signal.reset_pos.swap(false, Ordering::AcqRel) {
            self.queue_pos = 0;
            self.set_queue(None);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.connection.id)
            .field("ops", &self.ops)
            .field("check_buffer", &self.check_buffer)
            .field("schedule_ms", &self.schedule_ms)
            .finish()
    }
}

#[derive(Default)]
struct MemoryIoState {
    reads: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    write_quota: Option<usize>,
    broken: bool,
}

/// In-memory [`ClientIo`] for tests: scripted reads on one side, a
/// capturable write sink on the other. The handle stays with the test
/// while the io half moves into the client.
#[derive(Clone, Default)]
pub struct MemoryIoHandle {
    state: Arc<Mutex<MemoryIoState>>,
}

pub struct MemoryIo {
    state: Arc<Mutex<MemoryIoState>>,
}

impl MemoryIo {
    pub fn pair() -> (MemoryIo, MemoryIoHandle) {
        let handle = MemoryIoHandle::default();
        (
            MemoryIo {
                state: handle.state.clone(),
            },
            handle,
        )
    }
}

impl MemoryIoHandle {
    pub fn push_read(&self, data: impl Into<Vec<u8>>) {
        self.state.lock().reads.push_back(data.into());
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn written_len(&self) -> usize {
        self.state.lock().written.len()
    }

    /// Cap total accepted bytes; writes beyond it report `WouldBlock`.
    pub fn set_write_quota(&self, quota: usize) {
        self.state.lock().write_quota = Some(quota);
    }

    pub fn add_write_quota(&self, quota: usize) {
        let mut st = self.state.lock();
        if let Some(q) = st.write_quota.as_mut() {
            *q += quota;
        }
    }

    /// Make every subsequent call fail hard.
    pub fn break_pipe(&self) {
        self.state.lock().broken = true;
    }
}

impl ClientIo for MemoryIo {
    fn poll_readable(&mut self) -> io::Result<bool> {
        let st = self.state.lock();
        if st.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken"));
        }
        Ok(!st.reads.is_empty())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.state.lock();
        if st.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken"));
        }
        match st.reads.front_mut() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n == chunk.len() {
                    st.reads.pop_front();
                } else {
                    chunk.drain(..n);
                }
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no data")),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.state.lock();
        if st.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken"));
        }
        let room = match st.write_quota {
            Some(q) => {
                let used = st.written.len();
                q.saturating_sub(used)
            }
            None => buf.len(),
        };
        if room == 0 {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "quota"));
        }
        let n = room.min(buf.len());
        st.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_knobs_case_insensitive() {
        let r = RequestInfo::new()
            .with_header("Initial-Burst", "9000")
            .with_query("burst", "4000");
        assert_eq!(r.header("initial-burst"), Some("9000"));
        assert_eq!(r.query_param("BURST"), Some("4000"));
        assert_eq!(r.header("range"), None);
    }

    #[test]
    fn memory_io_scripts_reads_and_caps_writes() {
        let (mut io, handle) = MemoryIo::pair();
        handle.push_read(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 3];
        assert!(io.poll_readable().unwrap());
        assert_eq!(io.read(&mut buf).unwrap(), 3);
        assert_eq!(io.read(&mut buf).unwrap(), 1);
        assert!(io.read(&mut buf).is_err());

        handle.set_write_quota(2);
        assert_eq!(io.write(&[9, 9, 9]).unwrap(), 2);
        assert_eq!(
            io.write(&[9]).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        assert_eq!(handle.written(), vec![9, 9]);
    }

    #[test]
    fn signal_fold_marks_error_and_resets_position() {
        let (io, _) = MemoryIo::pair();
        let mut c = Client::new(7, "10.0.0.1", Box::new(io), 100);
        c.queue_pos = 500;
        c.signal.error.store(true, Ordering::Release);
        c.signal.reset_pos.store(true, Ordering::Release);
        c.fold_signals();
        assert!(c.connection.error);
        assert_eq!(c.queue_pos, 0);
        assert!(c.refbuf.is_none());
    }
}
