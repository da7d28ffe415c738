//! Connections, receive buffering, and the pending-transmit timestamp ring.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io::IoSlice;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;

use phloem_transport::{Event, Interest, Multiplexer, RecvOutcome, SocketProfile, TcpSock, Timestamp};

use crate::proto::{AppProtocol, Consumed, Request, MAX_REQUEST_SEGMENTS};
use crate::{Error, Result};

/// Receive buffer size per connection
pub const MAX_PAYLOAD: usize = 16 * 1024;

/// In-flight request cap per connection, also the timestamp ring capacity
pub const MAX_PENDING_REQS: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
struct PendingTx {
    time: Option<Timestamp>,
    opt_id: u32,
}

/// `lhs` comes after `rhs` in wrapping byte-counter order. The stream byte
/// counter wraps every 4 GiB, so plain ordering would misclassify deliveries
/// on long-lived connections.
fn counter_after(lhs: u32, rhs: u32) -> bool {
    lhs.wrapping_sub(rhs) as i32 > 0
}

/// Fixed-capacity FIFO correlating sends with their transmit timestamps.
///
/// Three cursors walk the ring: `head` (sends recorded), `tail` (timestamps
/// attached), `consumed` (samples handed out), with
/// `consumed <= tail <= head` throughout. Software-timestamped sends attach
/// immediately; NIC-timestamped sends attach later when the error queue
/// delivers.
#[derive(Debug, Default)]
pub struct TxTimestampRing {
    slots: [PendingTx; MAX_PENDING_REQS],
    head: u64,
    tail: u64,
    consumed: u64,
    tx_byte_counter: u32,
}

impl TxTimestampRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a send whose timestamp will arrive later, keyed by the stream
    /// byte counter the kernel tags error-queue messages with.
    pub fn add_pending(&mut self, bytes: u32) {
        self.tx_byte_counter = self.tx_byte_counter.wrapping_add(bytes);
        let slot = (self.head as usize) % MAX_PENDING_REQS;
        self.slots[slot] = PendingTx { time: None, opt_id: self.tx_byte_counter };
        self.head += 1;
    }

    /// Record a send with its timestamp already known, immediately poppable.
    pub fn push_complete(&mut self, ts: Timestamp) {
        let slot = (self.tail as usize) % MAX_PENDING_REQS;
        self.slots[slot] = PendingTx { time: Some(ts), opt_id: 0 };
        self.head += 1;
        self.tail += 1;
    }

    /// Hand out the oldest unconsumed timestamp, or `None` when none is
    /// available yet.
    pub fn pop(&mut self) -> Option<Timestamp> {
        if self.consumed < self.tail {
            let t = self.slots[(self.consumed as usize) % MAX_PENDING_REQS].time;
            self.consumed += 1;
            t
        } else {
            None
        }
    }

    /// Skip `n` entries without handing them out.
    ///
    /// When the kernel coalesces a batch of responses into one read, only
    /// the last of them is attributed a latency; the first n-1 pending
    /// entries are passed over.
    pub fn blind_skip(&mut self, n: u64) {
        self.consumed += n;
    }

    /// Attach an error-queue timestamp to the oldest pending entry.
    ///
    /// `opt_id` is the kernel's byte counter for the last byte covered. One
    /// NIC timestamp can cover several coalesced sends, so subsequent
    /// entries whose counters fall inside the covered range inherit the same
    /// timestamp. Returns the timestamps attached (empty when the message
    /// was stale or nothing was pending).
    pub fn complete_with(&mut self, ts: Timestamp, opt_id: u32) -> Vec<Timestamp> {
        let mut attached = Vec::new();
        if self.tail == self.head {
            return attached;
        }

        let expected = self.slots[(self.tail as usize) % MAX_PENDING_REQS].opt_id;
        if counter_after(expected, opt_id.wrapping_add(1)) {
            // Stale delivery for a send already passed over
            return attached;
        }

        loop {
            let slot = (self.tail as usize) % MAX_PENDING_REQS;
            self.slots[slot].time = Some(ts);
            self.tail += 1;
            attached.push(ts);

            if self.tail == self.head {
                break;
            }
            let next = self.slots[(self.tail as usize) % MAX_PENDING_REQS].opt_id;
            if counter_after(next, opt_id.wrapping_add(1)) {
                break;
            }
        }
        attached
    }

    /// Sends still waiting for a timestamp.
    pub fn awaiting_timestamp(&self) -> u64 {
        self.head - self.tail
    }

    /// Timestamped entries not yet handed out.
    pub fn ready(&self) -> u64 {
        self.tail.saturating_sub(self.consumed)
    }
}

/// One open connection with its receive buffer and in-flight accounting.
#[derive(Debug)]
pub struct Connection {
    sock: TcpSock,
    buffer: Vec<u8>,
    cursor: usize,
    pending_reqs: usize,
    closed: bool,
    pub tx_ring: TxTimestampRing,
}

impl Connection {
    pub fn open(addr: SocketAddr, profile: &SocketProfile) -> Result<Self> {
        let sock = TcpSock::connect(addr, profile)?;
        Ok(Self {
            sock,
            buffer: vec![0u8; MAX_PAYLOAD],
            cursor: 0,
            pending_reqs: 0,
            closed: false,
            tx_ring: TxTimestampRing::new(),
        })
    }

    /// Scatter-gather send of a full request. Anything short of the full
    /// byte count is a connection failure: the open-loop modes size their
    /// kernel buffers so a due send either fits or the run is invalid.
    pub fn send(&mut self, request: &Request) -> Result<usize> {
        if request.segment_count() > MAX_REQUEST_SEGMENTS {
            return Err(Error::Protocol(format!(
                "request has {} segments, limit is {}",
                request.segment_count(),
                MAX_REQUEST_SEGMENTS
            )));
        }

        let iovs: Vec<IoSlice<'_>> =
            request.segments().iter().map(|s| IoSlice::new(s)).collect();
        let wanted = request.total_bytes();
        let written = self.sock.send_vectored(&iovs)?;
        if written != wanted {
            return Err(Error::Connection(format!(
                "short write to {}: {} of {} bytes",
                self.sock.peer(),
                written,
                wanted
            )));
        }
        self.pending_reqs += 1;
        Ok(written)
    }

    /// Pull available bytes into the receive buffer.
    pub fn recv(&mut self) -> Result<RecvOutcome> {
        if self.cursor == self.buffer.len() {
            return Err(Error::Protocol(
                "receive buffer full without a complete response".to_string(),
            ));
        }
        let outcome = self.sock.recv_into(&mut self.buffer[self.cursor..])?;
        if let RecvOutcome::Data(n) = outcome {
            self.cursor += n;
        }
        Ok(outcome)
    }

    /// Pull available bytes plus the packet's RX hardware timestamp.
    #[cfg(target_os = "linux")]
    pub fn recv_with_timestamp(&mut self) -> Result<(RecvOutcome, Option<Timestamp>)> {
        if self.cursor == self.buffer.len() {
            return Err(Error::Protocol(
                "receive buffer full without a complete response".to_string(),
            ));
        }
        let (outcome, ts) = self.sock.recv_with_timestamp(&mut self.buffer[self.cursor..])?;
        if let RecvOutcome::Data(n) = outcome {
            self.cursor += n;
        }
        Ok((outcome, ts))
    }

    /// Run the protocol decoder over the buffered bytes and compact.
    ///
    /// A decoder claiming more bytes than are buffered has lost framing
    /// sync, which is fatal. Unconsumed bytes shift to the buffer front and
    /// wait for the rest of their response.
    pub fn consume(&mut self, proto: &mut dyn AppProtocol) -> Result<Consumed> {
        let consumed = proto.consume_response(&self.buffer[..self.cursor])?;
        if consumed.bytes > self.cursor {
            return Err(Error::Protocol(format!(
                "decoder consumed {} bytes but only {} were buffered",
                consumed.bytes, self.cursor
            )));
        }

        if consumed.bytes == self.cursor {
            self.cursor = 0;
        } else if consumed.bytes > 0 {
            self.buffer.copy_within(consumed.bytes..self.cursor, 0);
            self.cursor -= consumed.bytes;
        }

        self.pending_reqs = self.pending_reqs.saturating_sub(consumed.reqs);
        Ok(consumed)
    }

    /// Poll the socket error queue for TX timestamps and feed the ring.
    /// Returns the newly attached timestamps.
    #[cfg(target_os = "linux")]
    pub fn harvest_tx_timestamps(&mut self) -> Result<Vec<Timestamp>> {
        match self.sock.poll_tx_timestamp()? {
            Some((ts, opt_id)) => Ok(self.tx_ring.complete_with(ts, opt_id)),
            None => Ok(Vec::new()),
        }
    }

    pub fn close(&mut self) {
        self.sock.shutdown();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_reqs(&self) -> usize {
        self.pending_reqs
    }

    pub fn has_capacity(&self) -> bool {
        !self.closed && self.pending_reqs < MAX_PENDING_REQS
    }

    pub fn buffered(&self) -> usize {
        self.cursor
    }
}

/// The per-worker connection set plus its readiness multiplexer.
#[derive(Debug)]
pub struct ConnectionPool {
    conns: Vec<Connection>,
    mux: Option<Multiplexer>,
    rng: SmallRng,
}

impl ConnectionPool {
    /// Open `count` connections round-robined over `targets`. Non-blocking
    /// profiles get registered with a multiplexer; the blocking latency
    /// profile runs without one.
    pub fn open(
        targets: &[SocketAddr],
        count: usize,
        profile: &SocketProfile,
        seed: Option<u64>,
    ) -> Result<Self> {
        if targets.is_empty() {
            return Err(Error::Config("no targets given".to_string()));
        }

        let mut mux = if profile.nonblocking { Some(Multiplexer::new()?) } else { None };

        let mut conns = Vec::with_capacity(count);
        for i in 0..count {
            let addr = targets[i % targets.len()];
            let conn = Connection::open(addr, profile)?;
            if let Some(m) = mux.as_mut() {
                m.register(conn.sock.as_raw_fd(), i, Interest::READABLE)?;
            }
            conns.push(conn);
        }

        let rng = match seed {
            Some(s) => SmallRng::seed_from_u64(s),
            None => SmallRng::from_os_rng(),
        };

        Ok(Self { conns, mux, rng })
    }

    /// Pick a connection with in-flight capacity by random probing.
    ///
    /// Ten probes, then give up; the caller skips the send for this tick.
    pub fn pick(&mut self) -> Option<usize> {
        for _ in 0..10 {
            let idx = self.rng.random_range(0..self.conns.len());
            if self.conns[idx].has_capacity() {
                return Some(idx);
            }
        }
        None
    }

    pub fn poll(&mut self, timeout: Option<std::time::Duration>) -> Result<Vec<Event>> {
        match self.mux.as_mut() {
            Some(m) => Ok(m.wait(timeout)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn poll_one(&mut self, timeout: Option<std::time::Duration>) -> Result<Option<Event>> {
        match self.mux.as_mut() {
            Some(m) => Ok(m.wait_one(timeout)?),
            None => Ok(None),
        }
    }

    /// Tear down one connection and drop it from the readiness set.
    pub fn close(&mut self, idx: usize) -> Result<()> {
        let conn = &mut self.conns[idx];
        if let Some(m) = self.mux.as_mut() {
            m.deregister(conn.sock.as_raw_fd())?;
        }
        conn.close();
        Ok(())
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Connection {
        &mut self.conns[idx]
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.conns.iter().filter(|c| !c.is_closed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            while let Ok((mut socket, _)) = listener.accept() {
                thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    loop {
                        let n = socket.read(&mut buf).unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        socket.write_all(&buf[..n]).unwrap();
                    }
                });
            }
        });
        addr
    }

    struct FrameDecoder {
        frame: usize,
    }

    impl AppProtocol for FrameDecoder {
        fn build_request(&mut self) -> Request {
            Request::single(vec![b'#'; self.frame])
        }

        fn consume_response(&mut self, buf: &[u8]) -> Result<Consumed> {
            let reqs = buf.len() / self.frame;
            Ok(Consumed { reqs, bytes: reqs * self.frame })
        }

        fn name(&self) -> &'static str {
            "frame"
        }
    }

    #[test]
    fn ring_is_fifo_with_software_timestamps() {
        let mut ring = TxTimestampRing::new();
        assert!(ring.pop().is_none());

        let t1 = Timestamp::from_hardware(1, 0);
        let t2 = Timestamp::from_hardware(2, 0);
        let t3 = Timestamp::from_hardware(3, 0);
        ring.push_complete(t1);
        ring.push_complete(t2);
        ring.push_complete(t3);
        assert_eq!(ring.ready(), 3);

        assert_eq!(ring.pop(), Some(t1));
        assert_eq!(ring.pop(), Some(t2));
        assert_eq!(ring.pop(), Some(t3));
        assert!(ring.pop().is_none());
    }

    #[test]
    fn ring_pending_entries_are_not_poppable() {
        let mut ring = TxTimestampRing::new();
        ring.add_pending(64);
        ring.add_pending(64);

        assert_eq!(ring.awaiting_timestamp(), 2);
        assert_eq!(ring.ready(), 0);
        assert!(ring.pop().is_none());
    }

    #[test]
    fn ring_correlates_errqueue_timestamps() {
        let mut ring = TxTimestampRing::new();
        ring.add_pending(100); // counter 100
        ring.add_pending(100); // counter 200

        let ts = Timestamp::from_hardware(5, 0);
        // Kernel reports the counter of the last byte, hence counter - 1
        let attached = ring.complete_with(ts, 99);
        assert_eq!(attached.len(), 1);
        assert_eq!(ring.pop(), Some(ts));
        assert!(ring.pop().is_none());
    }

    #[test]
    fn ring_propagates_coalesced_timestamp() {
        let mut ring = TxTimestampRing::new();
        ring.add_pending(100); // counter 100
        ring.add_pending(100); // counter 200
        ring.add_pending(100); // counter 300

        // One timestamp covering the first two sends
        let ts = Timestamp::from_hardware(7, 0);
        let attached = ring.complete_with(ts, 199);
        assert_eq!(attached.len(), 2);
        assert_eq!(ring.awaiting_timestamp(), 1);
        assert_eq!(ring.pop(), Some(ts));
        assert_eq!(ring.pop(), Some(ts));
        assert!(ring.pop().is_none());
    }

    #[test]
    fn ring_ignores_stale_timestamp() {
        let mut ring = TxTimestampRing::new();
        ring.add_pending(100);
        ring.add_pending(100); // counter 200
        ring.blind_skip(1);

        let ts = Timestamp::from_hardware(9, 0);
        // Report for bytes long past: first pending entry expects 100
        assert!(ring.complete_with(ts, 10).is_empty());
        assert_eq!(ring.awaiting_timestamp(), 2);
    }

    #[test]
    fn ring_correlates_across_counter_wrap() {
        let mut ring = TxTimestampRing::new();
        ring.tx_byte_counter = u32::MAX - 50;
        ring.add_pending(100); // counter wraps to 49

        // A report for bytes sent long before the wrap is stale, even
        // though its counter is numerically larger
        let stale = Timestamp::from_hardware(1, 0);
        assert!(ring.complete_with(stale, u32::MAX - 60).is_empty());
        assert_eq!(ring.awaiting_timestamp(), 1);

        // The wrapped counter still matches its own send
        let ts = Timestamp::from_hardware(2, 0);
        assert_eq!(ring.complete_with(ts, 48).len(), 1);
        assert_eq!(ring.pop(), Some(ts));
    }

    #[test]
    fn blind_skip_passes_over_batch() {
        let mut ring = TxTimestampRing::new();
        let t1 = Timestamp::from_hardware(1, 0);
        let t2 = Timestamp::from_hardware(2, 0);
        let t3 = Timestamp::from_hardware(3, 0);
        ring.push_complete(t1);
        ring.push_complete(t2);
        ring.push_complete(t3);

        // Three responses in one read: only the last gets attributed
        ring.blind_skip(2);
        assert_eq!(ring.pop(), Some(t3));
        assert!(ring.pop().is_none());
    }

    #[test]
    fn compaction_preserves_partial_response() {
        let addr = spawn_echo_server();
        thread::sleep(Duration::from_millis(10));

        let mut conn = Connection::open(addr, &SocketProfile::latency()).unwrap();
        let mut proto = FrameDecoder { frame: 8 };

        // 20 bytes: two full 8-byte frames plus 4 leftover
        let mut req = Request::single(vec![b'a'; 8]);
        req.push_segment(vec![b'b'; 8]);
        req.push_segment(vec![b'c'; 4]);
        conn.send(&req).unwrap();

        let mut got = 0;
        while got < 20 {
            match conn.recv().unwrap() {
                RecvOutcome::Data(_) => got = conn.buffered(),
                RecvOutcome::WouldBlock => continue,
                RecvOutcome::Closed => panic!("peer closed"),
            }
        }

        let consumed = conn.consume(&mut proto).unwrap();
        assert_eq!(consumed.reqs, 2);
        assert_eq!(consumed.bytes, 16);
        assert_eq!(conn.buffered(), 4);
        assert_eq!(&conn.buffer[..4], b"cccc");
    }

    #[test]
    fn over_consumption_is_fatal() {
        struct Greedy;
        impl AppProtocol for Greedy {
            fn build_request(&mut self) -> Request {
                Request::single(vec![0])
            }
            fn consume_response(&mut self, buf: &[u8]) -> Result<Consumed> {
                Ok(Consumed { reqs: 1, bytes: buf.len() + 1 })
            }
            fn name(&self) -> &'static str {
                "greedy"
            }
        }

        let addr = spawn_echo_server();
        thread::sleep(Duration::from_millis(10));

        let mut conn = Connection::open(addr, &SocketProfile::latency()).unwrap();
        conn.send(&Request::single(vec![b'x'; 4])).unwrap();
        while conn.buffered() < 4 {
            conn.recv().unwrap();
        }

        assert!(matches!(conn.consume(&mut Greedy), Err(Error::Protocol(_))));
    }

    #[test]
    fn pick_skips_saturated_connections() {
        let addr = spawn_echo_server();
        thread::sleep(Duration::from_millis(10));

        let mut pool =
            ConnectionPool::open(&[addr], 4, &SocketProfile::open_loop(), Some(3)).unwrap();

        // Saturate all but connection 2
        for idx in [0, 1, 3] {
            pool.conns[idx].pending_reqs = MAX_PENDING_REQS;
        }
        for _ in 0..20 {
            assert_eq!(pool.pick(), Some(2));
        }

        pool.conns[2].pending_reqs = MAX_PENDING_REQS;
        assert_eq!(pool.pick(), None);
    }

    #[test]
    fn oversized_segment_list_is_rejected() {
        let addr = spawn_echo_server();
        thread::sleep(Duration::from_millis(10));

        let mut conn = Connection::open(addr, &SocketProfile::latency()).unwrap();
        let mut req = Request::default();
        for _ in 0..(MAX_REQUEST_SEGMENTS + 1) {
            req.push_segment(vec![b'x']);
        }
        assert!(matches!(conn.send(&req), Err(Error::Protocol(_))));
    }
}
