//! The per-thread agent event loops.
//!
//! All four modes share one open-loop skeleton: consult the rate controller,
//! catch up on due sends without letting the schedule drift, then process
//! received responses. A paused controller re-anchors the next transmit
//! deadline so no burst fires on resume. The modes differ in what they
//! measure: throughput only counts, latency runs a closed loop on blocking
//! sockets, and the symmetric modes attribute per-request latency through
//! the FIFO transmit-timestamp ring with either software or NIC clocks.

use std::net::SocketAddr;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use phloem_transport::{RecvOutcome, SocketProfile, Timestamp};

use crate::config::AgentMode;
use crate::connection::ConnectionPool;
use crate::proto::{AppProtocol, Consumed};
use crate::rate::RateController;
use crate::stats::WorkerStats;
use crate::timing;
use crate::workload::RandomProcess;
use crate::{Error, Result};

/// Everything one worker needs to run.
pub struct WorkerParams {
    pub worker_id: usize,
    pub mode: AgentMode,
    pub targets: Vec<SocketAddr>,
    /// Connections this worker owns
    pub connections: usize,
    /// Total worker count, for splitting the aggregate load
    pub workers_total: usize,
    pub interarrival: RandomProcess,
    pub protocol: Box<dyn AppProtocol>,
    pub rate: Arc<RateController>,
    pub sampling_rate: f64,
    pub samples_capacity: usize,
    pub interface: Option<String>,
    pub seed: Option<u64>,
    /// Stop once this many requests have been sent and answered. `None`
    /// runs until the controller stops.
    pub request_limit: Option<u64>,
}

/// Open this worker's connections, rendezvous at the barrier, then run the
/// mode's event loop until the controller stops the run.
pub fn run_worker(params: WorkerParams, barrier: &Barrier) -> Result<WorkerStats> {
    let profile = match params.mode {
        AgentMode::Latency => SocketProfile::latency(),
        AgentMode::SymmetricNic => {
            let interface = params.interface.as_deref().ok_or_else(|| {
                Error::Config("symmetric-nic mode needs an interface".to_string())
            })?;
            SocketProfile::open_loop_nic(interface)
        }
        _ => SocketProfile::open_loop(),
    };

    let pool_seed = params.seed.map(|s| s.wrapping_add(params.worker_id as u64));
    let pool =
        ConnectionPool::open(&params.targets, params.connections, &profile, pool_seed)?;
    let stats = WorkerStats::new(params.samples_capacity, params.sampling_rate, pool_seed);

    tracing::debug!(
        worker_id = params.worker_id,
        mode = %params.mode,
        connections = params.connections,
        "worker connected"
    );

    let mut worker = Worker {
        pool,
        stats,
        interarrival: params.interarrival,
        protocol: params.protocol,
        rate: params.rate,
        workers_total: params.workers_total,
        epoch_seen: u64::MAX,
        request_limit: params.request_limit,
        sent: 0,
        received: 0,
    };

    barrier.wait();

    match params.mode {
        AgentMode::Throughput => worker.throughput_loop()?,
        AgentMode::Latency => worker.latency_loop()?,
        AgentMode::Symmetric => worker.symmetric_loop()?,
        AgentMode::SymmetricNic => worker.symmetric_nic_loop()?,
    }

    Ok(worker.stats)
}

struct Worker {
    pool: ConnectionPool,
    stats: WorkerStats,
    interarrival: RandomProcess,
    protocol: Box<dyn AppProtocol>,
    rate: Arc<RateController>,
    workers_total: usize,
    epoch_seen: u64,
    request_limit: Option<u64>,
    sent: u64,
    received: u64,
}

impl Worker {
    /// Next inter-arrival gap: whole microseconds from the process, in
    /// nanoseconds.
    fn next_gap_ns(&mut self) -> u64 {
        (self.interarrival.sample().round().max(0.0) as u64) * 1000
    }

    /// Re-target the inter-arrival process when the controller's epoch has
    /// moved.
    fn refresh_load(&mut self) -> Result<()> {
        let epoch = self.rate.epoch();
        if epoch == self.epoch_seen {
            return Ok(());
        }
        self.epoch_seen = epoch;
        if let Some(avg_us) = self.rate.per_worker_avg_us(self.workers_total) {
            self.interarrival.set_avg(avg_us)?;
        }
        Ok(())
    }

    fn done(&self) -> bool {
        if self.rate.should_stop() {
            return true;
        }
        match self.request_limit {
            Some(limit) => self.sent >= limit && self.received >= limit,
            None => false,
        }
    }

    fn may_send(&self) -> bool {
        match self.request_limit {
            Some(limit) => self.sent < limit,
            None => true,
        }
    }

    /// Send one request on a picked connection. Returns the byte count, or
    /// `None` when every connection is saturated and this tick is skipped.
    fn send_one(&mut self) -> Result<Option<(usize, usize)>> {
        let Some(idx) = self.pool.pick() else {
            return Ok(None);
        };
        let request = self.protocol.build_request();
        let bytes = self.pool.get_mut(idx).send(&request)?;
        self.sent += 1;
        if self.rate.should_measure() {
            self.stats.record_tx(1, bytes as u64);
        }
        Ok(Some((idx, bytes)))
    }

    /// Read once from a ready connection and run the decoder. `None` means
    /// nothing was consumed (would-block, or the peer closed and the
    /// connection was torn down).
    fn drain_ready(&mut self, idx: usize) -> Result<Option<Consumed>> {
        match self.pool.get_mut(idx).recv()? {
            RecvOutcome::Closed => {
                tracing::warn!(conn = idx, "server closed connection");
                self.pool.close(idx)?;
                return Ok(None);
            }
            RecvOutcome::WouldBlock => return Ok(None),
            RecvOutcome::Data(_) => {}
        }
        let consumed = self.pool.get_mut(idx).consume(self.protocol.as_mut())?;
        self.note_consumed(&consumed);
        Ok(Some(consumed))
    }

    fn note_consumed(&mut self, consumed: &Consumed) {
        self.received += consumed.reqs as u64;
        if consumed.reqs > 0 && self.rate.should_measure() {
            self.stats.record_rx(consumed.reqs as u64, consumed.bytes as u64);
        }
    }

    /// Open-loop counting mode: fire on schedule, count what comes back.
    fn throughput_loop(&mut self) -> Result<()> {
        let mut next_tx = timing::time_ns();
        loop {
            if self.done() {
                break;
            }
            self.refresh_load()?;
            if !self.rate.should_load() {
                next_tx = timing::time_ns();
                continue;
            }

            // Catch up on due sends; the deadline advances by sampled gaps
            // so a slow tick never skews the offered process
            while self.may_send() && timing::time_ns() >= next_tx {
                if self.send_one()?.is_none() {
                    break;
                }
                next_tx += self.next_gap_ns();
            }

            let events = self.pool.poll(Some(Duration::ZERO))?;
            for event in events {
                if event.readable {
                    self.drain_ready(event.id)?;
                }
            }
        }
        Ok(())
    }

    /// Closed-loop mode on blocking sockets: one request in flight, latency
    /// is the software round-trip time.
    fn latency_loop(&mut self) -> Result<()> {
        let mut next_tx = timing::time_ns();
        loop {
            if self.done() {
                break;
            }
            self.refresh_load()?;
            if !self.rate.should_load() {
                next_tx = timing::time_ns();
                continue;
            }
            if timing::time_ns() < next_tx {
                std::hint::spin_loop();
                continue;
            }

            let Some(idx) = self.pool.pick() else {
                continue;
            };
            let request = self.protocol.build_request();
            let start = Timestamp::now();
            let bytes = self.pool.get_mut(idx).send(&request)?;
            self.sent += 1;
            // Counted at send time: a request the server swallows must
            // still widen the tx/rx gap
            if self.rate.should_measure() {
                self.stats.record_tx(1, bytes as u64);
            }

            // Block until one complete response; the socket's read timeout
            // bounds each wait so a stop request is noticed
            let mut closed = false;
            let mut result: Option<Consumed> = None;
            loop {
                match self.pool.get_mut(idx).recv()? {
                    RecvOutcome::Closed => {
                        closed = true;
                        break;
                    }
                    RecvOutcome::WouldBlock => {
                        if self.rate.should_stop() {
                            break;
                        }
                        continue;
                    }
                    RecvOutcome::Data(_) => {}
                }
                let consumed = self.pool.get_mut(idx).consume(self.protocol.as_mut())?;
                if consumed.reqs > 0 {
                    result = Some(consumed);
                    break;
                }
            }

            if closed {
                tracing::warn!(conn = idx, "server closed connection");
                self.pool.close(idx)?;
            } else if let Some(consumed) = result {
                let end = Timestamp::now();
                self.note_consumed(&consumed);
                if self.rate.should_measure() {
                    if let Some(latency) = end.duration_since(&start) {
                        self.stats.record_latency(latency, start.sw_nanos());
                    }
                }
            }

            next_tx += self.next_gap_ns();
        }
        Ok(())
    }

    /// Open-loop mode with software transmit timestamps: latency per
    /// response via FIFO attribution on the ring.
    fn symmetric_loop(&mut self) -> Result<()> {
        let mut next_tx = timing::time_ns();
        loop {
            if self.done() {
                break;
            }
            self.refresh_load()?;
            if !self.rate.should_load() {
                next_tx = timing::time_ns();
                continue;
            }

            while self.may_send() && timing::time_ns() >= next_tx {
                let Some(idx) = self.pool.pick() else {
                    break;
                };
                let request = self.protocol.build_request();
                let ts = Timestamp::now();
                let conn = self.pool.get_mut(idx);
                conn.tx_ring.push_complete(ts);
                let bytes = conn.send(&request)?;
                self.sent += 1;
                if self.rate.should_measure() {
                    self.stats.record_tx(1, bytes as u64);
                    self.stats.record_tx_timestamp(ts.sw_nanos());
                }
                next_tx += self.next_gap_ns();
            }

            // One readiness event per tick keeps receive work from starving
            // the send schedule
            let Some(event) = self.pool.poll_one(Some(Duration::ZERO))? else {
                continue;
            };
            if !event.readable {
                continue;
            }
            let Some(consumed) = self.drain_ready(event.id)? else {
                continue;
            };
            if consumed.reqs == 0 {
                continue;
            }

            let rx_ts = Timestamp::now();
            let conn = self.pool.get_mut(event.id);
            if consumed.reqs > 1 {
                // A coalesced read answers several sends; only the last is
                // attributed a latency
                conn.tx_ring.blind_skip(consumed.reqs as u64 - 1);
            }
            if let Some(tx_ts) = conn.tx_ring.pop() {
                if let Some(latency) = rx_ts.duration_since(&tx_ts) {
                    if self.rate.should_measure() {
                        self.stats.record_latency(latency, tx_ts.sw_nanos());
                    }
                }
            }
        }
        Ok(())
    }

    /// Open-loop mode with NIC timestamps on both directions. TX timestamps
    /// arrive asynchronously on the error queue and are matched to sends
    /// through the ring's byte counters.
    #[cfg(target_os = "linux")]
    fn symmetric_nic_loop(&mut self) -> Result<()> {
        let mut next_tx = timing::time_ns();
        loop {
            if self.done() {
                break;
            }
            self.refresh_load()?;
            if !self.rate.should_load() {
                next_tx = timing::time_ns();
                continue;
            }

            while self.may_send() && timing::time_ns() >= next_tx {
                let Some(idx) = self.pool.pick() else {
                    break;
                };
                let request = self.protocol.build_request();
                let conn = self.pool.get_mut(idx);
                let bytes = conn.send(&request)?;
                conn.tx_ring.add_pending(bytes as u32);
                self.sent += 1;
                if self.rate.should_measure() {
                    self.stats.record_tx(1, bytes as u64);
                }
                next_tx += self.next_gap_ns();
            }

            let Some(event) = self.pool.poll_one(Some(Duration::ZERO))? else {
                continue;
            };

            if event.error && !event.readable {
                self.harvest_tx(event.id)?;
                continue;
            }
            if !event.readable {
                continue;
            }

            let (outcome, rx_ts) = self.pool.get_mut(event.id).recv_with_timestamp()?;
            match outcome {
                RecvOutcome::Closed => {
                    tracing::warn!(conn = event.id, "server closed connection");
                    self.pool.close(event.id)?;
                    continue;
                }
                RecvOutcome::WouldBlock => continue,
                RecvOutcome::Data(_) => {}
            }
            let consumed = self.pool.get_mut(event.id).consume(self.protocol.as_mut())?;
            self.note_consumed(&consumed);
            if consumed.reqs == 0 {
                continue;
            }

            let conn = self.pool.get_mut(event.id);
            if consumed.reqs > 1 {
                conn.tx_ring.blind_skip(consumed.reqs as u64 - 1);
            }
            let tx_ts = match conn.tx_ring.pop() {
                Some(ts) => Some(ts),
                None => {
                    // The TX timestamp may simply not have been delivered
                    // yet; give the error queue one chance before dropping
                    // the sample
                    self.harvest_tx(event.id)?;
                    let conn = self.pool.get_mut(event.id);
                    match conn.tx_ring.pop() {
                        Some(ts) => Some(ts),
                        None => {
                            conn.tx_ring.blind_skip(1);
                            None
                        }
                    }
                }
            };

            if let (Some(tx), Some(rx)) = (tx_ts, rx_ts) {
                if tx.has_hardware() && rx.has_hardware() {
                    if let Some(latency) = rx.duration_since(&tx) {
                        if self.rate.should_measure() {
                            self.stats.record_latency(latency, tx.sw_nanos());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn symmetric_nic_loop(&mut self) -> Result<()> {
        Err(Error::Config("symmetric-nic mode requires Linux".to_string()))
    }

    /// Drain the error queue into the ring and log the attached transmit
    /// timestamps.
    #[cfg(target_os = "linux")]
    fn harvest_tx(&mut self, idx: usize) -> Result<()> {
        let attached = self.pool.get_mut(idx).harvest_tx_timestamps()?;
        if self.rate.should_measure() {
            for ts in attached {
                self.stats.record_tx_timestamp(ts.hw_nanos().unwrap_or_else(|| ts.sw_nanos()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Request;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

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
                        if socket.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    /// Echoes the first `answer` frames of `frame` bytes, then swallows
    /// everything while keeping the connection open.
    fn spawn_lossy_echo_server(answer: usize, frame: usize) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            while let Ok((mut socket, _)) = listener.accept() {
                thread::spawn(move || {
                    let mut answered = 0usize;
                    let mut buf = [0u8; 4096];
                    loop {
                        let n = socket.read(&mut buf).unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        let take = n.min((answer - answered) * frame);
                        if take > 0 {
                            if socket.write_all(&buf[..take]).is_err() {
                                break;
                            }
                            answered += take / frame;
                        }
                    }
                });
            }
        });
        addr
    }

    /// Fixed-size '#' message, responses counted as len / size.
    struct FrameProto {
        size: usize,
    }

    impl AppProtocol for FrameProto {
        fn build_request(&mut self) -> Request {
            Request::single(vec![b'#'; self.size])
        }

        fn consume_response(&mut self, buf: &[u8]) -> Result<Consumed> {
            let reqs = buf.len() / self.size;
            Ok(Consumed { reqs, bytes: reqs * self.size })
        }

        fn name(&self) -> &'static str {
            "frame"
        }
    }

    fn stop_after(rate: &Arc<RateController>, timeout: Duration) {
        let rate = Arc::clone(rate);
        thread::spawn(move || {
            thread::sleep(timeout);
            rate.stop();
        });
    }

    fn base_params(
        mode: AgentMode,
        addr: SocketAddr,
        interarrival: &str,
        rate: &Arc<RateController>,
        limit: u64,
    ) -> WorkerParams {
        WorkerParams {
            worker_id: 0,
            mode,
            targets: vec![addr],
            connections: 1,
            workers_total: 1,
            interarrival: RandomProcess::parse(interarrival, Some(1)).unwrap(),
            protocol: Box::new(FrameProto { size: 8 }),
            rate: Arc::clone(rate),
            sampling_rate: 1.0,
            samples_capacity: 4096,
            interface: None,
            seed: Some(1),
            request_limit: Some(limit),
        }
    }

    #[test]
    fn symmetric_mode_end_to_end() {
        let addr = spawn_echo_server();
        thread::sleep(Duration::from_millis(10));

        let rate = Arc::new(RateController::new());
        rate.set_load(1000); // 1 ms between sends
        rate.start_measuring();
        stop_after(&rate, Duration::from_secs(20));

        let params = base_params(AgentMode::Symmetric, addr, "fixed:1000", &rate, 1000);
        let barrier = Barrier::new(1);
        let stats = run_worker(params, &barrier).unwrap();

        assert_eq!(stats.tx().reqs, 1000);
        assert_eq!(stats.rx().reqs, 1000);
        assert_eq!(stats.tx().bytes, 8000);
        assert_eq!(stats.rx().bytes, 8000);

        // The offered stream must track the schedule: mean gap within 2%
        // of 1 ms, no drift accumulating across the run
        let ts = stats.tx_timestamps();
        assert_eq!(ts.len(), 1000);
        let span = ts[ts.len() - 1] - ts[0];
        let mean_gap = span as f64 / (ts.len() - 1) as f64;
        assert!(
            (mean_gap - 1_000_000.0).abs() / 1_000_000.0 < 0.02,
            "mean gap {} ns",
            mean_gap
        );

        // Loopback echo latencies land and are positive
        assert!(!stats.samples().is_empty());
        assert!(stats.samples().iter().all(|s| s.nanos > 0));
    }

    #[test]
    fn throughput_mode_counts_requests_and_bytes() {
        let addr = spawn_echo_server();
        thread::sleep(Duration::from_millis(10));

        let rate = Arc::new(RateController::new());
        rate.set_load(10_000); // 100 us between sends
        rate.start_measuring();
        stop_after(&rate, Duration::from_secs(20));

        let params = base_params(AgentMode::Throughput, addr, "exp:100", &rate, 500);
        let barrier = Barrier::new(1);
        let stats = run_worker(params, &barrier).unwrap();

        assert_eq!(stats.tx().reqs, 500);
        assert_eq!(stats.rx().reqs, 500);
        assert_eq!(stats.tx().bytes, 4000);
        assert_eq!(stats.rx().bytes, 4000);
        // Throughput mode measures no latency
        assert!(stats.samples().is_empty());
    }

    #[test]
    fn latency_mode_measures_round_trips() {
        let addr = spawn_echo_server();
        thread::sleep(Duration::from_millis(10));

        let rate = Arc::new(RateController::new());
        rate.set_load(2000); // 500 us between sends
        rate.start_measuring();
        stop_after(&rate, Duration::from_secs(20));

        let params = base_params(AgentMode::Latency, addr, "fixed:500", &rate, 200);
        let barrier = Barrier::new(1);
        let stats = run_worker(params, &barrier).unwrap();

        assert_eq!(stats.tx().reqs, 200);
        assert_eq!(stats.rx().reqs, 200);
        assert_eq!(stats.samples().len(), 200);
        assert!(stats.samples().iter().all(|s| s.nanos > 0));
    }

    #[test]
    fn latency_mode_counts_unanswered_sends() {
        let addr = spawn_lossy_echo_server(4, 8);
        thread::sleep(Duration::from_millis(10));

        let rate = Arc::new(RateController::new());
        rate.set_load(2000); // 500 us between sends
        rate.start_measuring();
        stop_after(&rate, Duration::from_millis(500));

        let params = base_params(AgentMode::Latency, addr, "fixed:500", &rate, 5);
        let barrier = Barrier::new(1);
        let stats = run_worker(params, &barrier).unwrap();

        // The fifth request is swallowed by the server: it still counts as
        // transmitted, and the tx/rx gap is the loss signal
        assert_eq!(stats.tx().reqs, 5);
        assert_eq!(stats.rx().reqs, 4);
        assert_eq!(stats.samples().len(), 4);
    }

    #[test]
    fn paused_controller_sends_nothing() {
        let addr = spawn_echo_server();
        thread::sleep(Duration::from_millis(10));

        let rate = Arc::new(RateController::new());
        // Load never set: the worker spins in the paused branch
        rate.start_measuring();
        stop_after(&rate, Duration::from_millis(200));

        let params = base_params(AgentMode::Symmetric, addr, "fixed:1000", &rate, 1000);
        let barrier = Barrier::new(1);
        let stats = run_worker(params, &barrier).unwrap();

        assert_eq!(stats.tx().reqs, 0);
        assert_eq!(stats.rx().reqs, 0);
    }

    #[test]
    fn warmup_is_excluded_from_counters() {
        let addr = spawn_echo_server();
        thread::sleep(Duration::from_millis(10));

        let rate = Arc::new(RateController::new());
        rate.set_load(10_000);
        // Measuring stays off: everything sent is warm-up traffic
        stop_after(&rate, Duration::from_millis(300));

        let params = base_params(AgentMode::Symmetric, addr, "exp:100", &rate, u64::MAX);
        let barrier = Barrier::new(1);
        let stats = run_worker(params, &barrier).unwrap();

        assert_eq!(stats.tx().reqs, 0);
        assert_eq!(stats.rx().reqs, 0);
        assert!(stats.samples().is_empty());
    }
}
