//! Synthetic service-time protocol.
//!
//! Each request is an 8-byte little-endian integer drawn from a random
//! process; a cooperating server spins for that many microseconds and sends
//! the 8 bytes back.

use phloem_core::{AppProtocol, Consumed, RandomProcess, Request, Result};

const PAYLOAD_SIZE: usize = 8;

pub struct SyntheticProtocol {
    service_time: RandomProcess,
}

impl SyntheticProtocol {
    pub fn new(descriptor: &str, seed: Option<u64>) -> anyhow::Result<Self> {
        Ok(Self { service_time: RandomProcess::parse(descriptor, seed)? })
    }
}

impl AppProtocol for SyntheticProtocol {
    fn build_request(&mut self) -> Request {
        let value = self.service_time.sample().round().max(0.0) as i64;
        Request::single(value.to_le_bytes().to_vec())
    }

    fn consume_response(&mut self, buf: &[u8]) -> Result<Consumed> {
        let reqs = buf.len() / PAYLOAD_SIZE;
        Ok(Consumed { reqs, bytes: reqs * PAYLOAD_SIZE })
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}
