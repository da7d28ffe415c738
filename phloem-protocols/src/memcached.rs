//! Memcached ASCII GET protocols.
//!
//! Both variants assume a server configured to answer every GET with a
//! fixed-size frame, so responses are counted without parsing.

use anyhow::bail;
use phloem_core::{AppProtocol, Consumed, RandomProcess, Request, Result};

/// Fixed response frame size the cooperating server is configured for
const RESPONSE_SIZE: usize = 40;

const DEFAULT_KEY_SPACE: u64 = 1_000_000;

/// Plain ASCII GETs over a wrapping zero-padded key counter.
pub struct AsciiMemProtocol {
    key: u64,
    key_space: u64,
}

impl AsciiMemProtocol {
    pub fn new(key_space: Option<u64>) -> anyhow::Result<Self> {
        let key_space = key_space.unwrap_or(DEFAULT_KEY_SPACE);
        if key_space == 0 {
            bail!("key space must be positive");
        }
        Ok(Self { key: 0, key_space })
    }
}

impl AppProtocol for AsciiMemProtocol {
    fn build_request(&mut self) -> Request {
        let line = format!("get {:019}\r\n", self.key);
        self.key = (self.key + 1) % self.key_space;
        Request::single(line.into_bytes())
    }

    fn consume_response(&mut self, buf: &[u8]) -> Result<Consumed> {
        let reqs = buf.len() / RESPONSE_SIZE;
        Ok(Consumed { reqs, bytes: reqs * RESPONSE_SIZE })
    }

    fn name(&self) -> &'static str {
        "ascii-mem"
    }
}

/// ASCII GETs whose key is a sampled service time in microseconds; a
/// cooperating server spins for the keyed duration before answering.
pub struct AsciiMemSvcProtocol {
    service_time: RandomProcess,
}

impl AsciiMemSvcProtocol {
    pub fn new(descriptor: &str, seed: Option<u64>) -> anyhow::Result<Self> {
        Ok(Self { service_time: RandomProcess::parse(descriptor, seed)? })
    }
}

impl AppProtocol for AsciiMemSvcProtocol {
    fn build_request(&mut self) -> Request {
        let us = self.service_time.sample().round().max(0.0) as u64;
        Request::single(format!("get {}\r\n", us).into_bytes())
    }

    fn consume_response(&mut self, buf: &[u8]) -> Result<Consumed> {
        let reqs = buf.len() / RESPONSE_SIZE;
        Ok(Consumed { reqs, bytes: reqs * RESPONSE_SIZE })
    }

    fn name(&self) -> &'static str {
        "ascii-mem-svc"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_zero_padded_and_wrap() {
        let mut proto = AsciiMemProtocol::new(Some(3)).unwrap();

        let lines: Vec<String> = (0..4)
            .map(|_| String::from_utf8(proto.build_request().segments()[0].clone()).unwrap())
            .collect();

        assert_eq!(lines[0], "get 0000000000000000000\r\n");
        assert_eq!(lines[1], "get 0000000000000000001\r\n");
        assert_eq!(lines[2], "get 0000000000000000002\r\n");
        // Counter wrapped back around
        assert_eq!(lines[3], "get 0000000000000000000\r\n");
    }

    #[test]
    fn request_line_is_25_bytes() {
        let mut proto = AsciiMemProtocol::new(None).unwrap();
        assert_eq!(proto.build_request().total_bytes(), 25);
    }

    #[test]
    fn consume_counts_fixed_frames() {
        let mut proto = AsciiMemProtocol::new(None).unwrap();
        // Two full frames plus a partial
        assert_eq!(
            proto.consume_response(&[0u8; 100]).unwrap(),
            Consumed { reqs: 2, bytes: 80 }
        );
        assert_eq!(proto.consume_response(&[0u8; 39]).unwrap(), Consumed { reqs: 0, bytes: 0 });
    }

    #[test]
    fn svc_request_embeds_sampled_service_time() {
        let mut proto = AsciiMemSvcProtocol::new("fixed:25", None).unwrap();
        let line = String::from_utf8(proto.build_request().segments()[0].clone()).unwrap();
        assert_eq!(line, "get 25\r\n");
    }

    #[test]
    fn zero_key_space_is_rejected() {
        assert!(AsciiMemProtocol::new(Some(0)).is_err());
    }
}
