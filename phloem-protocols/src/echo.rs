//! Fixed-size echo protocol: the server reflects every byte back.

use anyhow::bail;
use phloem_core::connection::MAX_PAYLOAD;
use phloem_core::{AppProtocol, Consumed, Request, Result};

pub struct EchoProtocol {
    message: Vec<u8>,
}

impl EchoProtocol {
    pub fn new(size: usize) -> anyhow::Result<Self> {
        if size == 0 {
            bail!("echo message size must be positive");
        }
        // An echoed frame must fit the per-connection receive buffer, or
        // the decoder can never complete a response
        if size > MAX_PAYLOAD {
            bail!("echo message size {} exceeds the {} byte receive buffer", size, MAX_PAYLOAD);
        }
        Ok(Self { message: vec![b'#'; size] })
    }
}

impl AppProtocol for EchoProtocol {
    fn build_request(&mut self) -> Request {
        Request::single(self.message.clone())
    }

    fn consume_response(&mut self, buf: &[u8]) -> Result<Consumed> {
        let reqs = buf.len() / self.message.len();
        Ok(Consumed { reqs, bytes: reqs * self.message.len() })
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_filled_with_hashes() {
        let mut proto = EchoProtocol::new(8).unwrap();
        let req = proto.build_request();
        assert_eq!(req.total_bytes(), 8);
        assert_eq!(req.segments()[0], vec![b'#'; 8]);
    }

    #[test]
    fn consume_counts_whole_messages() {
        let mut proto = EchoProtocol::new(8).unwrap();

        // Two full echoes plus a partial third
        let consumed = proto.consume_response(&[b'#'; 20]).unwrap();
        assert_eq!(consumed, Consumed { reqs: 2, bytes: 16 });

        // Nothing complete yet
        let consumed = proto.consume_response(&[b'#'; 5]).unwrap();
        assert_eq!(consumed, Consumed { reqs: 0, bytes: 0 });
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(EchoProtocol::new(0).is_err());
    }

    #[test]
    fn message_must_fit_the_receive_buffer() {
        assert!(EchoProtocol::new(MAX_PAYLOAD).is_ok());
        assert!(EchoProtocol::new(MAX_PAYLOAD + 1).is_err());
    }
}
