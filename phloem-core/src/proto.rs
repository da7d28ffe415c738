//! The seam between the engine and wire protocols.
//!
//! A protocol builds outgoing requests as scatter-gather segment lists and
//! counts complete responses out of a receive buffer. The engine never
//! inspects payload bytes itself.

use crate::Result;

/// Upper bound on scatter-gather segments per request, matching the iovec
/// budget handed to `writev`.
pub const MAX_REQUEST_SEGMENTS: usize = 64;

/// An outgoing request as a list of byte segments.
#[derive(Debug, Clone, Default)]
pub struct Request {
    segments: Vec<Vec<u8>>,
}

impl Request {
    pub fn single(payload: Vec<u8>) -> Self {
        Self { segments: vec![payload] }
    }

    pub fn push_segment(&mut self, segment: Vec<u8>) {
        self.segments.push(segment);
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }
}

/// Responses consumed out of a receive buffer: how many completed and how
/// many buffer bytes they covered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Consumed {
    pub reqs: usize,
    pub bytes: usize,
}

/// A wire protocol plugged into the agent.
pub trait AppProtocol: Send {
    /// Build the next outgoing request.
    fn build_request(&mut self) -> Request;

    /// Count the complete responses at the front of `buf`.
    ///
    /// Must never report more bytes than `buf` holds; a partial trailing
    /// response is simply left uncounted and stays buffered.
    fn consume_response(&mut self, buf: &[u8]) -> Result<Consumed>;

    fn name(&self) -> &'static str;
}
