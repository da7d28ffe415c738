//! Wire protocol plug-ins.
//!
//! A protocol is selected by a textual tag: `echo:<size>`,
//! `synthetic:<dist>`, `ascii-mem[:<keys>]` or `ascii-mem-svc:<dist>`.

mod echo;
mod memcached;
mod synthetic;

pub use echo::EchoProtocol;
pub use memcached::{AsciiMemProtocol, AsciiMemSvcProtocol};
pub use synthetic::SyntheticProtocol;

use anyhow::bail;
use phloem_core::AppProtocol;

/// Build a protocol from its descriptor tag.
///
/// `ascii-mem-svc` must be matched before `ascii-mem`, which is its prefix.
pub fn from_descriptor(descriptor: &str, seed: Option<u64>) -> anyhow::Result<Box<dyn AppProtocol>> {
    if let Some(rest) = descriptor.strip_prefix("echo:") {
        return Ok(Box::new(EchoProtocol::new(rest.parse()?)?));
    }
    if let Some(rest) = descriptor.strip_prefix("synthetic:") {
        return Ok(Box::new(SyntheticProtocol::new(rest, seed)?));
    }
    if let Some(rest) = descriptor.strip_prefix("ascii-mem-svc:") {
        return Ok(Box::new(AsciiMemSvcProtocol::new(rest, seed)?));
    }
    if descriptor == "ascii-mem" {
        return Ok(Box::new(AsciiMemProtocol::new(None)?));
    }
    if let Some(rest) = descriptor.strip_prefix("ascii-mem:") {
        return Ok(Box::new(AsciiMemProtocol::new(Some(rest.parse()?))?));
    }
    bail!("unknown protocol '{}'", descriptor)
}
