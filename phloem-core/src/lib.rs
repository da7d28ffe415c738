//! Open-loop load generation engine.
//!
//! The engine drives request traffic at a configured inter-arrival process
//! rather than in lockstep with responses, so server-side queueing shows up
//! in the measurements instead of being absorbed by the generator. Four
//! agent modes share one scheduling skeleton (`worker`): throughput counting,
//! closed-loop latency, and two symmetric modes that attribute per-request
//! latency through FIFO transmit-timestamp accounting with software or NIC
//! clocks.
//!
//! After a run, `stats` answers the questions that decide whether the
//! numbers can be trusted: did the offered stream match the configured
//! process, did the latency distribution converge, and are the samples
//! independent.

pub mod config;
pub mod connection;
pub mod error;
pub mod proto;
pub mod rate;
pub mod stats;
pub mod threading;
pub mod timing;
pub mod worker;
pub mod workload;

pub use config::{AgentMode, RunConfig};
pub use error::{Error, Result};
pub use proto::{AppProtocol, Consumed, Request};
pub use rate::RateController;
pub use workload::RandomProcess;
