//! Table Access Protocol client
pub mod client;
pub mod job;

pub use client::{PollPolicy, TapClient};
pub use job::{AsyncJob, JobPhase};
