pub mod inflight;
pub mod monitor;
pub mod pipeline;

pub use monitor::*;
pub use pipeline::*;
