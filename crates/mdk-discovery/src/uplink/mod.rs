//! Uplink connection management and backends.

pub mod client;

#[cfg(feature = "memory")]
pub mod memory;

pub use client::{ClientOptions, UplinkClient, UplinkState};

#[cfg(feature = "memory")]
pub use memory::MemoryUplink;
