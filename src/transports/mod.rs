//! Transport Implementations

pub mod memory;
pub mod quic;
