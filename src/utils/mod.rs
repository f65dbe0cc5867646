//! # Utility Modules
//!
//! Supporting utilities shared by the codec, transports and session layer.
//!
//! ## Components
//! - **Buffer Pool**: rented write storage for `ByteBuffer`
//! - **Compression**: LZ4 block compression with strict size checks
//! - **Conditioner**: fake packet loss / latency injection
//! - **Logging**: `tracing-subscriber` setup
//! - **Metrics**: Thread-safe observability counters

pub mod buffer_pool;
pub mod compression;
pub mod conditioner;
pub mod logging;
pub mod metrics;

pub use conditioner::LinkConditioner;
