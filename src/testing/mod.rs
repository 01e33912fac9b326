//! Deterministic test support.
//!
//! - [`ManualClock`] - simulated time for inactivity deadlines and pings
//! - [`TrackingPool`] - buffer pool that reports leaked arrays
//! - [`CallRegistry`] - race-free waiting for received calls
//! - [`TestClient`] - a client recording every call the server makes

mod client;
mod clock;
mod pool;
mod registry;

pub use client::{TestClient, TestClientBuilder};
pub use clock::ManualClock;
pub use pool::TrackingPool;
pub use registry::{CallRegistry, RecordedCall};
