//! Test harness for end-to-end relay testing.
//!
//! Spawns real relays and TCP targets on random ports and drives them with a
//! Hixie-76 client.

#![allow(dead_code)]

mod client;
mod metrics;
mod server;

pub use client::{KEY1, KEY2, KEY3, EXPECTED_DIGEST, TestClient, upgrade_request};
pub use metrics::{Latencies, Metrics};
pub use server::{EchoTarget, ReplyTarget, TestRelay};
