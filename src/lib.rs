//! ForgePool: a mining pool coordinator for memory-hard PoW networks.
//!
//! The coordinator validates miner shares against the current job,
//! detects blocks and submits them upstream, accounts contributions on
//! a PPLNS sliding window, matures found blocks through confirmation
//! depth, and pays confirmed balances out in batches. Miner-facing
//! protocol servers and the dashboard are separate processes that talk
//! to this core through the share channel and the event broadcast.

pub mod config;
pub mod core;
pub mod job;
pub mod payout;
pub mod pipeline;
pub mod policy;
pub mod pow;
pub mod pplns;
pub mod shutdown;
pub mod storage;
pub mod unlocker;
pub mod upstream;
