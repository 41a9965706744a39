//! Flash-sale service for the souk order fabric.
//!
//! Serves the `/seckill/buy` hot path entirely from Redis: one atomic Lua
//! script performs rate limiting, duplicate detection, campaign-window
//! checks, and the stock decrement, so overselling and double-wins are
//! impossible by construction. Wins enter the ordinary order saga through
//! `seckill.order.won`; failed publishes fall back to the append-only
//! ghost-order log for operator replay.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod engine;
pub mod ghost;
pub mod handlers;

pub use config::Config;
pub use engine::{CampaignSpec, CampaignStatus, ReserveOutcome, SeckillEngine, SeckillError};
pub use ghost::GhostLog;
