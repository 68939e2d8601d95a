//! CREATE2 vanity address miner.
//!
//! The host side is a dispatch core that keeps every compute device fed with
//! search rounds, harvests results through completion callbacks and promotes
//! the best score found across devices. The search predicate itself runs on
//! the device as an opaque kernel behind [`compute::KernelDriver`].

pub mod compute;
pub mod config;
pub mod dispatch;
pub mod mode;
pub mod speed;
pub mod types;
