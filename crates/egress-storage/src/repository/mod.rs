//! Database repositories for each table.

pub mod blocked_hosts;

pub use blocked_hosts::BlockedHostRepo;
