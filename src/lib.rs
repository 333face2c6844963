//! Idlegate - a game-protocol TCP proxy that wakes its backend on demand
//!
//! This library provides a reverse proxy that:
//! - Reads the first packet of each connection to learn the requested host
//! - Routes by exact or wildcard host pattern to local or on-demand backends
//! - Starts the on-demand cloud instance when a player tries to log in
//! - Answers status pings and refused logins with friendly messages
//! - Rate-limits, bans, and allow-lists clients before they can wake the backend
//! - Stops the on-demand backend after a configurable idle period

pub mod admin;
pub mod admission;
pub mod config;
pub mod error;
pub mod forward;
pub mod friendly;
pub mod handshake;
pub mod idle;
pub mod lifecycle;
pub mod provider;
pub mod proxy;
pub mod routes;
pub mod session;
