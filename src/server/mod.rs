//! Gateway server: tunnel accept endpoint, public request proxy, device API,
//! and browser terminal bridge.
//!
//! - [`connect`] owns the `/tunnel` WebSocket upgrade and each agent's read
//!   loop and writer task.
//! - [`tunnel`] is the per-agent demultiplexer: correlators, terminal sinks,
//!   metrics snapshot, close semantics.
//! - [`registry`] maps subdomains to live tunnels, one each.
//! - [`proxy`] turns public `<subdomain>.<domain>` requests into tunnel
//!   frames and meters bandwidth.
//! - [`terminal`] bridges browser WebSockets to agent PTYs.
//! - [`api`] is the token-authenticated device surface.

pub mod api;
pub mod connect;
pub mod proxy;
pub mod registry;
pub mod terminal;
pub mod tunnel;
