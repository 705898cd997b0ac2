//! Controller for a distributed network of Minecraft server-status probes.
//!
//! Probe agents connect inbound over WebSocket, authenticate against a
//! hot-reloaded credentials file, and serve ping tasks. The HTTP API either
//! probes a target directly over the Java (TCP) or Bedrock (UDP) wire
//! protocol, or fans the probe out to every connected agent and aggregates
//! the results, in both cases enriched with DNS-chain and GeoIP metadata.

pub mod address;
pub mod api;
pub mod bedrock;
pub mod config;
pub mod dispatch;
pub mod geoip;
pub mod java;
pub mod motd;
pub mod orchestrate;
pub mod resolver;
pub mod session;
pub mod status;

pub use config::Config;
pub use orchestrate::Controller;
pub use status::{Protocol, ServerStatus};
