//! Handset: handsfree audio backend for the sound server
//!
//! Negotiates, over the system bus, the right to receive handsfree audio
//! connections from the external telephony service. One backend exists per
//! server lifetime; it is an owned value with explicit construct/shutdown,
//! not an ambient singleton.
//!
//! The moving parts:
//!
//! - **[`HfBackend`]**: owns the bus connection, installs a passive message
//!   filter, subscribes to manager signals, serves the agent object, and
//!   sends the asynchronous Register request
//! - **[`AgentCore`]**: sender authorization and dispatch for inbound agent
//!   calls, independent of the bus so it can be tested without one
//! - **[`PendingCalls`]**: the ledger of in-flight asynchronous bus calls;
//!   teardown drains it so nothing leaks mid-flight
//! - **[`CardRegistry`]**: known remote audio cards, keyed by object path
//!
//! A successful Register reply records the granting service's unique bus
//! name; that identity is the sole trusted sender for inbound agent calls
//! from then on. Everyone else gets `org.ofono.Error.NotAllowed`.

pub mod agent;
pub mod backend;
pub mod cards;
pub mod config;
pub mod pending;

pub use agent::{AgentCore, AgentError, ConnectionHandoff, HandsfreeAgent, StubHandoff, TrustedPeer};
pub use backend::{BackendError, HfBackend};
pub use cards::{CardRegistry, HandsfreeCard};
pub use config::{BackendConfig, CODEC_CVSD, CODEC_MSBC};
pub use pending::PendingCalls;
