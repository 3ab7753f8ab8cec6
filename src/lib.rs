//! Arena - real-time competitive game session pipeline
//!
//! Matchmaking, a per-room state machine, server-side score validation,
//! statistical anti-cheat and settlement, fronted by a WebSocket gateway.

pub mod anticheat;
pub mod api;
pub mod collaborators;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod matchmaking;
pub mod metrics;
pub mod rooms;
pub mod service;
pub mod store;
pub mod types;
pub mod validation;

pub use config::{ArenaConfig, ConfigLoader};
pub use errors::{ArenaError, ArenaResult};
pub use service::{ArenaService, Collaborators, Stores};
