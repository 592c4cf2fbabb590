//! Realtime collaboration engine for a multi-user form editor.
//!
//! Clients hold one WebSocket each and join form rooms. Presence, cursors, question
//! edits and typing indicators fan out to the room's members, on this instance and on
//! every other instance sharing the same state store.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
pub mod websocket;
pub mod ws;

pub use config::Config;
pub use error::{CollabError, Result};
pub use ws::hub::CollabHub;
