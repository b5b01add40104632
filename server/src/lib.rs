//! Pipecast Server - Line-fed real-time fan-out hub.
//!
//! This crate provides the server component of Pipecast, responsible for:
//! - Reading a line-oriented feed from standard input
//! - Wrapping each line in a timestamped envelope
//! - Broadcasting envelopes to every connected WebSocket client
//! - Tracking optional per-connection token authentication
//!
//! # Architecture
//!
//! The [`registry`] is the only shared state. WebSocket connections mutate it
//! through the [`lifecycle`] handler; the [`broadcast`] producer snapshots it
//! once per input line. Nothing is persisted.

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod routes;
pub mod types;
