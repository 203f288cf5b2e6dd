//! Rollback Battle Server - authoritative rollback netcode for 2D platform battles
//!
//! - `battle`: deterministic simulation core (collision, ring buffers, prediction, chasing)
//! - `room`: seat admission and the per-room battle task
//! - `ws`: WebSocket sessions and the binary wire envelope
//! - `http`: token verification and routes

pub mod app;
pub mod battle;
pub mod config;
pub mod http;
pub mod room;
pub mod util;
pub mod ws;
