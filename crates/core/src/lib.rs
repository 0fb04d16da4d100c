//! Core crate for the cadenza music-generation server.

pub mod audio;
pub mod config;
pub mod engine;
pub mod jobs;
pub mod logging;
pub mod server;
