// Public API - capture, traceroute and output types
pub mod capture;
pub mod config;
pub mod error;
pub mod export;
pub mod state;
pub mod trace;

// Argument parsing and raw socket plumbing
pub mod cli;
pub mod probe;
