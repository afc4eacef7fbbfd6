//! DomFrog - an unattended backup daemon for Dominions games.
//!
//! This library provides the core functionality for domfrog, including:
//! - Configuration loading
//! - Content fingerprints for game folders
//! - Persisted per-folder turn/save state
//! - Versioned turn and save snapshots
//! - The single-instance daemon loop and its log

pub mod cfg;
pub mod context;
pub mod daemon;
pub mod hash;
pub mod logger;
pub mod snapshots;
pub mod state;
pub mod ui;
