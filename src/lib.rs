//! Rackway - a local HTTP proxy that boots rack apps on demand
//!
//! This library provides a zero-config development proxy that:
//! - Routes HTTP traffic based on Host header to application directories
//! - Boots each application behind a pool of worker subprocesses on first request
//! - Sources per-application shell environments (.powrc, .powenv, .rvmrc)
//! - Restarts an application's workers when tmp/restart.txt is touched
//! - Serves files from the application's public/ directory without booting it
//! - Idles workers out after a configurable period of inactivity

pub mod app;
pub mod config;
pub mod env;
pub mod error;
pub mod files;
pub mod gateway;
pub mod lines;
pub mod pause;
pub mod pool;
pub mod resolver;
pub mod router;
