//! Core domain + application logic for the volley sender.
//!
//! This crate is intentionally provider-agnostic. Telegram lives behind
//! ports (traits) implemented in adapter crates; the HTTP surface is a
//! separate crate on top of [`coordinator::SessionCoordinator`].

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod monitor;
pub mod pattern;
pub mod provider;

pub use errors::{Error, Result};
