//! Order lifecycle and payment engine for the media store.
//!
//! This crate owns the order state machine, stock guarding, fee and VAT
//! computation, the signed payment gateway protocol and the payment ledger.
//! Transport layers (HTTP handlers, admin UIs) live elsewhere and talk to
//! [`services::OrderLifecycleEngine`].
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod migrator;
pub mod services;

pub use errors::{AppError, ServiceError};
