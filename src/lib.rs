//! Core of a Bitcoin payment-monitoring service: address pool and gap-limit
//! management, a multi-provider blockchain query layer, per-address payment
//! observers, and real-time fanout to subscribed clients. See
//! `SPEC_FULL.md` for the full specification; `DESIGN.md` for how each
//! module here is grounded.
//!
//! The HTTP front-end, merchant-site notification delivery, and admin UI are
//! external collaborators; this crate only exposes the operations and events
//! they consume.

pub mod app;
pub mod balance_cache;
pub mod chain;
pub mod circuit_breaker;
pub mod config;
pub mod confirmation_hook;
pub mod fanout;
pub mod gap_limit;
pub mod observer;
pub mod pool;
pub mod rate_limiter;
pub mod rate_oracle;
pub mod secret;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod supervisor;
pub mod utils;
pub mod wallet_provider;
pub mod webhook;
