//! Multi-tenant booking engine speaking the Postgres wire protocol.
//!
//! Businesses publish weekly schedules and services; clients book employees
//! into conflict-free calendar slots. Every accepted mutation is an event
//! appended to a per-tenant WAL and broadcast to LISTEN subscribers.

pub mod auth;
pub mod compactor;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
