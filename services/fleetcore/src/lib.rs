//! Trust and consistency core for a multi-tenant bot platform.
//!
//! # Purpose
//! Keeps each tenant's data in its own Postgres namespace, encrypts tenant
//! credentials at rest, throttles abusive callers, records security-relevant
//! actions, and provides the transactional helpers that keep concurrent
//! writes correct.
//!
//! # Notes
//! Components are independent and wired together in [`platform::Platform`].
//! Storage-facing components sit behind traits with in-memory and real
//! backends so they can be tested without infrastructure.
pub mod audit;
pub mod config;
pub mod consistency;
pub mod crypto;
pub mod db;
pub mod ident;
pub mod observability;
pub mod platform;
pub mod ratelimit;
pub mod schema;
