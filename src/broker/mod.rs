//! Broker client implementations.
//!
//! Each implementation provides the domain traits in
//! [`domain`](crate::domain) on top of a concrete broker. Only the in-memory
//! reference broker ships with this crate.

pub mod memory;
