//! Msgr API - HTTP side of the listener.
//!
//! This crate provides the cookie-jar authenticated HTTP client, the
//! credentials handed over by the login collaborator, and the batched
//! GraphQL query that yields the initial inbox cursor.

pub mod client;
pub mod credentials;
pub mod graphql;

// Re-export key types
pub use client::{ApiClient, GraphqlTransport, RetryConfig};
pub use credentials::Credentials;
pub use graphql::fetch_sequence_id;
