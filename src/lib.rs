//! idmd: a lightweight, read-mostly LDAP v3 identity management daemon.
//!
//! The crate is split into the wire-protocol engine ([`ldap`]), the
//! LDIF-backed in-memory directory ([`ldif`]), the persistent directory
//! store ([`store`]) and the glue that composes them into a server
//! ([`server`]).

pub mod config;
pub mod dn;
pub mod entry;
pub mod error;
pub mod handler;
pub mod ldap;
pub mod ldif;
pub mod metrics;
pub mod password;
pub mod server;
pub mod store;
pub mod tls;
