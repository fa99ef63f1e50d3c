//! LDAP wire-protocol engine: BER codec, message model, filters, extended
//! operations and the connection dispatcher.

pub mod codec;
pub mod exop;
pub mod filter;
pub mod proto;
pub mod server;
pub mod stats;

pub use server::LdapServer;
pub use stats::Stats;
