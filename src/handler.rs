//! Handler contract implemented by the directory back ends and middlewares.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::entry::Entry;
use crate::error::Result;
use crate::ldap::proto::{Control, ResultCode, SearchRequest};

/// Per-connection context handed to handlers: the peer address (anonymous
/// bind policy) and a cancellation token that fires when the connection goes
/// away, stopping any paged-search producer still attached to it.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub peer_addr: SocketAddr,
    pub cancel: CancellationToken,
}

impl ConnInfo {
    pub fn is_loopback(&self) -> bool {
        self.peer_addr.ip().is_loopback()
    }

    /// A detached context for tooling and tests.
    pub fn local() -> Self {
        ConnInfo {
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub entries: Vec<Entry>,
    pub controls: Vec<Control>,
    pub result_code: ResultCode,
    pub diagnostic: String,
}

impl SearchResult {
    pub fn empty(result_code: ResultCode) -> Self {
        SearchResult {
            entries: Vec::new(),
            controls: Vec::new(),
            result_code,
            diagnostic: String::new(),
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Simple bind. Returns the wire result code; Err is reserved for
    /// internal failures which the dispatcher reports as operationsError.
    async fn bind(&self, bind_dn: &str, password: &str, conn: &ConnInfo) -> Result<ResultCode>;

    async fn search(
        &self,
        bound_dn: &str,
        request: &SearchRequest,
        conn: &ConnInfo,
    ) -> Result<SearchResult>;

    /// Called when the connection that bound this DN goes away.
    async fn close(&self, _bound_dn: &str, _conn: &ConnInfo) {}

    /// Re-read the backing source, swapping state atomically. Back ends
    /// without a reloadable source treat this as a no-op.
    async fn reload(&self) -> Result<()> {
        Ok(())
    }
}

/// A middleware wraps the next handler, taking over the requests it wants
/// (the LDIF config overlay answers bind for its own DNs only).
pub trait Middleware {
    fn with_handler(self, next: Arc<dyn Handler>) -> Arc<dyn Handler>;
}
