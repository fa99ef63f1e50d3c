//! Bind-only LDIF overlay.
//!
//! Service accounts used only for binding (replication users, app
//! credentials) can live in a separate LDIF file that never shows up in
//! search results. DNs found in the overlay bind against it; everything else
//! passes through to the wrapped handler.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::dn;
use crate::error::{Error, Result};
use crate::handler::{ConnInfo, Handler, Middleware, SearchResult};
use crate::ldap::proto::{ResultCode, SearchRequest};
use crate::ldif::{self, LdifData, LdifOptions};
use crate::password::Verifier;

pub struct LdifMiddleware {
    base_dn: String,
    data: Arc<LdifData>,
    verifier: Verifier,
}

impl LdifMiddleware {
    pub fn new(source: PathBuf, options: LdifOptions, verifier: Verifier) -> Result<Self> {
        if options.base_dn.is_empty() {
            return Err(Error::Config("base dn is empty".to_string()));
        }
        let base_dn = dn::normalize(&options.base_dn)?;

        let entries = ldif::load_entries(&source, &options)?;
        let entries_count = entries.len();
        // The overlay is consulted by exact DN only; no indexes needed.
        let data = ldif::build_data(entries, false)?;
        info!(entries_count, base_dn = %base_dn, source = %source.display(),
              "loaded LDIF bind overlay");

        Ok(LdifMiddleware {
            base_dn,
            data: Arc::new(data),
            verifier,
        })
    }
}

impl Middleware for LdifMiddleware {
    fn with_handler(self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(LdifMiddlewareHandler {
            middleware: self,
            next,
        })
    }
}

struct LdifMiddlewareHandler {
    middleware: LdifMiddleware,
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for LdifMiddlewareHandler {
    async fn bind(&self, bind_dn: &str, password: &str, conn: &ConnInfo) -> Result<ResultCode> {
        if bind_dn.is_empty() {
            return self.next.bind(bind_dn, password, conn).await;
        }

        let canonical = match dn::normalize(bind_dn) {
            Ok(canonical) => canonical,
            Err(_) => return self.next.bind(bind_dn, password, conn).await,
        };

        if let Some(entry) = self.middleware.data.tree.get(&canonical) {
            if !canonical.ends_with(&self.middleware.base_dn) {
                debug!(bind_dn = %canonical, remote_addr = %conn.peer_addr,
                       "overlay bind outside base DN");
                return Ok(ResultCode::InvalidCredentials);
            }
            return match entry.validate_password(&self.middleware.verifier, password) {
                Ok(true) => Ok(ResultCode::Success),
                Ok(false) => {
                    debug!(bind_dn = %canonical, remote_addr = %conn.peer_addr,
                           "overlay bind credentials error");
                    Ok(ResultCode::InvalidCredentials)
                }
                Err(e) => {
                    debug!(bind_dn = %canonical, error = %e, "overlay bind error");
                    Ok(ResultCode::OperationsError)
                }
            };
        }

        self.next.bind(bind_dn, password, conn).await
    }

    async fn search(
        &self,
        bound_dn: &str,
        request: &SearchRequest,
        conn: &ConnInfo,
    ) -> Result<SearchResult> {
        self.next.search(bound_dn, request, conn).await
    }

    async fn close(&self, bound_dn: &str, conn: &ConnInfo) {
        self.next.close(bound_dn, conn).await
    }

    async fn reload(&self) -> Result<()> {
        self.next.reload().await
    }
}
