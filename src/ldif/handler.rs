//! Read-only Handler over an LDIF source.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dn;
use crate::error::{Error, Result};
use crate::handler::{ConnInfo, Handler, SearchResult};
use crate::ldap::filter::Filter;
use crate::ldap::proto::{Control, ResultCode, SearchRequest};
use crate::ldif::entry::LdifEntry;
use crate::ldif::{self, LdifData, LdifOptions};
use crate::password::Verifier;

/// How long a paged-search producer waits for the consumer before giving up.
const PUMP_SEND_TIMEOUT: Duration = Duration::from_secs(60);

pub struct LdifHandler {
    source: PathBuf,
    options: LdifOptions,
    /// Canonical form of the configured base DN.
    base_dn: String,
    verifier: Verifier,
    data: RwLock<Arc<LdifData>>,
    pagings: Arc<DashMap<String, PagingSession>>,
}

#[derive(Clone)]
struct PagingSession {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<LdifEntry>>>>,
    cancel: CancellationToken,
}

impl LdifHandler {
    pub fn new(source: PathBuf, options: LdifOptions, verifier: Verifier) -> Result<Self> {
        if options.base_dn.is_empty() {
            return Err(Error::Config("base dn is empty".to_string()));
        }
        let base_dn = dn::normalize(&options.base_dn)?;

        let entries = ldif::load_entries(&source, &options)?;
        let entries_count = entries.len();
        let data = ldif::build_data(entries, true)?;
        info!(
            entries_count,
            tree_length = data.tree.len(),
            base_dn = %base_dn,
            "loaded LDIF from file"
        );

        Ok(LdifHandler {
            source,
            options,
            base_dn,
            verifier,
            data: RwLock::new(Arc::new(data)),
            pagings: Arc::new(DashMap::new()),
        })
    }

    fn snapshot(&self) -> Arc<LdifData> {
        self.data.read().expect("ldif data lock").clone()
    }

    /// Anonymous-bind policy and base-DN containment, shared by bind and
    /// search.
    fn validate_bind_dn(
        &self,
        canonical_bind_dn: &str,
        conn: &ConnInfo,
    ) -> std::result::Result<(), &'static str> {
        if canonical_bind_dn.is_empty() {
            if self.options.allow_local_anonymous_bind {
                if conn.is_loopback() {
                    return Ok(());
                }
                return Err("anonymous BindDN rejected");
            }
            return Err("anonymous BindDN not allowed");
        }
        if canonical_bind_dn.ends_with(&self.base_dn) {
            return Ok(());
        }
        Err("the BindDN is not in our BaseDN")
    }

    fn spawn_pump(
        &self,
        data: Arc<LdifData>,
        base_dn: String,
        filter: Filter,
        tx: mpsc::Sender<Arc<LdifEntry>>,
        cancel: CancellationToken,
        paging_cookie: Option<String>,
    ) {
        tokio::spawn(async move {
            let candidates = match data.index.plan(&filter) {
                Some(candidates) => candidates,
                None => {
                    warn!(filter = %filter, "ldap search filter does not match any index, using slow walk");
                    data.tree.walk_suffix(&base_dn).cloned().collect()
                }
            };

            for entry in candidates {
                tokio::select! {
                    sent = tx.send(entry) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!(paging_cookie = paging_cookie.as_deref().unwrap_or(""),
                               "ldap search paging pump cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(PUMP_SEND_TIMEOUT) => {
                        warn!(paging_cookie = paging_cookie.as_deref().unwrap_or(""),
                              "ldap search paging pump timeout");
                        return;
                    }
                }
            }
            debug!(paging_cookie = paging_cookie.as_deref().unwrap_or(""),
                   "ldap search paging pump ended");
        });
    }

    /// Drain candidates, applying filter, scope and attribute projection.
    /// Returns the gathered entries and whether the producer finished.
    async fn drain(
        &self,
        rx: &mut mpsc::Receiver<Arc<LdifEntry>>,
        request: &SearchRequest,
        base_dn: &str,
        page_size: Option<u32>,
    ) -> (Vec<crate::entry::Entry>, bool) {
        let mut entries = Vec::new();
        loop {
            if let Some(limit) = page_size {
                if entries.len() as u32 >= limit {
                    return (entries, false);
                }
            }
            if request.size_limit > 0 && entries.len() as u32 >= request.size_limit {
                return (entries, false);
            }
            match rx.recv().await {
                Some(candidate) => {
                    if !request.filter.matches(&candidate.entry) {
                        continue;
                    }
                    if !dn::matches_scope(&candidate.canonical_dn, base_dn, request.scope) {
                        continue;
                    }
                    entries.push(candidate.entry.project(&request.attributes));
                }
                None => return (entries, true),
            }
        }
    }
}

fn new_paging_cookie() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[async_trait]
impl Handler for LdifHandler {
    async fn bind(&self, bind_dn: &str, password: &str, conn: &ConnInfo) -> Result<ResultCode> {
        let canonical = if bind_dn.is_empty() {
            String::new()
        } else {
            match dn::normalize(bind_dn) {
                Ok(canonical) => canonical,
                Err(_) => return Ok(ResultCode::InvalidDnSyntax),
            }
        };

        if let Err(reason) = self.validate_bind_dn(&canonical, conn) {
            debug!(bind_dn = %bind_dn, remote_addr = %conn.peer_addr, reason,
                   "ldap bind request BindDN validation failed");
            return Ok(ResultCode::InsufficientAccessRights);
        }

        if canonical.is_empty() {
            debug!(remote_addr = %conn.peer_addr, "ldap anonymous bind request");
            return Ok(if password.is_empty() {
                ResultCode::Success
            } else {
                ResultCode::InvalidCredentials
            });
        }

        let data = self.snapshot();
        let entry = match data.tree.get(&canonical) {
            Some(entry) => entry,
            None => {
                debug!(bind_dn = %bind_dn, remote_addr = %conn.peer_addr, "ldap bind user not found");
                return Ok(ResultCode::InvalidCredentials);
            }
        };

        match entry.validate_password(&self.verifier, password) {
            Ok(true) => Ok(ResultCode::Success),
            Ok(false) => {
                debug!(bind_dn = %bind_dn, remote_addr = %conn.peer_addr, "ldap bind credentials error");
                Ok(ResultCode::InvalidCredentials)
            }
            Err(e) => {
                warn!(bind_dn = %bind_dn, error = %e, "stored password hash cannot be verified");
                Ok(ResultCode::OperationsError)
            }
        }
    }

    async fn search(
        &self,
        bound_dn: &str,
        request: &SearchRequest,
        conn: &ConnInfo,
    ) -> Result<SearchResult> {
        let data = self.snapshot();

        let canonical_bound = if bound_dn.is_empty() {
            String::new()
        } else {
            match dn::normalize(bound_dn) {
                Ok(canonical) => canonical,
                Err(_) => return Ok(SearchResult::empty(ResultCode::InsufficientAccessRights)),
            }
        };

        debug!(
            bind_dn = %canonical_bound,
            search_base_dn = %request.base_dn,
            remote_addr = %conn.peer_addr,
            filter = %request.filter,
            size_limit = request.size_limit,
            "ldap search request"
        );

        if let Err(reason) = self.validate_bind_dn(&canonical_bound, conn) {
            debug!(reason, "ldap search request BindDN validation failed");
            return Ok(SearchResult::empty(ResultCode::InsufficientAccessRights));
        }

        let base_dn = match dn::normalize(&request.base_dn) {
            Ok(base_dn) => base_dn,
            Err(_) => return Ok(SearchResult::empty(ResultCode::InvalidDnSyntax)),
        };
        if !base_dn.ends_with(&self.base_dn) {
            return Ok(SearchResult {
                diagnostic: format!("search base is not in our BaseDN {}", self.base_dn),
                ..SearchResult::empty(ResultCode::InsufficientAccessRights)
            });
        }

        // Paging control, unless the page would not be smaller than the
        // request's own size limit.
        let mut paging = request.controls.iter().find_map(|c| match c {
            Control::PagedResults { size, cookie } => Some((*size, cookie.clone())),
            _ => None,
        });
        if let Some((size, _)) = paging {
            if request.size_limit > 0 && size >= request.size_limit {
                paging = None;
            }
        }

        match paging {
            None => {
                let (tx, mut rx) = mpsc::channel(1);
                self.spawn_pump(
                    data,
                    base_dn.clone(),
                    request.filter.clone(),
                    tx,
                    conn.cancel.child_token(),
                    None,
                );
                let (entries, _) = self.drain(&mut rx, request, &base_dn, None).await;
                Ok(SearchResult {
                    entries,
                    controls: Vec::new(),
                    result_code: ResultCode::Success,
                    diagnostic: String::new(),
                })
            }

            Some((page_size, cookie)) if cookie.is_empty() => {
                // Fresh paging session.
                let cookie = new_paging_cookie();
                let (tx, rx) = mpsc::channel(1);
                let session = PagingSession {
                    rx: Arc::new(tokio::sync::Mutex::new(rx)),
                    cancel: conn.cancel.child_token(),
                };
                self.pagings.insert(cookie.clone(), session.clone());
                debug!(paging_cookie = %cookie, "ldap search paging pump start");
                self.spawn_pump(
                    data,
                    base_dn.clone(),
                    request.filter.clone(),
                    tx,
                    session.cancel.clone(),
                    Some(cookie.clone()),
                );

                let mut rx = session.rx.lock().await;
                let (entries, drained) = self
                    .drain(&mut rx, request, &base_dn, Some(page_size))
                    .await;
                drop(rx);

                let response_cookie = if drained {
                    self.pagings.remove(&cookie);
                    Vec::new()
                } else {
                    cookie.into_bytes()
                };
                Ok(SearchResult {
                    entries,
                    controls: vec![Control::PagedResults {
                        size: 0,
                        cookie: response_cookie,
                    }],
                    result_code: ResultCode::Success,
                    diagnostic: String::new(),
                })
            }

            Some((page_size, cookie)) => {
                let cookie = String::from_utf8_lossy(&cookie).into_owned();
                let session = match self.pagings.get(&cookie) {
                    Some(session) => session.clone(),
                    None => {
                        return Ok(SearchResult::empty(ResultCode::UnwillingToPerform));
                    }
                };

                if page_size == 0 {
                    // Zero page size with a live cookie abandons the session.
                    debug!(paging_cookie = %cookie, "ldap search paging pump abandon");
                    session.cancel.cancel();
                    self.pagings.remove(&cookie);
                    return Ok(SearchResult {
                        entries: Vec::new(),
                        controls: vec![Control::PagedResults {
                            size: 0,
                            cookie: Vec::new(),
                        }],
                        result_code: ResultCode::Success,
                        diagnostic: String::new(),
                    });
                }

                debug!(paging_cookie = %cookie, "ldap search paging pump continue");
                let mut rx = session.rx.lock().await;
                let (entries, drained) = self
                    .drain(&mut rx, request, &base_dn, Some(page_size))
                    .await;
                drop(rx);

                let response_cookie = if drained {
                    self.pagings.remove(&cookie);
                    Vec::new()
                } else {
                    cookie.into_bytes()
                };
                Ok(SearchResult {
                    entries,
                    controls: vec![Control::PagedResults {
                        size: 0,
                        cookie: response_cookie,
                    }],
                    result_code: ResultCode::Success,
                    diagnostic: String::new(),
                })
            }
        }
    }

    async fn reload(&self) -> Result<()> {
        let entries = ldif::load_entries(&self.source, &self.options)?;
        let entries_count = entries.len();
        let data = ldif::build_data(entries, true)?;
        info!(
            entries_count,
            tree_length = data.tree.len(),
            "reloaded LDIF from file"
        );
        *self.data.write().expect("ldif data lock") = Arc::new(data);
        Ok(())
    }
}
