//! Handler over the persistent directory store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::dn;
use crate::error::{Error, Result};
use crate::handler::{ConnInfo, Handler, SearchResult};
use crate::ldap::proto::{ResultCode, SearchRequest};
use crate::password::Verifier;
use crate::store::db::{DirStore, StoreOptions, StoreScope};

#[derive(Debug, Clone, Default)]
pub struct StoreHandlerOptions {
    pub base_dn: String,
    pub allow_local_anonymous_bind: bool,
}

pub struct StoreHandler {
    store: Arc<DirStore>,
    base_dn: String,
    allow_local_anonymous_bind: bool,
    verifier: Verifier,
}

impl StoreHandler {
    pub fn new(dbfile: PathBuf, options: StoreHandlerOptions, verifier: Verifier) -> Result<Self> {
        if options.base_dn.is_empty() {
            return Err(Error::Config("base dn is empty".to_string()));
        }
        let base_dn = dn::normalize(&options.base_dn)?;
        let store = DirStore::open(&base_dn, &dbfile, StoreOptions::default())?;
        Ok(StoreHandler {
            store: Arc::new(store),
            base_dn,
            allow_local_anonymous_bind: options.allow_local_anonymous_bind,
            verifier,
        })
    }

    pub fn store(&self) -> Arc<DirStore> {
        self.store.clone()
    }

    fn validate_bind_dn(
        &self,
        canonical_bind_dn: &str,
        conn: &ConnInfo,
    ) -> std::result::Result<(), &'static str> {
        if canonical_bind_dn.is_empty() {
            if self.allow_local_anonymous_bind {
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
}

#[async_trait]
impl Handler for StoreHandler {
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
                   "bind BindDN validation failed");
            return Ok(ResultCode::InsufficientAccessRights);
        }

        if canonical.is_empty() {
            return Ok(if password.is_empty() {
                ResultCode::Success
            } else {
                ResultCode::InvalidCredentials
            });
        }

        let entries = match self.store.search(&canonical, StoreScope::BaseObject) {
            Ok(entries) => entries,
            Err(Error::EntryNotFound) => return Ok(ResultCode::InvalidCredentials),
            Err(e) => return Err(e),
        };
        let hash = entries
            .first()
            .and_then(|entry| entry.first_value("userPassword"));
        match hash {
            Some(hash) => match self.verifier.validate(password, hash) {
                Ok(true) => Ok(ResultCode::Success),
                Ok(false) => Ok(ResultCode::InvalidCredentials),
                Err(e) => {
                    warn!(bind_dn = %bind_dn, error = %e,
                          "stored password hash cannot be verified");
                    Ok(ResultCode::OperationsError)
                }
            },
            None => Ok(ResultCode::InvalidCredentials),
        }
    }

    async fn search(
        &self,
        bound_dn: &str,
        request: &SearchRequest,
        conn: &ConnInfo,
    ) -> Result<SearchResult> {
        let canonical_bound = if bound_dn.is_empty() {
            String::new()
        } else {
            match dn::normalize(bound_dn) {
                Ok(canonical) => canonical,
                Err(_) => return Ok(SearchResult::empty(ResultCode::InsufficientAccessRights)),
            }
        };
        if let Err(reason) = self.validate_bind_dn(&canonical_bound, conn) {
            debug!(reason, "search BindDN validation failed");
            return Ok(SearchResult::empty(ResultCode::InsufficientAccessRights));
        }

        let base_dn = match dn::normalize(&request.base_dn) {
            Ok(base_dn) => base_dn,
            Err(_) => return Ok(SearchResult::empty(ResultCode::InvalidDnSyntax)),
        };
        if !base_dn.ends_with(&self.base_dn) {
            return Ok(SearchResult::empty(ResultCode::InsufficientAccessRights));
        }

        let candidates = match self.store.search(&base_dn, request.scope.into()) {
            Ok(candidates) => candidates,
            Err(Error::EntryNotFound) => {
                return Ok(SearchResult::empty(ResultCode::NoSuchObject))
            }
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        for candidate in candidates {
            if !request.filter.matches(&candidate) {
                continue;
            }
            entries.push(candidate.project(&request.attributes));
            if request.size_limit > 0 && entries.len() as u32 >= request.size_limit {
                break;
            }
        }

        Ok(SearchResult {
            entries,
            controls: Vec::new(),
            result_code: ResultCode::Success,
            diagnostic: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::ldap::filter::Filter;
    use crate::ldap::proto::SearchScope;

    fn handler(dir: &tempfile::TempDir) -> StoreHandler {
        let options = StoreHandlerOptions {
            base_dn: "o=base".to_string(),
            allow_local_anonymous_bind: true,
        };
        let handler = StoreHandler::new(
            dir.path().join("handler.db"),
            options,
            Verifier::default(),
        )
        .unwrap();

        let store = handler.store();
        store
            .entry_put(&Entry::with_attributes(
                "o=base",
                &[("o", &["base"][..]), ("objectClass", &["organization"][..])],
            ))
            .unwrap();
        store
            .entry_put(&Entry::with_attributes(
                "uid=alice,o=base",
                &[
                    ("uid", &["alice"][..]),
                    ("objectClass", &["inetOrgPerson"][..]),
                    ("userPassword", &["secret"][..]),
                ],
            ))
            .unwrap();
        handler
    }

    fn request(base: &str, scope: SearchScope, filter: &str) -> SearchRequest {
        SearchRequest {
            base_dn: base.to_string(),
            scope,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: Filter::parse(filter).unwrap(),
            attributes: Vec::new(),
            controls: Vec::new(),
        }
    }

    #[tokio::test]
    async fn bind_verifies_stored_password() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(&dir);
        let conn = ConnInfo::local();

        let code = handler
            .bind("uid=alice,o=base", "secret", &conn)
            .await
            .unwrap();
        assert_eq!(code, ResultCode::Success);

        let code = handler
            .bind("uid=alice,o=base", "wrong", &conn)
            .await
            .unwrap();
        assert_eq!(code, ResultCode::InvalidCredentials);

        let code = handler
            .bind("uid=nobody,o=base", "secret", &conn)
            .await
            .unwrap();
        assert_eq!(code, ResultCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn search_filters_and_hides_password() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(&dir);
        let conn = ConnInfo::local();

        let result = handler
            .search(
                "",
                &request("o=base", SearchScope::WholeSubtree, "(uid=alice)"),
                &conn,
            )
            .await
            .unwrap();
        assert_eq!(result.entries.len(), 1);
        assert!(result.entries[0].attribute("userPassword").is_none());
    }

    #[tokio::test]
    async fn missing_base_is_no_such_object() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(&dir);
        let result = handler
            .search(
                "",
                &request("ou=missing,o=base", SearchScope::WholeSubtree, "(uid=*)"),
                &ConnInfo::local(),
            )
            .await
            .unwrap();
        assert_eq!(result.result_code, ResultCode::NoSuchObject);
    }
}
