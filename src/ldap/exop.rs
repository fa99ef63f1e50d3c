//! Extended-operation registry.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::ldap::proto::{ExtendedRequest, ResultCode};

/// Password Modify Extended Operation (RFC 3062).
pub const PASSWORD_MODIFY_OID: &str = "1.3.6.1.4.1.4203.1.11.1";
/// WhoAmI (RFC 4532).
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

const TAG_REQ_IDENTITY: u64 = 0;
const TAG_REQ_OLD_PW: u64 = 1;
const TAG_REQ_NEW_PW: u64 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PasswordModifyRequest {
    pub user_identity: String,
    pub old_password: String,
    pub new_password: String,
}

/// Outcome of an extended operation.
#[derive(Debug, Clone)]
pub struct ExopOutcome {
    pub result_code: ResultCode,
    pub diagnostic: String,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

impl ExopOutcome {
    fn code(result_code: ResultCode, diagnostic: &str) -> Self {
        ExopOutcome {
            result_code,
            diagnostic: diagnostic.to_string(),
            response_name: None,
            response_value: None,
        }
    }
}

type ExopFn = fn(&ExtendedRequest, &str) -> ExopOutcome;

pub struct ExopRegistry {
    ops: HashMap<String, ExopFn>,
}

impl ExopRegistry {
    pub fn new() -> Self {
        ExopRegistry {
            ops: HashMap::new(),
        }
    }

    pub fn register(&mut self, oid: &str, f: ExopFn) {
        self.ops.insert(oid.to_string(), f);
    }

    pub fn handle(&self, request: &ExtendedRequest, bound_dn: &str) -> ExopOutcome {
        match self.ops.get(&request.oid) {
            Some(f) => f(request, bound_dn),
            None => ExopOutcome::code(
                ResultCode::UnwillingToPerform,
                "unsupported extended operation",
            ),
        }
    }
}

impl Default for ExopRegistry {
    fn default() -> Self {
        let mut registry = ExopRegistry::new();
        registry.register(PASSWORD_MODIFY_OID, handle_password_modify);
        registry.register(WHOAMI_OID, handle_whoami);
        registry
    }
}

/// Parse the Password Modify request body. An absent or empty body is valid
/// and means "generate a new password for the current user".
pub fn parse_password_modify(value: Option<&[u8]>) -> Result<PasswordModifyRequest> {
    let mut req = PasswordModifyRequest::default();

    let bytes = match value {
        Some(bytes) if !bytes.is_empty() => bytes,
        _ => return Ok(req),
    };

    let (_, root) = lber::parse::parse_tag(bytes)
        .map_err(|_| Error::Protocol("malformed password modify request".to_string()))?;
    let children = root
        .expect_constructed()
        .ok_or_else(|| Error::Protocol("malformed password modify request".to_string()))?;
    if children.len() > 3 {
        return Err(Error::Protocol("invalid password modify request".to_string()));
    }

    for child in children {
        if child.class != lber::common::TagClass::Context {
            return Err(Error::Protocol("invalid password modify request".to_string()));
        }
        let id = child.id;
        let value = child
            .expect_primitive()
            .ok_or_else(|| Error::Protocol("invalid password modify request".to_string()))?;
        let value = String::from_utf8_lossy(&value).into_owned();
        match id {
            TAG_REQ_IDENTITY => req.user_identity = value,
            TAG_REQ_OLD_PW => req.old_password = value,
            TAG_REQ_NEW_PW => req.new_password = value,
            _ => return Err(Error::Protocol("invalid password modify request".to_string())),
        }
    }
    Ok(req)
}

fn handle_password_modify(request: &ExtendedRequest, bound_dn: &str) -> ExopOutcome {
    if bound_dn.is_empty() {
        return ExopOutcome::code(ResultCode::UnwillingToPerform, "authentication required");
    }

    let mut req = match parse_password_modify(request.value.as_deref()) {
        Ok(req) => req,
        Err(_) => return ExopOutcome::code(ResultCode::ProtocolError, "invalid request"),
    };

    // An empty UserIdentity is a request to update the bound user's own
    // password.
    if req.user_identity.is_empty() {
        req.user_identity = bound_dn.to_string();
    }
    debug!(user = %req.user_identity, "password modify extended operation");
    ExopOutcome::code(ResultCode::Success, "")
}

fn handle_whoami(_request: &ExtendedRequest, bound_dn: &str) -> ExopOutcome {
    // Anonymous connections get an empty authorization identity, not an
    // error.
    let authz_id = if bound_dn.is_empty() {
        String::new()
    } else {
        format!("dn:{bound_dn}")
    };
    ExopOutcome {
        result_code: ResultCode::Success,
        diagnostic: String::new(),
        response_name: None,
        response_value: Some(authz_id.into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lber::structures::{ASNTag, OctetString, Sequence, Tag};

    fn encode_pwmod(identity: Option<&str>, old: Option<&str>, new: Option<&str>) -> Vec<u8> {
        let mut inner = Vec::new();
        for (id, value) in [
            (TAG_REQ_IDENTITY, identity),
            (TAG_REQ_OLD_PW, old),
            (TAG_REQ_NEW_PW, new),
        ] {
            if let Some(value) = value {
                inner.push(Tag::OctetString(OctetString {
                    class: lber::common::TagClass::Context,
                    id,
                    inner: value.as_bytes().to_vec(),
                }));
            }
        }
        let mut buf = bytes::BytesMut::new();
        lber::write::encode_into(
            &mut buf,
            Tag::Sequence(Sequence {
                inner,
                ..Default::default()
            })
            .into_structure(),
        )
        .unwrap();
        buf.to_vec()
    }

    #[test]
    fn empty_body_is_valid() {
        let req = parse_password_modify(None).unwrap();
        assert_eq!(req, PasswordModifyRequest::default());
    }

    #[test]
    fn parses_all_fields() {
        let bytes = encode_pwmod(Some("uid=alice,o=base"), Some("old"), Some("new"));
        let req = parse_password_modify(Some(&bytes)).unwrap();
        assert_eq!(req.user_identity, "uid=alice,o=base");
        assert_eq!(req.old_password, "old");
        assert_eq!(req.new_password, "new");
    }

    #[test]
    fn requires_authentication() {
        let request = ExtendedRequest {
            oid: PASSWORD_MODIFY_OID.to_string(),
            value: None,
        };
        let outcome = ExopRegistry::default().handle(&request, "");
        assert_eq!(outcome.result_code, ResultCode::UnwillingToPerform);
    }

    #[test]
    fn identity_defaults_to_bound_dn() {
        let bytes = encode_pwmod(None, Some("old"), Some("new"));
        let request = ExtendedRequest {
            oid: PASSWORD_MODIFY_OID.to_string(),
            value: Some(bytes),
        };
        let outcome = ExopRegistry::default().handle(&request, "uid=bound,o=base");
        assert_eq!(outcome.result_code, ResultCode::Success);
    }

    #[test]
    fn whoami_reports_bound_dn() {
        let request = ExtendedRequest {
            oid: WHOAMI_OID.to_string(),
            value: None,
        };
        let registry = ExopRegistry::default();
        let outcome = registry.handle(&request, "uid=alice,o=base");
        assert_eq!(
            outcome.response_value.as_deref(),
            Some(&b"dn:uid=alice,o=base"[..])
        );
        let outcome = registry.handle(&request, "");
        assert_eq!(outcome.response_value.as_deref(), Some(&b""[..]));
    }

    #[test]
    fn unknown_oid_is_refused() {
        let request = ExtendedRequest {
            oid: "1.2.3.4".to_string(),
            value: None,
        };
        let outcome = ExopRegistry::default().handle(&request, "uid=x,o=base");
        assert_eq!(outcome.result_code, ResultCode::UnwillingToPerform);
    }
}
