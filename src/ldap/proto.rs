//! LDAP v3 message model on top of BER structures.
//!
//! Decoding accepts one BER element (the LDAPMessage SEQUENCE) and produces
//! the typed request model; encoding builds response PDUs as `lber` tags.

use lber::common::TagClass;
use lber::structure::{StructureTag, PL};
use lber::structures::{ASNTag, Enumerated, Integer, OctetString, Sequence, Set, Tag};

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::ldap::filter::Filter;

pub const CONTROL_PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// Application tags of RFC 4511.
pub mod app {
    pub const BIND_REQUEST: u64 = 0;
    pub const BIND_RESPONSE: u64 = 1;
    pub const UNBIND_REQUEST: u64 = 2;
    pub const SEARCH_REQUEST: u64 = 3;
    pub const SEARCH_RESULT_ENTRY: u64 = 4;
    pub const SEARCH_RESULT_DONE: u64 = 5;
    pub const EXTENDED_REQUEST: u64 = 23;
    pub const EXTENDED_RESPONSE: u64 = 24;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    AuthMethodNotSupported = 7,
    UnavailableCriticalExtension = 12,
    NoSuchAttribute = 16,
    AttributeOrValueExists = 20,
    NoSuchObject = 32,
    InvalidDnSyntax = 34,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Unavailable = 52,
    UnwillingToPerform = 53,
    NotAllowedOnNonLeaf = 66,
    NotAllowedOnRdn = 67,
    EntryAlreadyExists = 68,
}

impl ResultCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject,
    SingleLevel,
    WholeSubtree,
}

impl TryFrom<i64> for SearchScope {
    type Error = Error;

    fn try_from(v: i64) -> Result<Self> {
        match v {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            other => Err(Error::Protocol(format!("invalid search scope {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuth {
    Simple(String),
    Sasl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i64,
    pub dn: String,
    pub auth: BindAuth,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: SearchScope,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
    pub controls: Vec<Control>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub oid: String,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    PagedResults { size: u32, cookie: Vec<u8> },
    Unknown { oid: String, criticality: bool },
}

impl Control {
    pub fn is_critical_unknown(&self) -> bool {
        matches!(
            self,
            Control::Unknown {
                criticality: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    UnbindRequest,
    SearchRequest(SearchRequest),
    ExtendedRequest(ExtendedRequest),
    Other { tag: u64 },
}

#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: i64,
    pub op: ProtocolOp,
    pub controls: Vec<Control>,
}

/// Big-endian two's-complement integer from BER content bytes.
pub fn int_from_bytes(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(Error::Protocol("invalid INTEGER length".to_string()));
    }
    let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in bytes {
        value = (value << 8) | i64::from(b);
    }
    Ok(value)
}

fn expect_primitive(tag: StructureTag, what: &str) -> Result<Vec<u8>> {
    tag.expect_primitive()
        .ok_or_else(|| Error::Protocol(format!("expected primitive {what}")))
}

fn expect_string(tag: StructureTag, what: &str) -> Result<String> {
    let bytes = expect_primitive(tag, what)?;
    String::from_utf8(bytes).map_err(|_| Error::Protocol(format!("{what} is not UTF-8")))
}

fn expect_int(tag: StructureTag, what: &str) -> Result<i64> {
    int_from_bytes(&expect_primitive(tag, what)?)
}

/// Decode one LDAPMessage.
///
/// Fails with a protocol error if the outer structure has fewer than two
/// children, the message-id is not an INTEGER, or the protocol-op is not
/// application-class.
pub fn parse_message(root: StructureTag) -> Result<LdapMessage> {
    if root.class != TagClass::Universal || root.id != 16 {
        return Err(Error::Protocol("LDAPMessage is not a SEQUENCE".to_string()));
    }
    let mut children = root
        .expect_constructed()
        .ok_or_else(|| Error::Protocol("LDAPMessage is not constructed".to_string()))?
        .into_iter();

    let id_tag = children
        .next()
        .ok_or_else(|| Error::Protocol("missing message id".to_string()))?;
    if id_tag.class != TagClass::Universal || id_tag.id != 2 {
        return Err(Error::Protocol("malformed message id".to_string()));
    }
    let message_id = expect_int(id_tag, "message id")?;

    let op_tag = children
        .next()
        .ok_or_else(|| Error::Protocol("missing protocol op".to_string()))?;
    if op_tag.class != TagClass::Application {
        return Err(Error::Protocol(
            "protocol op is not application-class".to_string(),
        ));
    }

    let mut controls = Vec::new();
    if let Some(controls_tag) = children.next() {
        if controls_tag.class == TagClass::Context && controls_tag.id == 0 {
            for child in controls_tag.expect_constructed().unwrap_or_default() {
                controls.push(parse_control(child)?);
            }
        }
    }

    let op = parse_protocol_op(op_tag)?;
    Ok(LdapMessage {
        message_id,
        op,
        controls,
    })
}

fn parse_protocol_op(op: StructureTag) -> Result<ProtocolOp> {
    match op.id {
        app::BIND_REQUEST => parse_bind_request(op).map(ProtocolOp::BindRequest),
        app::UNBIND_REQUEST => Ok(ProtocolOp::UnbindRequest),
        app::SEARCH_REQUEST => parse_search_request(op).map(ProtocolOp::SearchRequest),
        app::EXTENDED_REQUEST => parse_extended_request(op).map(ProtocolOp::ExtendedRequest),
        tag => Ok(ProtocolOp::Other { tag }),
    }
}

fn parse_bind_request(op: StructureTag) -> Result<BindRequest> {
    let mut children = op
        .expect_constructed()
        .ok_or_else(|| Error::Protocol("bind request is not constructed".to_string()))?
        .into_iter();

    let version = expect_int(
        children
            .next()
            .ok_or_else(|| Error::Protocol("bind request missing version".to_string()))?,
        "bind version",
    )?;
    let dn = expect_string(
        children
            .next()
            .ok_or_else(|| Error::Protocol("bind request missing name".to_string()))?,
        "bind dn",
    )?;
    let auth_tag = children
        .next()
        .ok_or_else(|| Error::Protocol("bind request missing authentication".to_string()))?;
    let auth = match (auth_tag.class, auth_tag.id) {
        (TagClass::Context, 0) => {
            BindAuth::Simple(expect_string(auth_tag, "simple password")?)
        }
        (TagClass::Context, 3) => BindAuth::Sasl,
        _ => {
            return Err(Error::Protocol(
                "unknown bind authentication choice".to_string(),
            ))
        }
    };

    Ok(BindRequest { version, dn, auth })
}

fn parse_search_request(op: StructureTag) -> Result<SearchRequest> {
    let mut children = op
        .expect_constructed()
        .ok_or_else(|| Error::Protocol("search request is not constructed".to_string()))?
        .into_iter();

    let mut next = |what: &str| {
        children
            .next()
            .ok_or_else(|| Error::Protocol(format!("search request missing {what}")))
    };

    let base_dn = expect_string(next("base object")?, "base object")?;
    let scope = SearchScope::try_from(expect_int(next("scope")?, "scope")?)?;
    let _deref = expect_int(next("deref aliases")?, "deref aliases")?;
    let size_limit = expect_int(next("size limit")?, "size limit")?.max(0) as u32;
    let time_limit = expect_int(next("time limit")?, "time limit")?.max(0) as u32;
    let types_only = expect_primitive(next("types only")?, "types only")?
        .first()
        .map(|b| *b != 0)
        .unwrap_or(false);
    let filter = Filter::from_tag(next("filter")?)?;

    let mut attributes = Vec::new();
    if let Some(attrs_tag) = children.next() {
        for attr in attrs_tag.expect_constructed().unwrap_or_default() {
            attributes.push(expect_string(attr, "attribute selector")?);
        }
    }

    Ok(SearchRequest {
        base_dn,
        scope,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
        controls: Vec::new(),
    })
}

fn parse_extended_request(op: StructureTag) -> Result<ExtendedRequest> {
    let mut oid = None;
    let mut value = None;
    for child in op
        .expect_constructed()
        .ok_or_else(|| Error::Protocol("extended request is not constructed".to_string()))?
    {
        match (child.class, child.id) {
            (TagClass::Context, 0) => {
                oid = Some(expect_string(child, "request name")?);
            }
            (TagClass::Context, 1) => {
                value = Some(expect_primitive(child, "request value")?);
            }
            _ => {}
        }
    }
    Ok(ExtendedRequest {
        oid: oid.ok_or_else(|| Error::Protocol("extended request missing OID".to_string()))?,
        value,
    })
}

fn parse_control(tag: StructureTag) -> Result<Control> {
    let mut children = tag
        .expect_constructed()
        .ok_or_else(|| Error::Protocol("control is not constructed".to_string()))?
        .into_iter();

    let oid = expect_string(
        children
            .next()
            .ok_or_else(|| Error::Protocol("control missing type".to_string()))?,
        "control type",
    )?;

    let mut criticality = false;
    let mut value: Option<Vec<u8>> = None;
    for child in children {
        match child.id {
            1 if child.class == TagClass::Universal => {
                criticality = expect_primitive(child, "criticality")?
                    .first()
                    .map(|b| *b != 0)
                    .unwrap_or(false);
            }
            4 if child.class == TagClass::Universal => {
                value = Some(expect_primitive(child, "control value")?);
            }
            _ => {}
        }
    }

    if oid == CONTROL_PAGED_RESULTS_OID {
        let raw = value.unwrap_or_default();
        let (_, inner) = lber::parse::parse_tag(&raw)
            .map_err(|_| Error::Protocol("malformed paged results control".to_string()))?;
        let mut parts = inner
            .expect_constructed()
            .ok_or_else(|| Error::Protocol("malformed paged results control".to_string()))?
            .into_iter();
        let size = expect_int(
            parts
                .next()
                .ok_or_else(|| Error::Protocol("paged control missing size".to_string()))?,
            "page size",
        )?
        .max(0) as u32;
        let cookie = expect_primitive(
            parts
                .next()
                .ok_or_else(|| Error::Protocol("paged control missing cookie".to_string()))?,
            "paging cookie",
        )?;
        return Ok(Control::PagedResults { size, cookie });
    }

    Ok(Control::Unknown { oid, criticality })
}

fn octet_string(value: impl Into<Vec<u8>>) -> Tag {
    Tag::OctetString(OctetString {
        inner: value.into(),
        ..Default::default()
    })
}

fn ldap_result(code: ResultCode, matched_dn: &str, diagnostic: &str) -> Vec<Tag> {
    vec![
        Tag::Enumerated(Enumerated {
            inner: i64::from(code.code()),
            ..Default::default()
        }),
        octet_string(matched_dn.as_bytes().to_vec()),
        octet_string(diagnostic.as_bytes().to_vec()),
    ]
}

fn message(message_id: i64, op: Tag, controls: Option<Tag>) -> StructureTag {
    let mut inner = vec![
        Tag::Integer(Integer {
            inner: message_id,
            ..Default::default()
        }),
        op,
    ];
    if let Some(controls) = controls {
        inner.push(controls);
    }
    Tag::Sequence(Sequence {
        inner,
        ..Default::default()
    })
    .into_structure()
}

fn encode_controls(controls: &[Control]) -> Option<Tag> {
    if controls.is_empty() {
        return None;
    }
    let encoded: Vec<Tag> = controls
        .iter()
        .map(|control| match control {
            Control::PagedResults { size, cookie } => {
                let inner = Tag::Sequence(Sequence {
                    inner: vec![
                        Tag::Integer(Integer {
                            inner: i64::from(*size),
                            ..Default::default()
                        }),
                        octet_string(cookie.clone()),
                    ],
                    ..Default::default()
                });
                let mut buf = bytes::BytesMut::new();
                lber::write::encode_into(&mut buf, inner.into_structure())
                    .expect("in-memory BER encoding cannot fail");
                Tag::Sequence(Sequence {
                    inner: vec![
                        octet_string(CONTROL_PAGED_RESULTS_OID.as_bytes().to_vec()),
                        octet_string(buf.to_vec()),
                    ],
                    ..Default::default()
                })
            }
            Control::Unknown { oid, .. } => Tag::Sequence(Sequence {
                inner: vec![octet_string(oid.as_bytes().to_vec())],
                ..Default::default()
            }),
        })
        .collect();
    Some(Tag::StructureTag(StructureTag {
        class: TagClass::Context,
        id: 0,
        payload: PL::C(encoded.into_iter().map(Tag::into_structure).collect()),
    }))
}

pub fn bind_response(message_id: i64, code: ResultCode, diagnostic: &str) -> StructureTag {
    message(
        message_id,
        Tag::Sequence(Sequence {
            class: TagClass::Application,
            id: app::BIND_RESPONSE,
            inner: ldap_result(code, "", diagnostic),
        }),
        None,
    )
}

pub fn search_result_entry(message_id: i64, entry: &Entry) -> StructureTag {
    let attributes = entry
        .attributes
        .iter()
        .map(|attr| {
            Tag::Sequence(Sequence {
                inner: vec![
                    octet_string(attr.name.as_bytes().to_vec()),
                    Tag::Set(Set {
                        inner: attr
                            .values
                            .iter()
                            .map(|v| octet_string(v.as_bytes().to_vec()))
                            .collect(),
                        ..Default::default()
                    }),
                ],
                ..Default::default()
            })
        })
        .collect();

    message(
        message_id,
        Tag::Sequence(Sequence {
            class: TagClass::Application,
            id: app::SEARCH_RESULT_ENTRY,
            inner: vec![
                octet_string(entry.dn.as_bytes().to_vec()),
                Tag::Sequence(Sequence {
                    inner: attributes,
                    ..Default::default()
                }),
            ],
        }),
        None,
    )
}

pub fn search_result_done(
    message_id: i64,
    code: ResultCode,
    diagnostic: &str,
    controls: &[Control],
) -> StructureTag {
    message(
        message_id,
        Tag::Sequence(Sequence {
            class: TagClass::Application,
            id: app::SEARCH_RESULT_DONE,
            inner: ldap_result(code, "", diagnostic),
        }),
        encode_controls(controls),
    )
}

pub fn extended_response(
    message_id: i64,
    code: ResultCode,
    diagnostic: &str,
    name: Option<&str>,
    value: Option<&[u8]>,
) -> StructureTag {
    let mut inner = ldap_result(code, "", diagnostic);
    if let Some(name) = name {
        inner.push(Tag::OctetString(OctetString {
            class: TagClass::Context,
            id: 10,
            inner: name.as_bytes().to_vec(),
        }));
    }
    if let Some(value) = value {
        inner.push(Tag::OctetString(OctetString {
            class: TagClass::Context,
            id: 11,
            inner: value.to_vec(),
        }));
    }
    message(
        message_id,
        Tag::Sequence(Sequence {
            class: TagClass::Application,
            id: app::EXTENDED_RESPONSE,
            inner,
        }),
        None,
    )
}

/// Generic result for an operation we refuse (unsupported op, fatal errors).
pub fn generic_response(
    message_id: i64,
    app_tag: u64,
    code: ResultCode,
    diagnostic: &str,
) -> StructureTag {
    message(
        message_id,
        Tag::Sequence(Sequence {
            class: TagClass::Application,
            id: app_tag,
            inner: ldap_result(code, "", diagnostic),
        }),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode(tag: StructureTag) -> Vec<u8> {
        let mut buf = BytesMut::new();
        lber::write::encode_into(&mut buf, tag).unwrap();
        buf.to_vec()
    }

    fn decode(bytes: &[u8]) -> LdapMessage {
        let (rest, tag) = lber::parse::parse_tag(bytes).unwrap();
        assert!(rest.is_empty());
        parse_message(tag).unwrap()
    }

    #[test]
    fn parse_anonymous_bind() {
        let message = [
            0x30, 0x0c, // SEQUENCE
            0x02, 0x01, 0x01, // messageID 1
            0x60, 0x07, // [APPLICATION 0]
            0x02, 0x01, 0x03, // version 3
            0x04, 0x00, // empty DN
            0x80, 0x00, // empty simple password
        ];
        let msg = decode(&message);
        assert_eq!(msg.message_id, 1);
        match msg.op {
            ProtocolOp::BindRequest(bind) => {
                assert_eq!(bind.version, 3);
                assert_eq!(bind.dn, "");
                assert_eq!(bind.auth, BindAuth::Simple(String::new()));
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn parse_simple_bind_with_credentials() {
        let dn = b"cn=john,ou=acme";
        let pw = b"password";
        let mut body = vec![0x02, 0x01, 0x03, 0x04, dn.len() as u8];
        body.extend_from_slice(dn);
        body.push(0x80);
        body.push(pw.len() as u8);
        body.extend_from_slice(pw);

        let mut message = vec![0x30, (3 + 2 + body.len()) as u8, 0x02, 0x01, 0x02];
        message.push(0x60);
        message.push(body.len() as u8);
        message.extend_from_slice(&body);

        let msg = decode(&message);
        match msg.op {
            ProtocolOp::BindRequest(bind) => {
                assert_eq!(bind.dn, "cn=john,ou=acme");
                assert_eq!(bind.auth, BindAuth::Simple("password".to_string()));
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_outer_structure() {
        // Message id missing.
        let (_, tag) = lber::parse::parse_tag(&[0x30, 0x00]).unwrap();
        assert!(parse_message(tag).is_err());

        // Protocol op not application class.
        let (_, tag) =
            lber::parse::parse_tag(&[0x30, 0x06, 0x02, 0x01, 0x01, 0x04, 0x01, 0x61]).unwrap();
        assert!(parse_message(tag).is_err());
    }

    #[test]
    fn bind_response_wire_shape() {
        let bytes = encode(bind_response(1, ResultCode::Success, ""));
        assert_eq!(bytes[0], 0x30);
        assert_eq!(bytes[2], 0x02);
        assert_eq!(bytes[4], 1); // message id
        assert_eq!(bytes[5], 0x61); // [APPLICATION 1]
        assert_eq!(bytes[9], 0); // result code
    }

    #[test]
    fn invalid_credentials_code_on_wire() {
        let bytes = encode(bind_response(2, ResultCode::InvalidCredentials, ""));
        assert_eq!(bytes[4], 2);
        assert_eq!(bytes[9], 49);
    }

    #[test]
    fn search_done_with_paging_control_roundtrip() {
        let done = search_result_done(
            7,
            ResultCode::Success,
            "",
            &[Control::PagedResults {
                size: 0,
                cookie: b"abc".to_vec(),
            }],
        );
        let bytes = encode(done);
        let (rest, tag) = lber::parse::parse_tag(&bytes).unwrap();
        assert!(rest.is_empty());

        // Re-parse the response as a message with a paged control attached.
        let children = tag.expect_constructed().unwrap();
        assert_eq!(children.len(), 3);
        let control = parse_control(
            children[2]
                .clone()
                .expect_constructed()
                .unwrap()
                .remove(0),
        )
        .unwrap();
        assert_eq!(
            control,
            Control::PagedResults {
                size: 0,
                cookie: b"abc".to_vec()
            }
        );
    }

    #[test]
    fn search_entry_encodes_attributes() {
        let entry = Entry::with_attributes(
            "uid=alice,o=base",
            &[("uid", &["alice"][..]), ("cn", &["Alice"][..])],
        );
        let bytes = encode(search_result_entry(3, &entry));
        let (_, tag) = lber::parse::parse_tag(&bytes).unwrap();
        let children = tag.expect_constructed().unwrap();
        assert_eq!(children[1].id, app::SEARCH_RESULT_ENTRY);
        let body = children[1].clone().expect_constructed().unwrap();
        assert_eq!(
            body[0].clone().expect_primitive().unwrap(),
            b"uid=alice,o=base".to_vec()
        );
    }
}
