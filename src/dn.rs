//! Distinguished name parsing, normalization and scope matching.
//!
//! The canonical (case-folded, re-escaped) form produced here is the lookup
//! key everywhere: suffix tree keys, dn2id keys, bind/search validation.
//! The human-typed form stays on the entry for output.

use crate::error::{Error, Result};
use crate::ldap::proto::SearchScope;

/// One attribute-value assertion of an RDN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ava {
    pub attr_type: String,
    pub value: Vec<u8>,
}

/// Parse an RFC 4514 string into RDNs of AVAs. Values are unescaped bytes.
pub fn parse(dn: &str) -> Result<Vec<Vec<Ava>>> {
    if dn.is_empty() {
        return Ok(Vec::new());
    }

    let bytes = dn.as_bytes();
    let mut rdns: Vec<Vec<Ava>> = Vec::new();
    let mut avas: Vec<Ava> = Vec::new();

    let mut attr_type = String::new();
    let mut value: Vec<u8> = Vec::new();
    let mut in_value = false;
    let mut i = 0;

    macro_rules! finish_ava {
        () => {{
            if !in_value || attr_type.is_empty() {
                return Err(Error::InvalidDnSyntax(dn.to_string()));
            }
            avas.push(Ava {
                attr_type: std::mem::take(&mut attr_type),
                value: std::mem::take(&mut value),
            });
            in_value = false;
        }};
    }

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\\' => {
                if !in_value {
                    return Err(Error::InvalidDnSyntax(dn.to_string()));
                }
                let first = *bytes
                    .get(i + 1)
                    .ok_or_else(|| Error::InvalidDnSyntax(dn.to_string()))?;
                if first.is_ascii_hexdigit() {
                    let second = *bytes
                        .get(i + 2)
                        .ok_or_else(|| Error::InvalidDnSyntax(dn.to_string()))?;
                    if !second.is_ascii_hexdigit() {
                        return Err(Error::InvalidDnSyntax(dn.to_string()));
                    }
                    let hex = [first, second];
                    let s = std::str::from_utf8(&hex).expect("hex digits are ascii");
                    value.push(u8::from_str_radix(s, 16).expect("checked hex digits"));
                    i += 3;
                } else {
                    value.push(first);
                    i += 2;
                }
            }
            b'=' if !in_value => {
                in_value = true;
                i += 1;
            }
            b',' | b'+' => {
                finish_ava!();
                if b == b',' {
                    rdns.push(std::mem::take(&mut avas));
                }
                i += 1;
                // Skip optional space after a separator.
                while i < bytes.len() && bytes[i] == b' ' {
                    i += 1;
                }
            }
            _ => {
                if in_value {
                    value.push(b);
                } else {
                    attr_type.push(b as char);
                }
                i += 1;
            }
        }
    }
    finish_ava!();
    rdns.push(avas);

    for rdn in &rdns {
        if rdn.is_empty() {
            return Err(Error::InvalidDnSyntax(dn.to_string()));
        }
    }
    Ok(rdns)
}

/// Canonical form: case-folded types and values, AVAs within an RDN sorted
/// by attribute type, RFC 4514 escaping reapplied. Idempotent.
pub fn normalize(dn: &str) -> Result<String> {
    let mut rdns = parse(dn)?;
    let mut out = String::new();
    for (r, rdn) in rdns.iter_mut().enumerate() {
        rdn.sort_by(|a, b| {
            a.attr_type
                .to_lowercase()
                .cmp(&b.attr_type.to_lowercase())
        });
        if r > 0 {
            out.push(',');
        }
        for (a, ava) in rdn.iter().enumerate() {
            if a > 0 {
                out.push('+');
            }
            out.push_str(&ava.attr_type.trim().to_lowercase());
            out.push('=');
            out.push_str(&escape_value(&fold_value(&ava.value)));
        }
    }
    Ok(out)
}

fn fold_value(value: &[u8]) -> Vec<u8> {
    match std::str::from_utf8(value) {
        Ok(s) => s.to_lowercase().into_bytes(),
        Err(_) => value.to_vec(),
    }
}

/// Escape a raw attribute value for use in a DN string. Valid UTF-8 passes
/// through with RFC 4514 specials and control bytes escaped; anything else
/// is hex-escaped byte by byte.
pub fn escape_value(value: &[u8]) -> String {
    let utf8 = std::str::from_utf8(value).is_ok();
    let mut out: Vec<u8> = Vec::with_capacity(value.len());
    for (i, &b) in value.iter().enumerate() {
        match b {
            b'"' | b'+' | b',' | b';' | b'<' | b'>' | b'\\' => {
                out.push(b'\\');
                out.push(b);
            }
            b'#' | b' ' if i == 0 => {
                out.push(b'\\');
                out.push(b);
            }
            b' ' if i == value.len() - 1 => {
                out.extend_from_slice(b"\\ ");
            }
            0x00..=0x1f | 0x7f => {
                out.extend_from_slice(format!("\\{:02x}", b).as_bytes());
            }
            0x80.. if !utf8 => {
                out.extend_from_slice(format!("\\{:02x}", b).as_bytes());
            }
            _ => out.push(b),
        }
    }
    String::from_utf8(out).expect("escaped value is valid UTF-8")
}

/// Parent of a canonical DN, or None for a single-RDN (or empty) DN.
pub fn parent(dn: &str) -> Option<&str> {
    let bytes = dn.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b',' => return Some(&dn[i + 1..]),
            _ => i += 1,
        }
    }
    None
}

/// Scope check over canonical DNs.
pub fn matches_scope(entry_dn: &str, base_dn: &str, scope: SearchScope) -> bool {
    match scope {
        SearchScope::BaseObject => entry_dn == base_dn,
        SearchScope::SingleLevel => parent(entry_dn) == Some(base_dn),
        SearchScope::WholeSubtree => {
            base_dn.is_empty()
                || entry_dn == base_dn
                || entry_dn.ends_with(&format!(",{}", base_dn))
        }
    }
}
