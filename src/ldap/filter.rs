//! Search filter compilation and evaluation.
//!
//! Filters arrive in two forms: BER-encoded on the wire (RFC 4511) and as
//! RFC 4515 strings (tests, tooling). Both compile into the same `Filter`
//! tree, which evaluates against entries with LDAP three-valued logic.

use std::fmt;

use lber::common::TagClass;
use lber::structure::{StructureTag, PL};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::digit1;
use nom::character::{is_alphabetic, is_alphanumeric, is_hex_digit};
use nom::combinator::{map_res, opt, recognize, verify};
use nom::multi::{fold_many0, many0};
use nom::number::complete::be_u8;
use nom::sequence::{delimited, preceded};
use nom::IResult;

use crate::entry::Entry;
use crate::error::{Error, Result};

const FILTER_AND: u64 = 0;
const FILTER_OR: u64 = 1;
const FILTER_NOT: u64 = 2;
const FILTER_EQUALITY: u64 = 3;
const FILTER_SUBSTRINGS: u64 = 4;
const FILTER_GREATER_OR_EQUAL: u64 = 5;
const FILTER_LESS_OR_EQUAL: u64 = 6;
const FILTER_PRESENT: u64 = 7;
const FILTER_APPROX: u64 = 8;
const FILTER_EXTENSIBLE: u64 = 9;

const SUB_INITIAL: u64 = 0;
const SUB_ANY: u64 = 1;
const SUB_FINAL: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality {
        attr: String,
        value: String,
    },
    Substrings {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        final_: Option<String>,
    },
    Present {
        attr: String,
    },
    GreaterOrEqual {
        attr: String,
        value: String,
    },
    LessOrEqual {
        attr: String,
        value: String,
    },
    Approx {
        attr: String,
        value: String,
    },
    Extensible {
        rule: Option<String>,
        attr: Option<String>,
        value: String,
        dn_attrs: bool,
    },
}

/// LDAP three-valued logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trilean {
    True,
    False,
    Undefined,
}

impl Filter {
    /// Compile the BER filter element of a SearchRequest.
    pub fn from_tag(tag: StructureTag) -> Result<Filter> {
        if tag.class != TagClass::Context {
            return Err(Error::InvalidFilter(
                "filter element is not context-tagged".to_string(),
            ));
        }
        match tag.id {
            FILTER_AND | FILTER_OR => {
                let id = tag.id;
                let children = tag
                    .expect_constructed()
                    .ok_or_else(|| Error::InvalidFilter("and/or is not constructed".to_string()))?
                    .into_iter()
                    .map(Filter::from_tag)
                    .collect::<Result<Vec<_>>>()?;
                Ok(if id == FILTER_AND {
                    Filter::And(children)
                } else {
                    Filter::Or(children)
                })
            }
            FILTER_NOT => {
                let mut children = tag
                    .expect_constructed()
                    .ok_or_else(|| Error::InvalidFilter("not is not constructed".to_string()))?;
                if children.len() != 1 {
                    return Err(Error::InvalidFilter(
                        "not must have exactly one child".to_string(),
                    ));
                }
                Ok(Filter::Not(Box::new(Filter::from_tag(children.remove(0))?)))
            }
            FILTER_EQUALITY | FILTER_GREATER_OR_EQUAL | FILTER_LESS_OR_EQUAL | FILTER_APPROX => {
                let id = tag.id;
                let (attr, value) = attr_value_assertion(tag)?;
                Ok(match id {
                    FILTER_EQUALITY => Filter::Equality { attr, value },
                    FILTER_GREATER_OR_EQUAL => Filter::GreaterOrEqual { attr, value },
                    FILTER_LESS_OR_EQUAL => Filter::LessOrEqual { attr, value },
                    _ => Filter::Approx { attr, value },
                })
            }
            FILTER_SUBSTRINGS => {
                let mut children = tag
                    .expect_constructed()
                    .ok_or_else(|| {
                        Error::InvalidFilter("substrings is not constructed".to_string())
                    })?
                    .into_iter();
                let attr = primitive_string(children.next().ok_or_else(|| {
                    Error::InvalidFilter("substrings missing attribute".to_string())
                })?)?;
                let parts = children
                    .next()
                    .ok_or_else(|| Error::InvalidFilter("substrings missing parts".to_string()))?
                    .expect_constructed()
                    .ok_or_else(|| Error::InvalidFilter("substrings parts malformed".to_string()))?;

                let mut initial = None;
                let mut any = Vec::new();
                let mut final_ = None;
                for part in parts {
                    let id = part.id;
                    let value = primitive_string(part)?;
                    match id {
                        SUB_INITIAL => initial = Some(value),
                        SUB_ANY => any.push(value),
                        SUB_FINAL => final_ = Some(value),
                        other => {
                            return Err(Error::InvalidFilter(format!(
                                "unknown substring part {other}"
                            )))
                        }
                    }
                }
                Ok(Filter::Substrings {
                    attr,
                    initial,
                    any,
                    final_,
                })
            }
            FILTER_PRESENT => Ok(Filter::Present {
                attr: primitive_string(tag)?,
            }),
            FILTER_EXTENSIBLE => {
                let mut rule = None;
                let mut attr = None;
                let mut value = None;
                let mut dn_attrs = false;
                for child in tag.expect_constructed().ok_or_else(|| {
                    Error::InvalidFilter("extensible match is not constructed".to_string())
                })? {
                    match child.id {
                        1 => rule = Some(primitive_string(child)?),
                        2 => attr = Some(primitive_string(child)?),
                        3 => value = Some(primitive_string(child)?),
                        4 => {
                            dn_attrs = child
                                .expect_primitive()
                                .and_then(|b| b.first().copied())
                                .map(|b| b != 0)
                                .unwrap_or(false)
                        }
                        _ => {}
                    }
                }
                Ok(Filter::Extensible {
                    rule,
                    attr,
                    value: value.ok_or_else(|| {
                        Error::InvalidFilter("extensible match missing value".to_string())
                    })?,
                    dn_attrs,
                })
            }
            other => Err(Error::InvalidFilter(format!("unknown filter tag {other}"))),
        }
    }

    /// Compile an RFC 4515 filter string.
    pub fn parse(input: &str) -> Result<Filter> {
        match filtexpr(input.as_bytes()) {
            Ok((rest, filter)) if rest.is_empty() => Ok(filter),
            _ => Err(Error::InvalidFilter(input.to_string())),
        }
    }

    /// Evaluate against an entry. An entry matches iff this returns True.
    pub fn eval(&self, entry: &Entry) -> Trilean {
        match self {
            Filter::And(children) => {
                let mut result = Trilean::True;
                for child in children {
                    match child.eval(entry) {
                        Trilean::False => return Trilean::False,
                        Trilean::Undefined => result = Trilean::Undefined,
                        Trilean::True => {}
                    }
                }
                result
            }
            Filter::Or(children) => {
                let mut result = Trilean::False;
                for child in children {
                    match child.eval(entry) {
                        Trilean::True => return Trilean::True,
                        Trilean::Undefined => result = Trilean::Undefined,
                        Trilean::False => {}
                    }
                }
                result
            }
            Filter::Not(inner) => match inner.eval(entry) {
                Trilean::True => Trilean::False,
                Trilean::False => Trilean::True,
                Trilean::Undefined => Trilean::Undefined,
            },
            Filter::Equality { attr, value } => with_values(entry, attr, |values| {
                let needle = value.to_lowercase();
                values.iter().any(|v| v.to_lowercase() == needle)
            }),
            Filter::Present { attr } => {
                if is_user_password(attr) {
                    Trilean::Undefined
                } else if entry.attribute(attr).is_some() {
                    Trilean::True
                } else {
                    Trilean::False
                }
            }
            Filter::Substrings {
                attr,
                initial,
                any,
                final_,
            } => with_values(entry, attr, |values| {
                values
                    .iter()
                    .any(|v| substrings_match(v, initial.as_deref(), any, final_.as_deref()))
            }),
            Filter::GreaterOrEqual { attr, value } => with_values(entry, attr, |values| {
                values.iter().any(|v| order_cmp(v, value).is_ge())
            }),
            Filter::LessOrEqual { attr, value } => with_values(entry, attr, |values| {
                values.iter().any(|v| order_cmp(v, value).is_le())
            }),
            Filter::Approx { attr, value } => with_values(entry, attr, |values| {
                let needle = value.to_lowercase();
                values.iter().any(|v| v.to_lowercase() == needle)
            }),
            Filter::Extensible { .. } => Trilean::Undefined,
        }
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        self.eval(entry) == Trilean::True
    }
}

fn is_user_password(attr: &str) -> bool {
    attr.eq_ignore_ascii_case("userpassword")
}

fn with_values<F>(entry: &Entry, attr: &str, pred: F) -> Trilean
where
    F: FnOnce(&[String]) -> bool,
{
    if is_user_password(attr) {
        return Trilean::Undefined;
    }
    match entry.attribute(attr) {
        Some(attribute) => {
            if pred(&attribute.values) {
                Trilean::True
            } else {
                Trilean::False
            }
        }
        None => Trilean::False,
    }
}

fn substrings_match(
    value: &str,
    initial: Option<&str>,
    any: &[String],
    final_: Option<&str>,
) -> bool {
    let haystack = value.to_lowercase();
    let mut pos = 0;

    if let Some(initial) = initial {
        let initial = initial.to_lowercase();
        if !haystack.starts_with(&initial) {
            return false;
        }
        pos = initial.len();
    }
    for part in any {
        let part = part.to_lowercase();
        match haystack[pos..].find(&part) {
            Some(idx) => pos += idx + part.len(),
            None => return false,
        }
    }
    if let Some(final_) = final_ {
        let final_ = final_.to_lowercase();
        return haystack.len() >= pos + final_.len() && haystack[pos..].ends_with(&final_);
    }
    true
}

fn order_cmp(value: &str, assertion: &str) -> std::cmp::Ordering {
    if let (Ok(a), Ok(b)) = (value.trim().parse::<i64>(), assertion.trim().parse::<i64>()) {
        return a.cmp(&b);
    }
    value.to_lowercase().cmp(&assertion.to_lowercase())
}

fn primitive_string(tag: StructureTag) -> Result<String> {
    match tag.payload {
        PL::P(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        PL::C(_) => Err(Error::InvalidFilter(
            "expected primitive filter element".to_string(),
        )),
    }
}

fn attr_value_assertion(tag: StructureTag) -> Result<(String, String)> {
    let mut children = tag
        .expect_constructed()
        .ok_or_else(|| Error::InvalidFilter("assertion is not constructed".to_string()))?
        .into_iter();
    let attr = primitive_string(
        children
            .next()
            .ok_or_else(|| Error::InvalidFilter("assertion missing attribute".to_string()))?,
    )?;
    let value = primitive_string(
        children
            .next()
            .ok_or_else(|| Error::InvalidFilter("assertion missing value".to_string()))?,
    )?;
    Ok((attr, value))
}

// --- RFC 4515 string grammar ---------------------------------------------

fn filtexpr(i: &[u8]) -> IResult<&[u8], Filter> {
    alt((filter, item))(i)
}

fn filter(i: &[u8]) -> IResult<&[u8], Filter> {
    delimited(tag(b"("), filtercomp, tag(b")"))(i)
}

fn filtercomp(i: &[u8]) -> IResult<&[u8], Filter> {
    alt((and, or, not, item))(i)
}

fn and(i: &[u8]) -> IResult<&[u8], Filter> {
    let (i, children) = preceded(tag(b"&"), many0(filter))(i)?;
    Ok((i, Filter::And(children)))
}

fn or(i: &[u8]) -> IResult<&[u8], Filter> {
    let (i, children) = preceded(tag(b"|"), many0(filter))(i)?;
    Ok((i, Filter::Or(children)))
}

fn not(i: &[u8]) -> IResult<&[u8], Filter> {
    let (i, inner) = preceded(tag(b"!"), filter)(i)?;
    Ok((i, Filter::Not(Box::new(inner))))
}

fn item(i: &[u8]) -> IResult<&[u8], Filter> {
    alt((eq, non_eq, extensible))(i)
}

enum Unescaper {
    WantFirst,
    WantSecond(u8),
    Value(u8),
    Error,
}

impl Unescaper {
    fn feed(&self, c: u8) -> Unescaper {
        fn hex(c: u8) -> u8 {
            if c <= b'9' {
                c - b'0'
            } else {
                (c | 0x20) - b'a' + 10
            }
        }
        match *self {
            Unescaper::Error => Unescaper::Error,
            Unescaper::WantFirst => {
                if is_hex_digit(c) {
                    Unescaper::WantSecond(hex(c))
                } else {
                    Unescaper::Error
                }
            }
            Unescaper::WantSecond(partial) => {
                if is_hex_digit(c) {
                    Unescaper::Value((partial << 4) + hex(c))
                } else {
                    Unescaper::Error
                }
            }
            Unescaper::Value(_) => {
                if c != b'\\' {
                    Unescaper::Value(c)
                } else {
                    Unescaper::WantFirst
                }
            }
        }
    }
}

// Any byte of an assertion value may be written as \NN; parentheses, the
// asterisk and the backslash itself must be.
fn unescaped(i: &[u8]) -> IResult<&[u8], String> {
    map_res(
        fold_many0(
            verify(be_u8, is_value_char),
            || (Unescaper::Value(0), Vec::new()),
            |(mut u, mut vec): (Unescaper, Vec<_>), c: u8| {
                u = u.feed(c);
                if let Unescaper::Value(c) = u {
                    vec.push(c);
                }
                (u, vec)
            },
        ),
        |(u, vec): (Unescaper, Vec<_>)| -> std::result::Result<String, ()> {
            if let Unescaper::Value(_) = u {
                Ok(String::from_utf8_lossy(&vec).into_owned())
            } else {
                Err(())
            }
        },
    )(i)
}

fn is_value_char(&c: &u8) -> bool {
    c != 0 && c != b'(' && c != b')' && c != b'*'
}

fn non_eq(i: &[u8]) -> IResult<&[u8], Filter> {
    let (i, attr) = attributedescription(i)?;
    let (i, op) = alt((tag(b">="), tag(b"<="), tag(b"~=")))(i)?;
    let (i, value) = unescaped(i)?;
    let attr = String::from_utf8_lossy(attr).into_owned();
    let filter = match op {
        b">=" => Filter::GreaterOrEqual { attr, value },
        b"<=" => Filter::LessOrEqual { attr, value },
        _ => Filter::Approx { attr, value },
    };
    Ok((i, filter))
}

fn eq(i: &[u8]) -> IResult<&[u8], Filter> {
    let (i, attr) = attributedescription(i)?;
    let (i, _) = tag(b"=")(i)?;
    let (i, initial) = unescaped(i)?;
    let (i, mid_final) = map_res(
        many0(preceded(tag(b"*"), unescaped)),
        |v: Vec<String>| -> std::result::Result<Vec<String>, ()> {
            // Only the last star-separated part may be empty.
            if v.iter()
                .enumerate()
                .any(|(n, part)| part.is_empty() && n + 1 != v.len())
            {
                Err(())
            } else {
                Ok(v)
            }
        },
    )(i)?;
    let attr = String::from_utf8_lossy(attr).into_owned();

    let filter = if mid_final.is_empty() {
        Filter::Equality {
            attr,
            value: initial,
        }
    } else if initial.is_empty() && mid_final.len() == 1 && mid_final[0].is_empty() {
        Filter::Present { attr }
    } else {
        let n = mid_final.len();
        let mut any = Vec::new();
        let mut final_ = None;
        for (idx, part) in mid_final.into_iter().enumerate() {
            if part.is_empty() {
                break;
            }
            if idx + 1 == n {
                final_ = Some(part);
            } else {
                any.push(part);
            }
        }
        Filter::Substrings {
            attr,
            initial: if initial.is_empty() {
                None
            } else {
                Some(initial)
            },
            any,
            final_,
        }
    };
    Ok((i, filter))
}

fn extensible(i: &[u8]) -> IResult<&[u8], Filter> {
    alt((attr_dn_mrule, dn_mrule))(i)
}

fn attr_dn_mrule(i: &[u8]) -> IResult<&[u8], Filter> {
    let (i, attr) = attributedescription(i)?;
    let (i, dn) = opt(tag(b":dn"))(i)?;
    let (i, rule) = opt(preceded(tag(b":"), attributetype))(i)?;
    let (i, _) = tag(b":=")(i)?;
    let (i, value) = unescaped(i)?;
    Ok((
        i,
        Filter::Extensible {
            rule: rule.map(|r| String::from_utf8_lossy(r).into_owned()),
            attr: Some(String::from_utf8_lossy(attr).into_owned()),
            value,
            dn_attrs: dn.is_some(),
        },
    ))
}

fn dn_mrule(i: &[u8]) -> IResult<&[u8], Filter> {
    let (i, dn) = opt(tag(b":dn"))(i)?;
    let (i, rule) = preceded(tag(b":"), attributetype)(i)?;
    let (i, _) = tag(b":=")(i)?;
    let (i, value) = unescaped(i)?;
    Ok((
        i,
        Filter::Extensible {
            rule: Some(String::from_utf8_lossy(rule).into_owned()),
            attr: None,
            value,
            dn_attrs: dn.is_some(),
        },
    ))
}

fn attributedescription(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(|i| -> IResult<&[u8], ()> {
        let (i, _) = attributetype(i)?;
        let (i, _) = many0(preceded(tag(b";"), take_while1(is_alnum_hyphen)))(i)?;
        Ok((i, ()))
    })(i)
}

fn is_alnum_hyphen(c: u8) -> bool {
    is_alphanumeric(c) || c == b'-'
}

fn attributetype(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((numericoid, descr))(i)
}

fn numericoid(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(|i| -> IResult<&[u8], ()> {
        let (i, _) = number(i)?;
        let (i, _) = many0(preceded(tag(b"."), number))(i)?;
        Ok((i, ()))
    })(i)
}

// A number may be zero, but must not have superfluous leading zeroes.
fn number(i: &[u8]) -> IResult<&[u8], &[u8]> {
    verify(digit1, |d: &[u8]| d.len() == 1 || d[0] != b'0')(i)
}

fn descr(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(|i| -> IResult<&[u8], ()> {
        let (i, _) = verify(be_u8, |c| is_alphabetic(*c))(i)?;
        let (i, _) = take_while(is_alnum_hyphen)(i)?;
        Ok((i, ()))
    })(i)
}

// --- display ---------------------------------------------------------------

fn escape_assertion(value: &str, out: &mut fmt::Formatter<'_>) -> fmt::Result {
    for b in value.bytes() {
        match b {
            b'(' | b')' | b'*' | b'\\' => write!(out, "\\{:02x}", b)?,
            0 => write!(out, "\\00")?,
            _ => write!(out, "{}", b as char)?,
        }
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) => {
                write!(f, "(&")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                write!(f, ")")
            }
            Filter::Or(children) => {
                write!(f, "(|")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{inner})"),
            Filter::Equality { attr, value } => {
                write!(f, "({attr}=")?;
                escape_assertion(value, f)?;
                write!(f, ")")
            }
            Filter::Present { attr } => write!(f, "({attr}=*)"),
            Filter::Substrings {
                attr,
                initial,
                any,
                final_,
            } => {
                write!(f, "({attr}=")?;
                if let Some(initial) = initial {
                    escape_assertion(initial, f)?;
                }
                for part in any {
                    write!(f, "*")?;
                    escape_assertion(part, f)?;
                }
                write!(f, "*")?;
                if let Some(final_) = final_ {
                    escape_assertion(final_, f)?;
                }
                write!(f, ")")
            }
            Filter::GreaterOrEqual { attr, value } => {
                write!(f, "({attr}>=")?;
                escape_assertion(value, f)?;
                write!(f, ")")
            }
            Filter::LessOrEqual { attr, value } => {
                write!(f, "({attr}<=")?;
                escape_assertion(value, f)?;
                write!(f, ")")
            }
            Filter::Approx { attr, value } => {
                write!(f, "({attr}~=")?;
                escape_assertion(value, f)?;
                write!(f, ")")
            }
            Filter::Extensible {
                rule, attr, value, ..
            } => {
                write!(f, "(")?;
                if let Some(attr) = attr {
                    write!(f, "{attr}")?;
                }
                if let Some(rule) = rule {
                    write!(f, ":{rule}")?;
                }
                write!(f, ":=")?;
                escape_assertion(value, f)?;
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Entry {
        Entry::with_attributes(
            "uid=alice,ou=sub,o=base",
            &[
                ("objectClass", &["inetOrgPerson"][..]),
                ("uid", &["alice"][..]),
                ("cn", &["Alice Example"][..]),
                ("mail", &["alice@example.com"][..]),
                ("uidNumber", &["1001"][..]),
                ("userPassword", &["secret"][..]),
            ],
        )
    }

    #[test]
    fn parse_simple_equality() {
        assert_eq!(
            Filter::parse("(uid=alice)").unwrap(),
            Filter::Equality {
                attr: "uid".to_string(),
                value: "alice".to_string()
            }
        );
    }

    #[test]
    fn parse_presence_and_substrings() {
        assert_eq!(
            Filter::parse("(cn=*)").unwrap(),
            Filter::Present {
                attr: "cn".to_string()
            }
        );
        assert_eq!(
            Filter::parse("(cn=A*ce*le)").unwrap(),
            Filter::Substrings {
                attr: "cn".to_string(),
                initial: Some("A".to_string()),
                any: vec!["ce".to_string()],
                final_: Some("le".to_string()),
            }
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Filter::parse("(uid=alice)garbage").is_err());
        assert!(Filter::parse("(a=f**)").is_err());
        assert!(Filter::parse("(a=v\\2)").is_err());
    }

    #[test]
    fn parse_complex() {
        let filter = Filter::parse("(&(objectClass=person)(|(uid=a)(uid=b))(!(mail=*)))").unwrap();
        match filter {
            Filter::And(children) => assert_eq!(children.len(), 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn eval_equality_is_case_insensitive() {
        let entry = user();
        assert!(Filter::parse("(UID=Alice)").unwrap().matches(&entry));
        assert!(Filter::parse("(cn=alice example)").unwrap().matches(&entry));
        assert!(!Filter::parse("(uid=bob)").unwrap().matches(&entry));
    }

    #[test]
    fn eval_substrings() {
        let entry = user();
        assert!(Filter::parse("(mail=*@example.com)").unwrap().matches(&entry));
        assert!(Filter::parse("(uid=a*)").unwrap().matches(&entry));
        assert!(Filter::parse("(cn=*ice*amp*)").unwrap().matches(&entry));
        assert!(!Filter::parse("(mail=*@example.org)").unwrap().matches(&entry));
    }

    #[test]
    fn eval_ordering_numeric() {
        let entry = user();
        assert!(Filter::parse("(uidNumber>=1000)").unwrap().matches(&entry));
        assert!(Filter::parse("(uidNumber<=1001)").unwrap().matches(&entry));
        assert!(!Filter::parse("(uidNumber>=2000)").unwrap().matches(&entry));
    }

    #[test]
    fn eval_boolean_composition() {
        let entry = user();
        assert!(Filter::parse("(&(uid=alice)(mail=*@example.com))")
            .unwrap()
            .matches(&entry));
        assert!(Filter::parse("(|(uid=bob)(uid=alice))").unwrap().matches(&entry));
        assert!(Filter::parse("(!(uid=bob))").unwrap().matches(&entry));
        assert!(!Filter::parse("(!(uid=alice))").unwrap().matches(&entry));
    }

    #[test]
    fn user_password_is_undefined() {
        let entry = user();
        let filter = Filter::parse("(userPassword=secret)").unwrap();
        assert_eq!(filter.eval(&entry), Trilean::Undefined);
        // NOT of UNDEFINED stays UNDEFINED, so the entry still does not match.
        let filter = Filter::parse("(!(userPassword=secret))").unwrap();
        assert_eq!(filter.eval(&entry), Trilean::Undefined);
    }

    #[test]
    fn absolute_true_and_false() {
        let entry = user();
        assert_eq!(Filter::parse("(&)").unwrap().eval(&entry), Trilean::True);
        assert_eq!(Filter::parse("(|)").unwrap().eval(&entry), Trilean::False);
    }

    #[test]
    fn display_roundtrip() {
        for s in [
            "(uid=alice)",
            "(cn=*)",
            "(mail=*@example.com)",
            "(&(objectClass=person)(!(uid=bob)))",
        ] {
            let filter = Filter::parse(s).unwrap();
            assert_eq!(Filter::parse(&filter.to_string()).unwrap(), filter);
        }
    }
}
