//! RFC 2849 LDIF parsing, entry records only.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::entry::{Attribute, Entry};
use crate::error::{Error, Result};

/// Parse LDIF text into entries.
///
/// Supported: `dn:`/`dn::` records, base64 values (`::`), comment lines,
/// line continuations and a leading `version:` line. Change records
/// (`changetype:`) and URL values (`:<`) are rejected; duplicate values
/// within one attribute are a parse error.
pub fn parse_ldif(text: &str) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut record: Vec<(usize, String)> = Vec::new();

    let mut lines = text.lines().enumerate().peekable();
    while let Some((lineno, line)) = lines.next() {
        if line.trim_end().is_empty() {
            if !record.is_empty() {
                entries.push(parse_record(&record)?);
                record.clear();
            }
            continue;
        }
        if line.starts_with('#') {
            // Comments may be folded too; swallow their continuations.
            while matches!(lines.peek(), Some((_, next)) if next.starts_with(' ')) {
                lines.next();
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix(' ') {
            match record.last_mut() {
                Some((_, logical)) => logical.push_str(rest),
                None => {
                    return Err(Error::LdifParse {
                        line: lineno + 1,
                        msg: "continuation line without a preceding line".to_string(),
                    })
                }
            }
            continue;
        }
        record.push((lineno + 1, line.to_string()));
    }
    if !record.is_empty() {
        entries.push(parse_record(&record)?);
    }

    Ok(entries)
}

fn parse_record(lines: &[(usize, String)]) -> Result<Entry> {
    let mut iter = lines.iter();

    let (mut lineno, mut first) = {
        let (n, l) = iter.next().expect("record is never empty");
        (*n, l.as_str())
    };

    // A leading version line belongs to the first record.
    if let Some(version) = first.strip_prefix("version:") {
        let version = version.trim();
        if version != "1" {
            return Err(Error::LdifParse {
                line: lineno,
                msg: format!("unsupported LDIF version {version}"),
            });
        }
        match iter.next() {
            Some((n, l)) => {
                lineno = *n;
                first = l.as_str();
            }
            None => {
                return Err(Error::LdifParse {
                    line: lineno,
                    msg: "record with only a version line".to_string(),
                })
            }
        }
    }

    let dn = match split_line(first, lineno)? {
        (name, value) if name.eq_ignore_ascii_case("dn") => value,
        _ => {
            return Err(Error::LdifParse {
                line: lineno,
                msg: "record must start with \"dn:\"".to_string(),
            })
        }
    };

    let mut entry = Entry::new(dn);
    for (lineno, line) in iter {
        let (name, value) = split_line(line, *lineno)?;
        if name.eq_ignore_ascii_case("changetype") {
            return Err(Error::LdifParse {
                line: *lineno,
                msg: "change records are not supported".to_string(),
            });
        }
        if name.eq_ignore_ascii_case("dn") {
            return Err(Error::LdifParse {
                line: *lineno,
                msg: "unexpected dn line inside record".to_string(),
            });
        }

        match entry.attributes.iter_mut().find(|a| a.name == name) {
            Some(attr) => {
                if attr.values.contains(&value) {
                    return Err(Error::LdifParse {
                        line: *lineno,
                        msg: format!("duplicate value for attribute {name}"),
                    });
                }
                attr.values.push(value);
            }
            None => entry.attributes.push(Attribute {
                name,
                values: vec![value],
            }),
        }
    }

    Ok(entry)
}

fn split_line(line: &str, lineno: usize) -> Result<(String, String)> {
    let colon = line.find(':').ok_or_else(|| Error::LdifParse {
        line: lineno,
        msg: format!("missing ':' in line {line:?}"),
    })?;
    let name = line[..colon].trim().to_string();
    if name.is_empty() {
        return Err(Error::LdifParse {
            line: lineno,
            msg: "empty attribute name".to_string(),
        });
    }
    let rest = &line[colon + 1..];

    if let Some(b64) = rest.strip_prefix(':') {
        let decoded = BASE64.decode(b64.trim()).map_err(|e| Error::LdifParse {
            line: lineno,
            msg: format!("invalid base64 value: {e}"),
        })?;
        let value = String::from_utf8_lossy(&decoded).into_owned();
        return Ok((name, value));
    }
    if rest.starts_with('<') {
        return Err(Error::LdifParse {
            line: lineno,
            msg: "URL values are not supported".to_string(),
        });
    }
    Ok((name, rest.strip_prefix(' ').unwrap_or(rest).to_string()))
}

/// Render entries back to LDIF text. Values that LDIF cannot carry verbatim
/// are base64-encoded.
pub fn write_ldif(entries: &[Entry]) -> String {
    let mut out = String::new();
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        write_value(&mut out, "dn", &entry.dn);
        for attribute in &entry.attributes {
            for value in &attribute.values {
                write_value(&mut out, &attribute.name, value);
            }
        }
    }
    out
}

fn write_value(out: &mut String, name: &str, value: &str) {
    let safe = !value.is_empty()
        && !value.starts_with([' ', ':', '<'])
        && !value.ends_with(' ')
        && value.bytes().all(|b| (0x20..0x7f).contains(&b));
    if safe {
        out.push_str(&format!("{name}: {value}\n"));
    } else {
        out.push_str(&format!("{name}:: {}\n", BASE64.encode(value.as_bytes())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_parse_roundtrip() {
        let entries = vec![
            Entry::with_attributes("o=base", &[("o", &["base"][..])]),
            Entry::with_attributes(
                "uid=umlaut,o=base",
                &[("uid", &["umlaut"][..]), ("cn", &["Jürgen"][..])],
            ),
        ];
        let text = write_ldif(&entries);
        assert!(text.contains("cn:: "));
        let parsed = parse_ldif(&text).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn parses_multiple_entries() {
        let text = "\
version: 1
dn: o=base
o: base
objectClass: organization

dn: ou=sub,o=base
ou: sub
objectClass: organizationalUnit

# trailing comment
dn: uid=alice,ou=sub,o=base
uid: alice
objectClass: inetOrgPerson
objectClass: posixAccount
userPassword: secret
";
        let entries = parse_ldif(text).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].dn, "o=base");
        assert_eq!(entries[2].values("objectClass").len(), 2);
        assert_eq!(entries[2].first_value("userPassword"), Some("secret"));
    }

    #[test]
    fn folds_continuation_lines() {
        let text = "dn: uid=alice,o=base\ndescription: a rather\n  long line\nuid: alice\n";
        let entries = parse_ldif(text).unwrap();
        assert_eq!(
            entries[0].first_value("description"),
            Some("a rather long line")
        );
    }

    #[test]
    fn decodes_base64_values() {
        let text = "dn: uid=alice,o=base\ncn:: QWxpY2UgRXhhbXBsZQ==\n";
        let entries = parse_ldif(text).unwrap();
        assert_eq!(entries[0].first_value("cn"), Some("Alice Example"));
    }

    #[test]
    fn rejects_duplicate_values() {
        let text = "dn: uid=a,o=base\nmail: a@x\nmail: a@x\n";
        assert!(matches!(
            parse_ldif(text),
            Err(Error::LdifParse { line: 3, .. })
        ));
    }

    #[test]
    fn rejects_change_records() {
        let text = "dn: uid=a,o=base\nchangetype: delete\n";
        assert!(parse_ldif(text).is_err());
    }

    #[test]
    fn rejects_record_without_dn() {
        assert!(parse_ldif("uid: alice\n").is_err());
    }
}
