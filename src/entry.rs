//! Directory entry model shared by both back ends.

use serde::{Deserialize, Serialize};

/// Attributes that are only returned when requested by name or via "+".
const OPERATIONAL_ATTRIBUTES: &[&str] = &[
    "entryuuid",
    "entrycsn",
    "createtimestamp",
    "modifytimestamp",
    "creatorsname",
    "modifiersname",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    /// Values in insertion order. Duplicates within one attribute are
    /// rejected at construction/load time.
    pub values: Vec<String>,
}

/// A directory entry: a DN plus an ordered attribute list. The DN keeps the
/// form it was written with; lookups always go through the canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Entry {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    /// Build an entry from (name, values) pairs, preserving order.
    pub fn with_attributes<N, V>(dn: impl Into<String>, attrs: &[(N, &[V])]) -> Self
    where
        N: AsRef<str>,
        V: AsRef<str>,
    {
        let mut entry = Entry::new(dn);
        for (name, values) in attrs {
            entry.attributes.push(Attribute {
                name: name.as_ref().to_string(),
                values: values.iter().map(|v| v.as_ref().to_string()).collect(),
            });
        }
        entry
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.attribute(name).map(|a| a.values.as_slice()).unwrap_or(&[])
    }

    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(|s| s.as_str())
    }

    /// Copy of this entry with the requested attributes only.
    ///
    /// An empty selection or "*" yields all user attributes, "+" adds the
    /// operational ones, names select case-insensitively. userPassword is
    /// never projected.
    pub fn project(&self, requested: &[String]) -> Entry {
        let all_user = requested.is_empty() || requested.iter().any(|a| a == "*");
        let all_operational = requested.iter().any(|a| a == "+");

        let attributes = self
            .attributes
            .iter()
            .filter(|a| {
                if a.name.eq_ignore_ascii_case("userpassword") {
                    return false;
                }
                let operational = is_operational(&a.name);
                if (operational && all_operational) || (!operational && all_user) {
                    return true;
                }
                requested.iter().any(|r| r.eq_ignore_ascii_case(&a.name))
            })
            .cloned()
            .collect();

        Entry {
            dn: self.dn.clone(),
            attributes,
        }
    }
}

pub fn is_operational(name: &str) -> bool {
    OPERATIONAL_ATTRIBUTES
        .iter()
        .any(|o| o.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entry {
        Entry::with_attributes(
            "uid=alice,ou=sub,o=base",
            &[
                ("uid", &["alice"][..]),
                ("cn", &["Alice Example"][..]),
                ("userPassword", &["secret"][..]),
                ("entryUUID", &["8a7e-11aa"][..]),
            ],
        )
    }

    #[test]
    fn project_default_returns_user_attributes() {
        let projected = sample().project(&[]);
        let names: Vec<_> = projected.attributes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["uid", "cn"]);
    }

    #[test]
    fn project_star_equals_default() {
        assert_eq!(sample().project(&["*".to_string()]), sample().project(&[]));
    }

    #[test]
    fn project_plus_adds_operational() {
        let projected = sample().project(&["*".to_string(), "+".to_string()]);
        assert!(projected.attribute("entryUUID").is_some());
    }

    #[test]
    fn project_named_is_case_insensitive() {
        let projected = sample().project(&["CN".to_string()]);
        let names: Vec<_> = projected.attributes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["cn"]);
    }

    #[test]
    fn user_password_never_projected() {
        let projected = sample().project(&["userPassword".to_string()]);
        assert!(projected.attributes.is_empty());
    }
}
