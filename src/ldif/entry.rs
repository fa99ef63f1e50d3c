//! Loaded LDIF entries with the password attribute split off.

use crate::entry::{Attribute, Entry};
use crate::error::Result;
use crate::password::Verifier;

/// An entry as served by the LDIF backend. userPassword is kept on a side
/// field: bind consults it, search never sees it.
#[derive(Debug)]
pub struct LdifEntry {
    pub entry: Entry,
    pub canonical_dn: String,
    pub user_password: Option<Attribute>,
}

impl LdifEntry {
    pub fn new(entry: Entry, canonical_dn: String) -> Self {
        let mut stripped = Entry::new(entry.dn.clone());
        let mut user_password = None;
        for attribute in entry.attributes {
            if attribute.name.eq_ignore_ascii_case("userpassword") {
                user_password = Some(attribute);
            } else {
                stripped.attributes.push(attribute);
            }
        }
        LdifEntry {
            entry: stripped,
            canonical_dn,
            user_password,
        }
    }

    /// Check a simple-bind password against the stored hash. Entries without
    /// a userPassword can never authenticate.
    pub fn validate_password(&self, verifier: &Verifier, password: &str) -> Result<bool> {
        match self
            .user_password
            .as_ref()
            .and_then(|a| a.values.first())
        {
            Some(hash) => verifier.validate(password, hash),
            None => Ok(false),
        }
    }
}
