//! LDIF-backed directory: parsing, templating, indexes and the read-only
//! Handler implementation.

pub mod entry;
pub mod handler;
pub mod index;
pub mod middleware;
pub mod parse;
pub mod suffix;
pub mod template;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::{dn, entry::Entry};

pub use handler::LdifHandler;
pub use middleware::LdifMiddleware;

#[derive(Debug, Clone, Default)]
pub struct LdifOptions {
    pub base_dn: String,
    pub allow_local_anonymous_bind: bool,

    pub default_company: String,
    pub default_mail_domain: String,

    pub template_extra_vars: HashMap<String, String>,
    pub template_engine_disabled: bool,
}

/// In-memory state built from one LDIF load: the suffix tree plus the
/// attribute indexes. Immutable once built; reload swaps the whole value.
#[derive(Debug)]
pub struct LdifData {
    pub tree: suffix::SuffixTree<Arc<entry::LdifEntry>>,
    pub index: index::IndexRegister,
}

/// Read an LDIF source: either a single file or a directory of .ldif files
/// concatenated in lexical order.
pub fn read_source(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    if !meta.is_dir() {
        return std::fs::read_to_string(path).map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: e,
        });
    }

    let mut files: Vec<_> = std::fs::read_dir(path)
        .map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: e,
        })?
        .filter_map(|res| res.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|e| e == "ldif").unwrap_or(false))
        .collect();
    files.sort();

    let mut combined = String::new();
    for file in files {
        let text = std::fs::read_to_string(&file).map_err(|e| Error::Io {
            path: file.clone(),
            source: e,
        })?;
        combined.push_str(&text);
        if !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push('\n');
    }
    Ok(combined)
}

/// Load entries from a source path, optionally rendering it as a template
/// first.
pub fn load_entries(path: &Path, options: &LdifOptions) -> Result<Vec<Entry>> {
    let mut text = read_source(path)?;
    if !options.template_engine_disabled {
        text = template::render(&text, options)?;
    }
    parse::parse_ldif(&text)
}

/// Build the suffix tree and (optionally) the attribute indexes from parsed
/// entries. A duplicate canonical DN fails the whole load.
pub fn build_data(entries: Vec<Entry>, with_index: bool) -> Result<LdifData> {
    let mut tree = suffix::SuffixTree::new();
    let mut index = index::IndexRegister::new();

    for raw in entries {
        let canonical = dn::normalize(&raw.dn)?;
        let ldif_entry = Arc::new(entry::LdifEntry::new(raw, canonical.clone()));
        if with_index {
            for attribute in &ldif_entry.entry.attributes {
                index.add(&attribute.name, &attribute.values, &ldif_entry);
            }
        }
        if tree.insert(&canonical, ldif_entry).is_some() {
            return Err(Error::DuplicateEntry(canonical));
        }
    }

    Ok(LdifData { tree, index })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_rejects_duplicate_dns() {
        let entries = vec![
            Entry::with_attributes("uid=a,o=base", &[("uid", &["a"][..])]),
            Entry::with_attributes("UID=A,o=Base", &[("uid", &["a"][..])]),
        ];
        assert!(matches!(
            build_data(entries, true),
            Err(Error::DuplicateEntry(_))
        ));
    }

    #[test]
    fn build_indexes_and_tree_agree() {
        let entries = vec![
            Entry::with_attributes("o=base", &[("o", &["base"][..])]),
            Entry::with_attributes(
                "uid=a,o=base",
                &[("uid", &["a"][..]), ("userPassword", &["x"][..])],
            ),
        ];
        let data = build_data(entries, true).unwrap();
        assert_eq!(data.tree.len(), 2);
        assert_eq!(data.tree.walk_suffix("o=base").count(), 2);

        // userPassword must not be reachable through any index.
        let filter = crate::ldap::filter::Filter::parse("(uid=a)").unwrap();
        let plan = data.index.plan(&filter).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan[0].entry.attribute("userPassword").is_none());
    }
}
