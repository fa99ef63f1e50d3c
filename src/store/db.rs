//! Persistent directory store.
//!
//! A single transactional B-tree file with three tables:
//!
//! - id2entry: 8-byte little-endian entry id -> serialized entry record
//! - dn2id: canonical DN bytes -> 8-byte id
//! - id2children: parent id -> packed little-endian list of child ids
//!
//! Writers run one at a time; readers see a consistent snapshot. Ids come
//! from an in-process monotonic counter seeded from the largest id on disk
//! (the store owns its file exclusively while open).

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::dn;
use crate::entry::{Attribute, Entry};
use crate::error::{Error, Result};

const ID2ENTRY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("id2entry");
const DN2ID: TableDefinition<&[u8], &[u8]> = TableDefinition::new("dn2id");
const ID2CHILDREN: TableDefinition<&[u8], &[u8]> = TableDefinition::new("id2children");

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    pub read_only: bool,
}

/// One attribute change for `entry_modify`.
#[derive(Debug, Clone)]
pub enum ModifyOp {
    Add { attr: String, values: Vec<String> },
    Delete { attr: String, values: Vec<String> },
    Replace { attr: String, values: Vec<String> },
}

/// LDAP search scope over the stored hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreScope {
    BaseObject,
    SingleLevel,
    WholeSubtree,
}

impl From<crate::ldap::proto::SearchScope> for StoreScope {
    fn from(scope: crate::ldap::proto::SearchScope) -> Self {
        match scope {
            crate::ldap::proto::SearchScope::BaseObject => StoreScope::BaseObject,
            crate::ldap::proto::SearchScope::SingleLevel => StoreScope::SingleLevel,
            crate::ldap::proto::SearchScope::WholeSubtree => StoreScope::WholeSubtree,
        }
    }
}

pub struct DirStore {
    db: Database,
    base_dn: String,
    read_only: bool,
    next_id: AtomicU64,
}

fn id_to_bytes(id: u64) -> [u8; 8] {
    id.to_le_bytes()
}

fn bytes_to_id(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn unpack_ids(packed: &[u8]) -> Vec<u64> {
    packed.chunks_exact(8).map(bytes_to_id).collect()
}

fn pack_ids(ids: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ids.len() * 8);
    for id in ids {
        out.extend_from_slice(&id_to_bytes(*id));
    }
    out
}

fn decode_entry(bytes: &[u8], id: u64) -> Result<Entry> {
    bincode::deserialize(bytes)
        .map_err(|e| Error::Database(format!("error decoding entry id {id}: {e}")))
}

impl DirStore {
    /// Open (creating unless read-only) the database file and ensure the
    /// three tables exist.
    pub fn open(base_dn: &str, path: &Path, options: StoreOptions) -> Result<Self> {
        let base_dn = dn::normalize(base_dn)?;
        debug!(db = %path.display(), "open directory store");

        let db = if options.read_only {
            Database::open(path)?
        } else {
            Database::create(path)?
        };

        if !options.read_only {
            let txn = db.begin_write()?;
            txn.open_table(ID2ENTRY)?;
            txn.open_table(DN2ID)?;
            txn.open_table(ID2CHILDREN)?;
            txn.commit()?;
        }

        // Seed the id counter from the largest id in use.
        let mut last_id = 0;
        {
            let txn = db.begin_read()?;
            if let Ok(table) = txn.open_table(ID2ENTRY) {
                for item in table.iter()? {
                    let (key, _) = item?;
                    last_id = last_id.max(bytes_to_id(key.value()));
                }
            }
        }

        Ok(DirStore {
            db,
            base_dn,
            read_only: options.read_only,
            next_id: AtomicU64::new(last_id),
        })
    }

    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    fn in_base(&self, canonical_dn: &str) -> bool {
        canonical_dn == self.base_dn
            || canonical_dn.ends_with(&format!(",{}", self.base_dn))
    }

    /// Insert a new entry. The parent must already exist unless the entry is
    /// the base itself.
    pub fn entry_put(&self, entry: &Entry) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let canonical = dn::normalize(&entry.dn)?;
        if !self.in_base(&canonical) {
            return Err(Error::NotUnderBase(canonical));
        }
        let serialized = bincode::serialize(entry)
            .map_err(|e| Error::Database(format!("error encoding entry: {e}")))?;

        let txn = self.db.begin_write()?;
        {
            let mut id2entry = txn.open_table(ID2ENTRY)?;
            let mut dn2id = txn.open_table(DN2ID)?;
            let mut id2children = txn.open_table(ID2CHILDREN)?;

            if dn2id.get(canonical.as_bytes())?.is_some() {
                return Err(Error::EntryAlreadyExists);
            }

            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            id2entry.insert(id_to_bytes(id).as_slice(), serialized.as_slice())?;

            if canonical != self.base_dn {
                let parent = dn::parent(&canonical)
                    .ok_or_else(|| Error::ParentNotFound(canonical.clone()))?;
                let parent_id = match dn2id.get(parent.as_bytes())? {
                    Some(guard) => bytes_to_id(guard.value()),
                    None => return Err(Error::ParentNotFound(parent.to_string())),
                };
                let mut children = id2children
                    .get(id_to_bytes(parent_id).as_slice())?
                    .map(|g| g.value().to_vec())
                    .unwrap_or_default();
                children.extend_from_slice(&id_to_bytes(id));
                id2children.insert(id_to_bytes(parent_id).as_slice(), children.as_slice())?;
            }

            dn2id.insert(canonical.as_bytes(), id_to_bytes(id).as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Delete a leaf entry.
    pub fn entry_delete(&self, dn_str: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let canonical = dn::normalize(dn_str)?;

        let txn = self.db.begin_write()?;
        {
            let mut id2entry = txn.open_table(ID2ENTRY)?;
            let mut dn2id = txn.open_table(DN2ID)?;
            let mut id2children = txn.open_table(ID2CHILDREN)?;

            let id = match dn2id.get(canonical.as_bytes())? {
                Some(guard) => bytes_to_id(guard.value()),
                None => return Err(Error::EntryNotFound),
            };
            let has_children = id2children
                .get(id_to_bytes(id).as_slice())?
                .map(|g| !g.value().is_empty())
                .unwrap_or(false);
            if has_children {
                return Err(Error::NonLeafEntry);
            }

            id2entry.remove(id_to_bytes(id).as_slice())?;
            dn2id.remove(canonical.as_bytes())?;
            id2children.remove(id_to_bytes(id).as_slice())?;

            if let Some(parent) = dn::parent(&canonical) {
                let parent_id = dn2id
                    .get(parent.as_bytes())?
                    .map(|g| bytes_to_id(g.value()));
                if let Some(parent_id) = parent_id {
                    let remaining: Vec<u64> = id2children
                        .get(id_to_bytes(parent_id).as_slice())?
                        .map(|g| unpack_ids(g.value()))
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|child| *child != id)
                        .collect();
                    if remaining.is_empty() {
                        id2children.remove(id_to_bytes(parent_id).as_slice())?;
                    } else {
                        id2children.insert(
                            id_to_bytes(parent_id).as_slice(),
                            pack_ids(&remaining).as_slice(),
                        )?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Apply attribute changes to an existing entry. RDN attributes are
    /// protected: their naming values cannot be removed.
    pub fn entry_modify(&self, dn_str: &str, changes: &[ModifyOp]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let canonical = dn::normalize(dn_str)?;
        let rdn = dn::parse(&canonical)?
            .into_iter()
            .next()
            .unwrap_or_default();

        let txn = self.db.begin_write()?;
        {
            let mut id2entry = txn.open_table(ID2ENTRY)?;
            let dn2id = txn.open_table(DN2ID)?;

            let id = match dn2id.get(canonical.as_bytes())? {
                Some(guard) => bytes_to_id(guard.value()),
                None => return Err(Error::EntryNotFound),
            };
            let mut entry = match id2entry.get(id_to_bytes(id).as_slice())? {
                Some(guard) => decode_entry(guard.value(), id)?,
                None => return Err(Error::EntryNotFound),
            };

            for change in changes {
                apply_change(&mut entry, change, &rdn)?;
            }

            let serialized = bincode::serialize(&entry)
                .map_err(|e| Error::Database(format!("error encoding entry: {e}")))?;
            id2entry.insert(id_to_bytes(id).as_slice(), serialized.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Resolve the ids covered by a search base and scope, and decode their
    /// entries.
    pub fn search(&self, base: &str, scope: StoreScope) -> Result<Vec<Entry>> {
        let canonical = dn::normalize(base)?;

        let txn = self.db.begin_read()?;
        let id2entry = txn.open_table(ID2ENTRY)?;
        let dn2id = txn.open_table(DN2ID)?;
        let id2children = txn.open_table(ID2CHILDREN)?;

        let base_id = match dn2id.get(canonical.as_bytes())? {
            Some(guard) => bytes_to_id(guard.value()),
            None => return Err(Error::EntryNotFound),
        };

        let children_of = |id: u64| -> Result<Vec<u64>> {
            Ok(id2children
                .get(id_to_bytes(id).as_slice())?
                .map(|g| unpack_ids(g.value()))
                .unwrap_or_default())
        };

        let mut ids = Vec::new();
        match scope {
            StoreScope::BaseObject => ids.push(base_id),
            StoreScope::SingleLevel => ids.extend(children_of(base_id)?),
            StoreScope::WholeSubtree => {
                // The parent/child structure is a tree; no cycles possible.
                let mut stack = vec![base_id];
                while let Some(id) = stack.pop() {
                    ids.push(id);
                    stack.extend(children_of(id)?);
                }
            }
        }

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            match id2entry.get(id_to_bytes(id).as_slice())? {
                Some(guard) => entries.push(decode_entry(guard.value(), id)?),
                None => return Err(Error::Database(format!("dangling entry id {id}"))),
            }
        }
        Ok(entries)
    }

    /// Every entry in ascending id order (parents were inserted before their
    /// children, so re-importing this order is always valid).
    pub fn all_entries(&self) -> Result<Vec<Entry>> {
        let txn = self.db.begin_read()?;
        let id2entry = txn.open_table(ID2ENTRY)?;

        let mut entries: Vec<(u64, Entry)> = Vec::new();
        for item in id2entry.iter()? {
            let (key, value) = item?;
            let id = bytes_to_id(key.value());
            entries.push((id, decode_entry(value.value(), id)?));
        }
        entries.sort_by_key(|(id, _)| *id);
        Ok(entries.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Cross-table consistency: id2entry keys equal dn2id values, and every
    /// id referenced by id2children exists in id2entry.
    pub fn verify_closure(&self) -> Result<()> {
        use std::collections::BTreeSet;

        let txn = self.db.begin_read()?;
        let id2entry = txn.open_table(ID2ENTRY)?;
        let dn2id = txn.open_table(DN2ID)?;
        let id2children = txn.open_table(ID2CHILDREN)?;

        let mut entry_ids = BTreeSet::new();
        for item in id2entry.iter()? {
            let (key, _) = item?;
            entry_ids.insert(bytes_to_id(key.value()));
        }

        let mut dn_ids = BTreeSet::new();
        for item in dn2id.iter()? {
            let (_, value) = item?;
            dn_ids.insert(bytes_to_id(value.value()));
        }
        if entry_ids != dn_ids {
            return Err(Error::Database(
                "id2entry and dn2id reference different ids".to_string(),
            ));
        }

        for item in id2children.iter()? {
            let (key, value) = item?;
            let parent = bytes_to_id(key.value());
            if !entry_ids.contains(&parent) {
                return Err(Error::Database(format!("dangling parent id {parent}")));
            }
            for child in unpack_ids(value.value()) {
                if !entry_ids.contains(&child) {
                    return Err(Error::Database(format!("dangling child id {child}")));
                }
            }
        }
        Ok(())
    }
}

fn apply_change(entry: &mut Entry, change: &ModifyOp, rdn: &[dn::Ava]) -> Result<()> {
    let rdn_values = |attr: &str| -> Vec<String> {
        rdn.iter()
            .filter(|ava| ava.attr_type.eq_ignore_ascii_case(attr))
            .map(|ava| String::from_utf8_lossy(&ava.value).to_lowercase())
            .collect()
    };

    match change {
        ModifyOp::Add { attr, values } => {
            match entry
                .attributes
                .iter_mut()
                .find(|a| a.name.eq_ignore_ascii_case(attr))
            {
                Some(existing) => {
                    for value in values {
                        if existing.values.contains(value) {
                            return Err(Error::AttributeOrValueExists(attr.clone()));
                        }
                        existing.values.push(value.clone());
                    }
                }
                None => entry.attributes.push(Attribute {
                    name: attr.clone(),
                    values: values.clone(),
                }),
            }
        }

        ModifyOp::Delete { attr, values } => {
            let naming = rdn_values(attr);
            let position = entry
                .attributes
                .iter()
                .position(|a| a.name.eq_ignore_ascii_case(attr))
                .ok_or_else(|| Error::NoSuchAttribute(attr.clone()))?;

            if values.is_empty() {
                if !naming.is_empty() {
                    return Err(Error::NotAllowedOnRdn(attr.clone()));
                }
                entry.attributes.remove(position);
            } else {
                for value in values {
                    if naming.contains(&value.to_lowercase()) {
                        return Err(Error::NotAllowedOnRdn(attr.clone()));
                    }
                    let attribute = &mut entry.attributes[position];
                    let idx = attribute
                        .values
                        .iter()
                        .position(|v| v == value)
                        .ok_or_else(|| Error::NoSuchAttribute(attr.clone()))?;
                    attribute.values.remove(idx);
                }
                if entry.attributes[position].values.is_empty() {
                    entry.attributes.remove(position);
                }
            }
        }

        ModifyOp::Replace { attr, values } => {
            let naming = rdn_values(attr);
            if !naming.is_empty() {
                let lowered: Vec<String> = values.iter().map(|v| v.to_lowercase()).collect();
                if naming.iter().any(|needed| !lowered.contains(needed)) {
                    return Err(Error::NotAllowedOnRdn(attr.clone()));
                }
            }
            match entry
                .attributes
                .iter_mut()
                .find(|a| a.name.eq_ignore_ascii_case(attr))
            {
                Some(existing) => {
                    if values.is_empty() {
                        let name = existing.name.clone();
                        entry.attributes.retain(|a| a.name != name);
                    } else {
                        existing.values = values.clone();
                    }
                }
                None => {
                    if !values.is_empty() {
                        entry.attributes.push(Attribute {
                            name: attr.clone(),
                            values: values.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_entry() -> Entry {
        Entry::with_attributes(
            "o=base",
            &[("o", &["base"][..]), ("objectClass", &["organization"][..])],
        )
    }

    fn sub_entry() -> Entry {
        Entry::with_attributes(
            "ou=sub,o=base",
            &[
                ("ou", &["sub"][..]),
                ("objectClass", &["organizationalUnit"][..]),
            ],
        )
    }

    fn user_entry() -> Entry {
        Entry::with_attributes(
            "uid=user,ou=sub,o=base",
            &[
                ("uid", &["user"][..]),
                ("displayName", &["DisplayName"][..]),
                ("mail", &["user@example"][..]),
                ("userPassword", &["secret"][..]),
            ],
        )
    }

    fn other_user_entry() -> Entry {
        Entry::with_attributes(
            "uid=user1,ou=sub,o=base",
            &[("uid", &["user1"][..]), ("mail", &["user1@example"][..])],
        )
    }

    fn open_store(dir: &tempfile::TempDir) -> DirStore {
        DirStore::open(
            "o=base",
            &dir.path().join("test.db"),
            StoreOptions::default(),
        )
        .unwrap()
    }

    fn populate(store: &DirStore) {
        for entry in [base_entry(), sub_entry(), user_entry(), other_user_entry()] {
            store.entry_put(&entry).unwrap();
        }
    }

    #[test]
    fn entry_put_single() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        // The first entry must be the base.
        assert!(store.entry_put(&sub_entry()).is_err());
        store.entry_put(&base_entry()).unwrap();

        // Same entry twice fails.
        assert!(matches!(
            store.entry_put(&base_entry()),
            Err(Error::EntryAlreadyExists)
        ));

        // Entry without a parent fails.
        assert!(matches!(
            store.entry_put(&user_entry()),
            Err(Error::ParentNotFound(_))
        ));

        // Entry outside the base is rejected.
        let outside = Entry::with_attributes("o=elsewhere", &[("o", &["elsewhere"][..])]);
        assert!(matches!(
            store.entry_put(&outside),
            Err(Error::NotUnderBase(_))
        ));
    }

    #[test]
    fn entry_put_multi_keeps_closure() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        populate(&store);
        store.verify_closure().unwrap();
        assert_eq!(store.all_entries().unwrap().len(), 4);
    }

    #[test]
    fn entry_delete_fails_on_missing_and_non_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        populate(&store);

        assert!(matches!(
            store.entry_delete("cn=doesnotexist,ou=sub,o=base"),
            Err(Error::EntryNotFound)
        ));
        assert!(matches!(
            store.entry_delete("ou=sub,o=base"),
            Err(Error::NonLeafEntry)
        ));
    }

    #[test]
    fn entry_delete_succeeds_on_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        populate(&store);

        store.entry_delete("uid=user,ou=sub,o=base").unwrap();
        store.verify_closure().unwrap();
        assert!(matches!(
            store.search("uid=user,ou=sub,o=base", StoreScope::BaseObject),
            Err(Error::EntryNotFound)
        ));

        // The sibling is still reachable through the parent.
        let found = store.search("ou=sub,o=base", StoreScope::SingleLevel).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].dn, "uid=user1,ou=sub,o=base");

        store.entry_delete("uid=user1,ou=sub,o=base").unwrap();
        let found = store.search("ou=sub,o=base", StoreScope::SingleLevel).unwrap();
        assert!(found.is_empty());
        store.verify_closure().unwrap();
    }

    #[test]
    fn search_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        populate(&store);

        let found = store.search("o=base", StoreScope::BaseObject).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].dn, "o=base");

        let found = store.search("o=base", StoreScope::SingleLevel).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].dn, "ou=sub,o=base");

        let found = store.search("o=base", StoreScope::WholeSubtree).unwrap();
        assert_eq!(found.len(), 4);

        let found = store
            .search("ou=sub,o=base", StoreScope::WholeSubtree)
            .unwrap();
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn ids_stay_monotonic_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let store =
                DirStore::open("o=base", &path, StoreOptions::default()).unwrap();
            store.entry_put(&base_entry()).unwrap();
            store.entry_put(&sub_entry()).unwrap();
        }
        let store = DirStore::open("o=base", &path, StoreOptions::default()).unwrap();
        store.entry_put(&user_entry()).unwrap();
        store.verify_closure().unwrap();
        assert_eq!(store.all_entries().unwrap().len(), 3);
    }

    #[test]
    fn read_only_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let store = DirStore::open("o=base", &path, StoreOptions::default()).unwrap();
            store.entry_put(&base_entry()).unwrap();
        }
        let store =
            DirStore::open("o=base", &path, StoreOptions { read_only: true }).unwrap();
        assert!(matches!(
            store.entry_put(&sub_entry()),
            Err(Error::ReadOnly)
        ));
        assert_eq!(store.search("o=base", StoreScope::BaseObject).unwrap().len(), 1);
    }

    #[test]
    fn modify_add_and_delete_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        populate(&store);
        let dn = "uid=user,ou=sub,o=base";

        store
            .entry_modify(
                dn,
                &[ModifyOp::Add {
                    attr: "mail".to_string(),
                    values: vec!["second@example".to_string()],
                }],
            )
            .unwrap();
        let entry = &store.search(dn, StoreScope::BaseObject).unwrap()[0];
        assert_eq!(entry.values("mail").len(), 2);

        // Adding a value that is already present fails.
        assert!(matches!(
            store.entry_modify(
                dn,
                &[ModifyOp::Add {
                    attr: "mail".to_string(),
                    values: vec!["second@example".to_string()],
                }],
            ),
            Err(Error::AttributeOrValueExists(_))
        ));

        // Deleting an absent value fails.
        assert!(matches!(
            store.entry_modify(
                dn,
                &[ModifyOp::Delete {
                    attr: "mail".to_string(),
                    values: vec!["missing@example".to_string()],
                }],
            ),
            Err(Error::NoSuchAttribute(_))
        ));

        store
            .entry_modify(
                dn,
                &[ModifyOp::Delete {
                    attr: "mail".to_string(),
                    values: vec!["second@example".to_string()],
                }],
            )
            .unwrap();
        let entry = &store.search(dn, StoreScope::BaseObject).unwrap()[0];
        assert_eq!(entry.values("mail").len(), 1);
    }

    #[test]
    fn modify_protects_rdn_attribute() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        populate(&store);
        let dn = "uid=user,ou=sub,o=base";

        // Removing the whole RDN attribute is refused.
        assert!(matches!(
            store.entry_modify(
                dn,
                &[ModifyOp::Delete {
                    attr: "uid".to_string(),
                    values: Vec::new(),
                }],
            ),
            Err(Error::NotAllowedOnRdn(_))
        ));

        // Removing the naming value is refused.
        assert!(matches!(
            store.entry_modify(
                dn,
                &[ModifyOp::Delete {
                    attr: "uid".to_string(),
                    values: vec!["user".to_string()],
                }],
            ),
            Err(Error::NotAllowedOnRdn(_))
        ));

        // Replacing without the naming value is refused; keeping it is fine.
        assert!(matches!(
            store.entry_modify(
                dn,
                &[ModifyOp::Replace {
                    attr: "uid".to_string(),
                    values: vec!["other".to_string()],
                }],
            ),
            Err(Error::NotAllowedOnRdn(_))
        ));
        store
            .entry_modify(
                dn,
                &[ModifyOp::Replace {
                    attr: "uid".to_string(),
                    values: vec!["user".to_string(), "alias".to_string()],
                }],
            )
            .unwrap();
    }
}
