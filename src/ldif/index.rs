//! Attribute index register and the filter index planner.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::ldap::filter::Filter;
use crate::ldif::entry::LdifEntry;

/// Indexed attributes and the operations covered for each. objectClass is
/// deliberately absent: every entry has it, so it never narrows a search.
static INDEX_ATTRIBUTES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("entryuuid", "eq"),
        ("cn", "pres,eq,sub"),
        ("gidnumber", "eq"),
        ("mail", "eq,pres"),
        ("memberuid", "eq"),
        ("ou", "eq"),
        ("uid", "pres,eq,sub"),
        ("uidnumber", "eq"),
        ("uniquemember", "eq"),
        ("sn", "pres,eq,sub"),
        ("givenname", "pres,eq,sub"),
    ])
});

type EntryList = Vec<Arc<LdifEntry>>;

#[derive(Debug, Default)]
pub struct IndexRegister {
    eq: HashMap<String, HashMap<String, EntryList>>,
    pres: HashMap<String, EntryList>,
    sub: HashMap<String, BTreeMap<String, EntryList>>,
}

impl IndexRegister {
    pub fn new() -> Self {
        let mut register = IndexRegister::default();
        for (attr, ops) in INDEX_ATTRIBUTES.iter() {
            for op in ops.split(',') {
                match op {
                    "eq" => {
                        register.eq.insert(attr.to_string(), HashMap::new());
                    }
                    "pres" => {
                        register.pres.insert(attr.to_string(), Vec::new());
                    }
                    "sub" => {
                        register.sub.insert(attr.to_string(), BTreeMap::new());
                    }
                    other => unreachable!("unknown index op {other}"),
                }
            }
        }
        register
    }

    /// Index one attribute of an entry. Attributes without a configured
    /// index are refused, mirroring the register contract.
    pub fn add(&mut self, name: &str, values: &[String], entry: &Arc<LdifEntry>) -> bool {
        let name = name.to_lowercase();
        let mut added = false;

        if let Some(index) = self.eq.get_mut(&name) {
            for value in values {
                index
                    .entry(value.to_lowercase())
                    .or_default()
                    .push(entry.clone());
            }
            added = true;
        }
        if let Some(index) = self.pres.get_mut(&name) {
            index.push(entry.clone());
            added = true;
        }
        if let Some(index) = self.sub.get_mut(&name) {
            for value in values {
                index
                    .entry(value.to_lowercase())
                    .or_default()
                    .push(entry.clone());
            }
            added = true;
        }
        added
    }

    fn load_eq(&self, attr: &str, value: &str) -> Option<EntryList> {
        self.eq
            .get(attr)
            .map(|index| index.get(&value.to_lowercase()).cloned().unwrap_or_default())
    }

    fn load_pres(&self, attr: &str) -> Option<EntryList> {
        self.pres.get(attr).cloned()
    }

    fn load_sub_initial(&self, attr: &str, initial: &str) -> Option<EntryList> {
        let index = self.sub.get(attr)?;
        let prefix = initial.to_lowercase();
        let mut out = Vec::new();
        for (value, entries) in index.range(prefix.clone()..) {
            if !value.starts_with(&prefix) {
                break;
            }
            out.extend(entries.iter().cloned());
        }
        Some(out)
    }

    fn load_sub_all(&self, attr: &str) -> Option<EntryList> {
        let index = self.sub.get(attr)?;
        let mut out = Vec::new();
        for entries in index.values() {
            out.extend(entries.iter().cloned());
        }
        Some(out)
    }

    /// Build a candidate set for a filter from the indexes alone.
    ///
    /// Returns None when the filter cannot be answered from the indexes and
    /// the caller must fall back to a suffix walk. The set is always a
    /// superset of the matching entries; the filter is re-applied afterward,
    /// so AND intersects, OR unions, and anything OR cannot bound forces the
    /// fallback.
    pub fn plan(&self, filter: &Filter) -> Option<EntryList> {
        match self.plan_node(filter) {
            PlanSet::Set(entries) => Some(dedup(entries)),
            _ => None,
        }
    }

    fn plan_node(&self, filter: &Filter) -> PlanSet {
        match filter {
            Filter::Equality { attr, value } => {
                let attr = attr.to_lowercase();
                if attr == "objectclass" {
                    return PlanSet::Neutral;
                }
                match self.load_eq(&attr, value) {
                    Some(entries) => PlanSet::Set(entries),
                    None => PlanSet::Unplannable,
                }
            }
            Filter::Present { attr } => {
                let attr = attr.to_lowercase();
                if attr == "objectclass" {
                    return PlanSet::Neutral;
                }
                match self.load_pres(&attr) {
                    Some(entries) => PlanSet::Set(entries),
                    None => PlanSet::Unplannable,
                }
            }
            Filter::Substrings { attr, initial, .. } => {
                let attr = attr.to_lowercase();
                if attr == "objectclass" {
                    return PlanSet::Neutral;
                }
                let from_sub = match initial {
                    Some(initial) => self.load_sub_initial(&attr, initial),
                    None => self.load_sub_all(&attr),
                };
                // A presence index still bounds the candidates when there is
                // no substring index for the attribute.
                match from_sub.or_else(|| self.load_pres(&attr)) {
                    Some(entries) => PlanSet::Set(entries),
                    None => PlanSet::Unplannable,
                }
            }
            Filter::And(children) => {
                let mut acc: Option<EntryList> = None;
                for child in children {
                    match self.plan_node(child) {
                        PlanSet::Set(entries) => {
                            acc = Some(match acc {
                                None => entries,
                                Some(prev) => intersect(prev, &entries),
                            });
                        }
                        // Leaves the indexes cannot answer do not widen an
                        // AND; the re-applied filter handles them.
                        PlanSet::Neutral | PlanSet::Unplannable => {}
                    }
                }
                match acc {
                    Some(entries) => PlanSet::Set(entries),
                    None => PlanSet::Unplannable,
                }
            }
            Filter::Or(children) => {
                if children.is_empty() {
                    return PlanSet::Set(Vec::new());
                }
                let mut acc = Vec::new();
                for child in children {
                    match self.plan_node(child) {
                        PlanSet::Set(entries) => acc.extend(entries),
                        // A branch the indexes cannot bound makes the whole
                        // OR unbounded.
                        PlanSet::Neutral | PlanSet::Unplannable => return PlanSet::Unplannable,
                    }
                }
                PlanSet::Set(acc)
            }
            // NOT and the remaining match kinds never narrow a candidate
            // set.
            Filter::Not(_)
            | Filter::GreaterOrEqual { .. }
            | Filter::LessOrEqual { .. }
            | Filter::Approx { .. }
            | Filter::Extensible { .. } => PlanSet::Neutral,
        }
    }
}

enum PlanSet {
    Set(EntryList),
    /// Does not narrow candidates but does not invalidate an AND plan.
    Neutral,
    Unplannable,
}

fn dedup(entries: EntryList) -> EntryList {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert(Arc::as_ptr(e) as usize))
        .collect()
}

fn intersect(lhs: EntryList, rhs: &EntryList) -> EntryList {
    let keep: HashSet<usize> = rhs.iter().map(|e| Arc::as_ptr(e) as usize).collect();
    lhs.into_iter()
        .filter(|e| keep.contains(&(Arc::as_ptr(e) as usize)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;

    fn make_entry(uid: &str, mail: &str) -> Arc<LdifEntry> {
        let dn = format!("uid={uid},ou=users,o=base");
        let entry = Entry::with_attributes(
            dn.clone(),
            &[
                ("objectClass", &["inetOrgPerson"][..]),
                ("uid", &[uid][..]),
                ("mail", &[mail][..]),
            ],
        );
        Arc::new(LdifEntry::new(entry, dn.to_lowercase()))
    }

    fn build() -> (IndexRegister, Vec<Arc<LdifEntry>>) {
        let mut register = IndexRegister::new();
        let entries = vec![
            make_entry("alice", "alice@example.com"),
            make_entry("anna", "anna@example.com"),
            make_entry("bob", "bob@example.org"),
        ];
        for entry in &entries {
            for attr in &entry.entry.attributes {
                register.add(&attr.name, &attr.values, entry);
            }
        }
        (register, entries)
    }

    #[test]
    fn equality_plan_uses_index() {
        let (register, _) = build();
        let filter = Filter::parse("(uid=alice)").unwrap();
        let plan = register.plan(&filter).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].entry.first_value("uid"), Some("alice"));
    }

    #[test]
    fn unindexed_attribute_forces_walk() {
        let (register, _) = build();
        let filter = Filter::parse("(description=x)").unwrap();
        assert!(register.plan(&filter).is_none());
    }

    #[test]
    fn objectclass_only_filter_forces_walk() {
        let (register, _) = build();
        let filter = Filter::parse("(objectClass=*)").unwrap();
        assert!(register.plan(&filter).is_none());
    }

    #[test]
    fn and_intersects() {
        let (register, _) = build();
        let filter = Filter::parse("(&(uid=a*)(mail=*@example.com))").unwrap();
        let plan = register.plan(&filter).unwrap();
        // uid substring index bounds to {alice, anna}; the mail leaf falls
        // back to the mail presence index covering all three entries.
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn or_unions() {
        let (register, _) = build();
        let filter = Filter::parse("(|(uid=alice)(uid=bob))").unwrap();
        let plan = register.plan(&filter).unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn or_with_unbounded_branch_forces_walk() {
        let (register, _) = build();
        let filter = Filter::parse("(|(uid=alice)(objectClass=person))").unwrap();
        assert!(register.plan(&filter).is_none());
        let filter = Filter::parse("(|(uid=alice)(!(uid=bob)))").unwrap();
        assert!(register.plan(&filter).is_none());
    }

    #[test]
    fn not_under_and_is_neutral() {
        let (register, _) = build();
        let filter = Filter::parse("(&(uid=alice)(!(mail=bob@example.org)))").unwrap();
        let plan = register.plan(&filter).unwrap();
        assert_eq!(plan.len(), 1);
    }
}
