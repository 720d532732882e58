use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::types::{ChangeSet, FieldChange, Record, Snapshot};

/// Fields computed by enrichment or storage; never compared.
pub const DERIVED_FIELDS: [&str; 3] = ["coordinates", "elevation", "_id"];
/// Address components; a change to any of them invalidates the stored coordinates.
pub const IDENTITY_FIELDS: [&str; 2] = ["streetName", "postalCodeCity"];

/// Which serialized fields take part in equality, and which of those locate a listing.
#[derive(Debug, Clone)]
pub struct ComparisonPolicy {
    derived: BTreeSet<String>,
    identity: BTreeSet<String>,
}

impl Default for ComparisonPolicy {
    fn default() -> Self {
        ComparisonPolicy::new(DERIVED_FIELDS, IDENTITY_FIELDS)
    }
}

impl ComparisonPolicy {
    pub fn new<D, I>(derived: D, identity: I) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        ComparisonPolicy {
            derived: derived.into_iter().map(Into::into).collect(),
            identity: identity.into_iter().map(Into::into).collect(),
        }
    }

    /// Names of the non-derived fields whose values differ.
    pub fn changed_fields(&self, stored: &Record, current: &Record) -> BTreeSet<String> {
        let stored = self.comparable(stored);
        let current = self.comparable(current);
        stored
            .keys()
            .chain(current.keys())
            .filter(|name| {
                stored.get(*name).unwrap_or(&Value::Null)
                    != current.get(*name).unwrap_or(&Value::Null)
            })
            .cloned()
            .collect()
    }

    pub fn is_unchanged(&self, stored: &Record, current: &Record) -> bool {
        self.changed_fields(stored, current).is_empty()
    }

    pub fn requires_geocode(&self, changed_fields: &BTreeSet<String>) -> bool {
        changed_fields.iter().any(|f| self.identity.contains(f))
    }

    fn comparable(&self, record: &Record) -> Map<String, Value> {
        let mut fields = match serde_json::to_value(record) {
            Ok(Value::Object(map)) => map,
            // a Record always serializes to an object
            _ => Map::new(),
        };
        fields.retain(|name, _| !self.derived.contains(name));
        fields
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    policy: ComparisonPolicy,
}

impl Reconciler {
    pub fn new(policy: ComparisonPolicy) -> Self {
        Reconciler { policy }
    }

    pub fn policy(&self) -> &ComparisonPolicy {
        &self.policy
    }

    /// Classifies `current` against `stored` into inserts, updates and deletes.
    ///
    /// Unchanged records appear in none of the lists. Every list is sorted by id.
    pub fn diff(&self, current: &Snapshot, stored: &Snapshot) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for (id, record) in current.iter() {
            match stored.get(id) {
                Some(previous) => {
                    if !self.policy.is_unchanged(previous, record) {
                        changes.to_update.push(record.clone());
                    }
                }
                None => changes.to_insert.push(record.clone()),
            }
        }

        for (id, record) in stored.iter() {
            if !current.contains(id) {
                changes.to_delete.push(record.clone());
            }
        }

        changes.to_insert.sort_by(|a, b| a.id.cmp(&b.id));
        changes.to_update.sort_by(|a, b| a.id.cmp(&b.id));
        changes.to_delete.sort_by(|a, b| a.id.cmp(&b.id));
        changes
    }

    /// Per updated record, the changed fields and whether it must be geocoded again.
    pub fn field_changes(&self, changes: &ChangeSet, stored: &Snapshot) -> Vec<FieldChange> {
        changes
            .to_update
            .iter()
            .filter_map(|record| {
                let previous = stored.get(&record.id)?;
                let changed_fields = self.policy.changed_fields(previous, record);
                let needs_geocode = self.policy.requires_geocode(&changed_fields);
                if needs_geocode {
                    debug!(
                        "listing {} changed address fields {:?}",
                        record.id, changed_fields
                    );
                }
                Some(FieldChange {
                    id: record.id.clone(),
                    changed_fields,
                    needs_geocode,
                })
            })
            .collect()
    }
}
