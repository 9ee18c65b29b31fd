//! Per-workspace dynamic attribute definitions
//! and the single primary-key designation.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use cohort_core::types::{AttributeParameter, AttributeType, CustomerKey};
use cohort_core::{CohortError, CohortResult};

use crate::customers::{CustomerStore, WorkspaceProfiles};

/// Request to create an attribute definition.
#[derive(Debug, Clone)]
pub struct NewKey {
    pub name: String,
    pub attribute_type: AttributeType,
    pub subtype: Option<AttributeType>,
    pub parameter: Option<AttributeParameter>,
}

impl NewKey {
    pub fn new(name: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attribute_type,
            subtype: None,
            parameter: None,
        }
    }
}

/// Request to rename an attribute definition.
#[derive(Debug, Clone)]
pub struct KeyRename {
    pub id: Uuid,
    pub new_name: String,
}

/// Registry over the workspace attribute schema. Every operation is
/// workspace-scoped and runs inside the caller's transaction when one is
/// supplied, or opens its own.
pub struct SchemaRegistry {
    store: Arc<CustomerStore>,
    duplicate_scan_limit: usize,
}

impl SchemaRegistry {
    pub fn new(store: Arc<CustomerStore>, duplicate_scan_limit: usize) -> Self {
        Self {
            store,
            duplicate_scan_limit: duplicate_scan_limit.max(1),
        }
    }

    // ── reads ──

    pub fn get_all(&self, workspace_id: Uuid) -> Vec<CustomerKey> {
        self.store
            .read(workspace_id, |ws| ws.keys().cloned().collect())
    }

    pub fn get_primary_key(&self, workspace_id: Uuid) -> Option<CustomerKey> {
        self.store
            .read(workspace_id, |ws| ws.primary_key().cloned())
    }

    pub fn get_key_by_name(&self, workspace_id: Uuid, name: &str) -> Option<CustomerKey> {
        self.store
            .read(workspace_id, |ws| ws.key_by_name(name).cloned())
    }

    // ── writes ──

    pub fn create_key(
        &self,
        workspace_id: Uuid,
        new: NewKey,
        txn: Option<&mut WorkspaceProfiles>,
    ) -> CohortResult<CustomerKey> {
        self.store
            .with_txn(workspace_id, txn, |t| Self::create_key_in(workspace_id, t, new))
    }

    pub fn update_key(
        &self,
        workspace_id: Uuid,
        id: Uuid,
        new_name: &str,
        txn: Option<&mut WorkspaceProfiles>,
    ) -> CohortResult<CustomerKey> {
        self.store
            .with_txn(workspace_id, txn, |t| Self::update_key_in(t, id, new_name))
    }

    pub fn delete_key(
        &self,
        workspace_id: Uuid,
        id: Uuid,
        txn: Option<&mut WorkspaceProfiles>,
    ) -> CohortResult<()> {
        self.store
            .with_txn(workspace_id, txn, |t| Self::delete_key_in(t, id))
    }

    /// Promote the named attribute to primary key. No-op when it already is
    /// primary; the previous primary is demoted in the same transaction.
    pub fn promote_primary_key(
        &self,
        workspace_id: Uuid,
        name: &str,
        txn: Option<&mut WorkspaceProfiles>,
    ) -> CohortResult<CustomerKey> {
        let limit = self.duplicate_scan_limit;
        self.store.with_txn(workspace_id, txn, |t| {
            Self::promote_primary_key_in(workspace_id, t, name, limit)
        })
    }

    /// Apply create/rename/delete batches inside one transaction. Any
    /// single failure rolls back the entire batch.
    pub fn modify_keys(
        &self,
        workspace_id: Uuid,
        created: Vec<NewKey>,
        updated: Vec<KeyRename>,
        deleted: Vec<Uuid>,
        txn: Option<&mut WorkspaceProfiles>,
    ) -> CohortResult<Vec<CustomerKey>> {
        self.store.with_txn(workspace_id, txn, |t| {
            let mut out = Vec::with_capacity(created.len() + updated.len());
            for new in created {
                out.push(Self::create_key_in(workspace_id, t, new)?);
            }
            for rename in updated {
                out.push(Self::update_key_in(t, rename.id, &rename.new_name)?);
            }
            for id in deleted {
                Self::delete_key_in(t, id)?;
            }
            Ok(out)
        })
    }

    // ── transactional bodies ──

    fn create_key_in(
        workspace_id: Uuid,
        txn: &mut WorkspaceProfiles,
        new: NewKey,
    ) -> CohortResult<CustomerKey> {
        validate_name(&new.name)?;
        if let Some(subtype) = new.subtype {
            if !subtype.can_be_subtype() {
                return Err(CohortError::validation(format!(
                    "{subtype:?} cannot be used as a subtype"
                )));
            }
        }
        if new.parameter.is_some() && !new.attribute_type.requires_parameter() {
            return Err(CohortError::validation(format!(
                "{:?} attributes do not take a parameter",
                new.attribute_type
            )));
        }
        let duplicate = txn
            .keys()
            .any(|k| k.name == new.name && k.attribute_type == new.attribute_type);
        if duplicate {
            return Err(CohortError::conflict(format!(
                "attribute '{}' with type {:?} already exists",
                new.name, new.attribute_type
            )));
        }

        let mut key = CustomerKey::new(workspace_id, new.name, new.attribute_type);
        key.subtype = new.subtype;
        key.parameter = new.parameter;
        info!(workspace_id = %workspace_id, name = %key.name, "attribute created");
        metrics::counter!("schema.keys_created").increment(1);
        txn.insert_key(key.clone());
        Ok(key)
    }

    fn update_key_in(
        txn: &mut WorkspaceProfiles,
        id: Uuid,
        new_name: &str,
    ) -> CohortResult<CustomerKey> {
        validate_name(new_name)?;
        let existing = txn
            .key(&id)
            .cloned()
            .ok_or_else(|| CohortError::not_found(format!("attribute {id}")))?;
        if existing.name == new_name {
            return Ok(existing);
        }
        let old_name = existing.name;

        txn.rename_attribute_everywhere(&old_name, new_name);
        let key = txn
            .key_mut(&id)
            .ok_or_else(|| CohortError::not_found(format!("attribute {id}")))?;
        key.name = new_name.to_string();
        key.updated_at = chrono::Utc::now();
        let key = key.clone();
        info!(old = %old_name, new = %new_name, "attribute renamed");
        Ok(key)
    }

    fn delete_key_in(txn: &mut WorkspaceProfiles, id: Uuid) -> CohortResult<()> {
        let key = txn
            .remove_key(&id)
            .ok_or_else(|| CohortError::not_found(format!("attribute {id}")))?;
        // Definition removal and the workspace-wide value strip commit together.
        txn.remove_attribute_everywhere(&key.name);
        info!(name = %key.name, "attribute deleted");
        metrics::counter!("schema.keys_deleted").increment(1);
        Ok(())
    }

    fn promote_primary_key_in(
        workspace_id: Uuid,
        txn: &mut WorkspaceProfiles,
        name: &str,
        duplicate_scan_limit: usize,
    ) -> CohortResult<CustomerKey> {
        let candidate = txn
            .key_by_name(name)
            .cloned()
            .ok_or_else(|| CohortError::validation(format!("attribute '{name}' does not exist")))?;

        if candidate.is_primary {
            // Already primary: no write, no side effects.
            return Ok(candidate);
        }
        let candidate_id = candidate.id;

        check_unique_values(txn, name, duplicate_scan_limit)?;

        if let Some(previous) = txn.primary_key().map(|k| k.id) {
            if let Some(prev) = txn.key_mut(&previous) {
                prev.is_primary = false;
                prev.updated_at = chrono::Utc::now();
            }
        }
        let key = txn
            .key_mut(&candidate_id)
            .ok_or_else(|| CohortError::not_found(format!("attribute {candidate_id}")))?;
        key.is_primary = true;
        key.updated_at = chrono::Utc::now();
        let key = key.clone();
        info!(workspace_id = %workspace_id, name = %name, "primary key promoted");
        metrics::counter!("schema.primary_key_promotions").increment(1);
        Ok(key)
    }
}

/// Names start with a letter and continue with letters, digits, or
/// underscores.
fn validate_name(name: &str) -> CohortResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CohortError::validation(format!(
            "invalid attribute name '{name}'"
        )))
    }
}

/// Grouped duplicate-count check with an early-exit limit: the scan stops
/// as soon as enough duplicate groups are found to reject the candidate.
/// A missing or null value also rejects.
fn check_unique_values(
    txn: &WorkspaceProfiles,
    name: &str,
    duplicate_scan_limit: usize,
) -> CohortResult<()> {
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut duplicate_groups = 0usize;

    for customer in txn.customers() {
        let value = match customer.user_attributes.get(name) {
            Some(v) if !v.is_null() => v.to_string(),
            _ => {
                return Err(CohortError::validation(format!(
                    "attribute '{name}' is missing on customer {}",
                    customer.id
                )))
            }
        };
        let count = counts.entry(value).or_insert(0);
        *count += 1;
        if *count == 2 {
            duplicate_groups += 1;
            if duplicate_groups >= duplicate_scan_limit {
                break;
            }
        }
    }

    if duplicate_groups > 0 {
        return Err(CohortError::validation(format!(
            "attribute '{name}' has duplicate values across customers"
        )));
    }
    Ok(())
}
