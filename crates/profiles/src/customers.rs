//! Workspace-scoped customer persistence with snapshot transactions.
//!
//! Every mutating operation either borrows a caller-supplied transaction
//! (`&mut WorkspaceProfiles`) or opens its own scoped one via
//! [`CustomerStore::transaction`]. A transaction works on a copy of the
//! workspace state and is swapped in only on success, so a failed batch
//! never leaves partial writes behind.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use cohort_core::types::{Customer, CustomerKey};
use cohort_core::{CohortError, CohortResult};

/// The mutable state of one workspace: customer rows plus the attribute
/// schema definitions that shape them.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceProfiles {
    customers: HashMap<Uuid, Customer>,
    keys: HashMap<Uuid, CustomerKey>,
}

impl WorkspaceProfiles {
    // ── customers ──

    pub fn insert_customer(&mut self, customer: Customer) {
        self.customers.insert(customer.id, customer);
    }

    pub fn customer(&self, id: &Uuid) -> Option<&Customer> {
        self.customers.get(id)
    }

    pub fn customer_mut(&mut self, id: &Uuid) -> Option<&mut Customer> {
        self.customers.get_mut(id)
    }

    pub fn customers(&self) -> impl Iterator<Item = &Customer> {
        self.customers.values()
    }

    pub fn customer_count(&self) -> usize {
        self.customers.len()
    }

    /// Merge the given attributes into a customer's attribute map.
    pub fn set_attributes(
        &mut self,
        customer_id: &Uuid,
        attributes: HashMap<String, serde_json::Value>,
    ) -> CohortResult<()> {
        let customer = self
            .customers
            .get_mut(customer_id)
            .ok_or_else(|| CohortError::not_found(format!("customer {customer_id}")))?;
        customer.user_attributes.extend(attributes);
        customer.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Strip an attribute from every customer in the workspace.
    pub fn remove_attribute_everywhere(&mut self, name: &str) {
        for customer in self.customers.values_mut() {
            if customer.user_attributes.remove(name).is_some() {
                customer.updated_at = chrono::Utc::now();
            }
        }
    }

    /// Move values stored under `old` to `new` on every customer.
    pub fn rename_attribute_everywhere(&mut self, old: &str, new: &str) {
        for customer in self.customers.values_mut() {
            if let Some(value) = customer.user_attributes.remove(old) {
                customer.user_attributes.insert(new.to_string(), value);
                customer.updated_at = chrono::Utc::now();
            }
        }
    }

    /// All customers whose stored attribute equals the given value.
    pub fn find_by_attribute(&self, name: &str, value: &serde_json::Value) -> Vec<&Customer> {
        self.customers
            .values()
            .filter(|c| c.user_attributes.get(name) == Some(value))
            .collect()
    }

    /// All customers whose uuid or alias ids match the correlation value.
    pub fn find_by_correlation(&self, correlation: &str) -> Vec<&Customer> {
        self.customers
            .values()
            .filter(|c| {
                c.id.to_string() == correlation || c.other_ids.iter().any(|o| o == correlation)
            })
            .collect()
    }

    // ── schema definitions ──

    pub fn insert_key(&mut self, key: CustomerKey) {
        self.keys.insert(key.id, key);
    }

    pub fn remove_key(&mut self, id: &Uuid) -> Option<CustomerKey> {
        self.keys.remove(id)
    }

    pub fn key(&self, id: &Uuid) -> Option<&CustomerKey> {
        self.keys.get(id)
    }

    pub fn key_mut(&mut self, id: &Uuid) -> Option<&mut CustomerKey> {
        self.keys.get_mut(id)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CustomerKey> {
        self.keys.values()
    }

    pub fn key_by_name(&self, name: &str) -> Option<&CustomerKey> {
        self.keys.values().find(|k| k.name == name)
    }

    pub fn primary_key(&self) -> Option<&CustomerKey> {
        self.keys.values().find(|k| k.is_primary)
    }
}

/// Concurrent store of per-workspace profile state. Cross-workspace ids
/// never collide: every read and write goes through the workspace entry.
pub struct CustomerStore {
    workspaces: DashMap<Uuid, Arc<RwLock<WorkspaceProfiles>>>,
}

impl Default for CustomerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CustomerStore {
    pub fn new() -> Self {
        Self {
            workspaces: DashMap::new(),
        }
    }

    fn workspace(&self, workspace_id: Uuid) -> Arc<RwLock<WorkspaceProfiles>> {
        self.workspaces
            .entry(workspace_id)
            .or_insert_with(|| Arc::new(RwLock::new(WorkspaceProfiles::default())))
            .clone()
    }

    /// Run `f` against a working copy of the workspace state. The copy is
    /// swapped in only when `f` returns `Ok`; on error it is dropped, so
    /// the batch rolls back as a whole and no guard survives the exit.
    pub fn transaction<T>(
        &self,
        workspace_id: Uuid,
        f: impl FnOnce(&mut WorkspaceProfiles) -> CohortResult<T>,
    ) -> CohortResult<T> {
        let entry = self.workspace(workspace_id);
        let mut guard = entry.write();
        let mut working = guard.clone();
        let result = f(&mut working)?;
        *guard = working;
        Ok(result)
    }

    /// Run `f` inside the caller's transaction when one is supplied,
    /// otherwise open a scoped one. Behavior is identical either way.
    pub fn with_txn<T>(
        &self,
        workspace_id: Uuid,
        txn: Option<&mut WorkspaceProfiles>,
        f: impl FnOnce(&mut WorkspaceProfiles) -> CohortResult<T>,
    ) -> CohortResult<T> {
        match txn {
            Some(txn) => f(txn),
            None => self.transaction(workspace_id, f),
        }
    }

    /// Read-only access to the workspace state.
    pub fn read<T>(&self, workspace_id: Uuid, f: impl FnOnce(&WorkspaceProfiles) -> T) -> T {
        let entry = self.workspace(workspace_id);
        let guard = entry.read();
        f(&guard)
    }

    pub fn create_customer(&self, customer: Customer) -> CohortResult<Customer> {
        let workspace_id = customer.workspace_id;
        debug!(customer_id = %customer.id, workspace_id = %workspace_id, "creating customer");
        self.transaction(workspace_id, |txn| {
            if txn.customer(&customer.id).is_some() {
                return Err(CohortError::conflict(format!(
                    "customer {} already exists",
                    customer.id
                )));
            }
            txn.insert_customer(customer.clone());
            Ok(customer)
        })
    }

    pub fn get_customer(&self, workspace_id: Uuid, id: &Uuid) -> Option<Customer> {
        self.read(workspace_id, |ws| ws.customer(id).cloned())
    }

    pub fn list_customers(&self, workspace_id: Uuid) -> Vec<Customer> {
        self.read(workspace_id, |ws| ws.customers().cloned().collect())
    }

    pub fn customer_count(&self, workspace_id: Uuid) -> usize {
        self.read(workspace_id, |ws| ws.customer_count())
    }

    /// Expand a set of customer ids to full rows in one pass. Ids that no
    /// longer resolve are silently dropped.
    pub fn expand(&self, workspace_id: Uuid, ids: &[Uuid]) -> Vec<Customer> {
        self.read(workspace_id, |ws| {
            ids.iter().filter_map(|id| ws.customer(id).cloned()).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn customer_with(workspace_id: Uuid, key: &str, value: serde_json::Value) -> Customer {
        let mut c = Customer::new(workspace_id);
        c.user_attributes.insert(key.to_string(), value);
        c
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = CustomerStore::new();
        let ws = Uuid::new_v4();
        let customer = customer_with(ws, "plan", json!("pro"));
        let id = customer.id;
        store.create_customer(customer).unwrap();

        let result: CohortResult<()> = store.transaction(ws, |txn| {
            txn.customer_mut(&id)
                .unwrap()
                .user_attributes
                .insert("plan".into(), json!("free"));
            Err(CohortError::validation("boom"))
        });
        assert!(result.is_err());

        let stored = store.get_customer(ws, &id).unwrap();
        assert_eq!(stored.user_attributes["plan"], json!("pro"));
    }

    #[test]
    fn test_workspace_isolation() {
        let store = CustomerStore::new();
        let ws_a = Uuid::new_v4();
        let ws_b = Uuid::new_v4();
        let customer = customer_with(ws_a, "plan", json!("pro"));
        let id = customer.id;
        store.create_customer(customer).unwrap();

        assert!(store.get_customer(ws_a, &id).is_some());
        assert!(store.get_customer(ws_b, &id).is_none());
    }

    #[test]
    fn test_find_by_correlation_matches_uuid_and_aliases() {
        let store = CustomerStore::new();
        let ws = Uuid::new_v4();
        let mut customer = Customer::new(ws);
        customer.other_ids.push("crm-42".into());
        let id = customer.id;
        store.create_customer(customer).unwrap();

        store.read(ws, |w| {
            assert_eq!(w.find_by_correlation(&id.to_string()).len(), 1);
            assert_eq!(w.find_by_correlation("crm-42").len(), 1);
            assert!(w.find_by_correlation("crm-99").is_empty());
        });
    }

    #[test]
    fn test_expand_drops_unknown_ids() {
        let store = CustomerStore::new();
        let ws = Uuid::new_v4();
        let customer = Customer::new(ws);
        let id = customer.id;
        store.create_customer(customer).unwrap();

        let rows = store.expand(ws, &[id, Uuid::new_v4()]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
    }
}
