//! Membership facts: (workspace, segment, customer) rows with an entry
//! timestamp. All operations are workspace-scoped; identical segment or
//! customer uuids in different workspaces never leak membership.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use cohort_core::{CohortError, CohortResult};
use cohort_query::MembershipReader;

#[derive(Default)]
pub struct MembershipStore {
    rows: DashMap<(Uuid, Uuid, Uuid), DateTime<Utc>>,
}

impl MembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_customer_in_segment(
        &self,
        workspace_id: Uuid,
        segment_id: Uuid,
        customer_id: Uuid,
    ) -> bool {
        self.rows
            .contains_key(&(workspace_id, segment_id, customer_id))
    }

    pub fn add_customer_to_segment(
        &self,
        workspace_id: Uuid,
        segment_id: Uuid,
        customer_id: Uuid,
    ) -> CohortResult<()> {
        let key = (workspace_id, segment_id, customer_id);
        if self.rows.contains_key(&key) {
            return Err(CohortError::conflict(format!(
                "customer {customer_id} already in segment {segment_id}"
            )));
        }
        self.rows.insert(key, Utc::now());
        Ok(())
    }

    pub fn remove_customer_from_segment(
        &self,
        workspace_id: Uuid,
        segment_id: Uuid,
        customer_id: Uuid,
    ) -> bool {
        self.rows
            .remove(&(workspace_id, segment_id, customer_id))
            .is_some()
    }

    pub fn get_segment_size(&self, workspace_id: Uuid, segment_id: Uuid) -> usize {
        self.rows
            .iter()
            .filter(|entry| {
                let (ws, seg, _) = *entry.key();
                ws == workspace_id && seg == segment_id
            })
            .count()
    }

    /// Insert many members at once, skipping rows that already exist so
    /// their entry timestamps survive. Returns how many were added.
    pub fn bulk_add(&self, workspace_id: Uuid, segment_id: Uuid, customer_ids: &[Uuid]) -> usize {
        let now = Utc::now();
        let mut added = 0;
        for &customer_id in customer_ids {
            let key = (workspace_id, segment_id, customer_id);
            if self.rows.contains_key(&key) {
                continue;
            }
            self.rows.insert(key, now);
            added += 1;
        }
        added
    }

    pub fn bulk_remove(&self, workspace_id: Uuid, segment_id: Uuid, customer_ids: &[Uuid]) -> usize {
        customer_ids
            .iter()
            .filter(|&&customer_id| {
                self.rows
                    .remove(&(workspace_id, segment_id, customer_id))
                    .is_some()
            })
            .count()
    }

    pub fn members(&self, workspace_id: Uuid, segment_id: Uuid) -> Vec<Uuid> {
        self.rows
            .iter()
            .filter_map(|entry| {
                let (ws, seg, customer) = *entry.key();
                (ws == workspace_id && seg == segment_id).then_some(customer)
            })
            .collect()
    }
}

impl MembershipReader for MembershipStore {
    fn is_member(&self, workspace_id: Uuid, segment_id: Uuid, customer_id: Uuid) -> bool {
        self.is_customer_in_segment(workspace_id, segment_id, customer_id)
    }

    fn members_of(&self, workspace_id: Uuid, segment_id: Uuid) -> Vec<Uuid> {
        self.members(workspace_id, segment_id)
    }
}
