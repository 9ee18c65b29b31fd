//! Keeps materialized membership current: incrementally per customer on
//! each change, and via whole-workspace recomputation when a segment is
//! created or its criteria change.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tracing::{debug, error, info};
use uuid::Uuid;

use cohort_core::config::{QueueConfig, SegmentConfig};
use cohort_core::types::{Customer, Segment, SegmentType, TrackedEvent};
use cohort_core::{CohortError, CohortResult};
use cohort_profiles::CustomerStore;
use cohort_query::{BulkEvaluator, EventStore, QueryEvaluator, QueryNode};

use crate::queue::{wait_for_capacity, wait_until_drained, CustomerChangeJob, JobQueue};
use crate::store::MembershipStore;

/// CRUD over segment definitions, workspace-scoped.
#[derive(Default)]
pub struct SegmentDirectory {
    segments: DashMap<Uuid, Segment>,
}

impl SegmentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, segment: Segment) -> Segment {
        self.segments.insert(segment.id, segment.clone());
        segment
    }

    pub fn get(&self, workspace_id: Uuid, segment_id: Uuid) -> Option<Segment> {
        self.segments
            .get(&segment_id)
            .filter(|s| s.workspace_id == workspace_id)
            .map(|s| s.value().clone())
    }

    pub fn list(&self, workspace_id: Uuid) -> Vec<Segment> {
        self.segments
            .iter()
            .filter(|s| s.workspace_id == workspace_id)
            .map(|s| s.value().clone())
            .collect()
    }

    /// Swap in new criteria. Rejected while a recompute is running; the
    /// segment re-enters the updating state until the next recompute
    /// clears it.
    pub fn update_criteria(
        &self,
        workspace_id: Uuid,
        segment_id: Uuid,
        criteria: serde_json::Value,
    ) -> CohortResult<Segment> {
        let mut entry = self
            .segments
            .get_mut(&segment_id)
            .filter(|s| s.workspace_id == workspace_id)
            .ok_or_else(|| CohortError::not_found(format!("segment {segment_id}")))?;
        if entry.is_updating {
            return Err(CohortError::conflict(format!(
                "segment {segment_id} is still updating"
            )));
        }
        entry.inclusion_criteria = Some(criteria);
        entry.is_updating = true;
        entry.updated_at = chrono::Utc::now();
        Ok(entry.clone())
    }

    fn set_updating(&self, workspace_id: Uuid, segment_id: Uuid, updating: bool) {
        if let Some(mut entry) = self
            .segments
            .get_mut(&segment_id)
            .filter(|s| s.workspace_id == workspace_id)
        {
            entry.is_updating = updating;
            entry.updated_at = chrono::Utc::now();
        }
    }
}

/// The segments a customer entered and exited during one reconciliation,
/// handed to the journey subsystem so it can react to enrollment changes.
#[derive(Debug, Clone, Default)]
pub struct MembershipDelta {
    pub entered: Vec<Uuid>,
    pub exited: Vec<Uuid>,
}

pub struct MembershipMaintainer {
    directory: Arc<SegmentDirectory>,
    memberships: Arc<MembershipStore>,
    customers: Arc<CustomerStore>,
    evaluator: Arc<QueryEvaluator>,
    bulk: Arc<BulkEvaluator>,
    events: Arc<dyn EventStore>,
    queue: Arc<dyn JobQueue>,
    queue_config: QueueConfig,
    segment_config: SegmentConfig,
    /// Segments with a recompute in flight on this node.
    in_flight: DashSet<Uuid>,
}

impl MembershipMaintainer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<SegmentDirectory>,
        memberships: Arc<MembershipStore>,
        customers: Arc<CustomerStore>,
        evaluator: Arc<QueryEvaluator>,
        bulk: Arc<BulkEvaluator>,
        events: Arc<dyn EventStore>,
        queue: Arc<dyn JobQueue>,
        queue_config: QueueConfig,
        segment_config: SegmentConfig,
    ) -> Self {
        Self {
            directory,
            memberships,
            customers,
            evaluator,
            bulk,
            events,
            queue,
            queue_config,
            segment_config,
            in_flight: DashSet::new(),
        }
    }

    // ── per-customer path ──

    /// Re-evaluate every ready automatic segment for one customer and
    /// apply the membership differences.
    pub fn reconcile_customer(
        &self,
        customer: &Customer,
        triggering_event: Option<&str>,
    ) -> CohortResult<MembershipDelta> {
        let workspace_id = customer.workspace_id;
        let mut delta = MembershipDelta::default();

        for segment in self.directory.list(workspace_id) {
            if segment.segment_type != SegmentType::Automatic || segment.is_updating {
                continue;
            }
            let Some(criteria) = &segment.inclusion_criteria else {
                continue;
            };
            let node = QueryNode::from_criteria(criteria)?;

            // Event-triggered changes only touch segments whose criteria
            // reference that event.
            if let Some(event_name) = triggering_event {
                let referenced = node.event_names();
                if !referenced.is_empty() && !referenced.contains(event_name) {
                    continue;
                }
            }

            let matched = self.evaluator.matches(customer, &node)?;
            let member =
                self.memberships
                    .is_customer_in_segment(workspace_id, segment.id, customer.id);
            if matched && !member {
                self.memberships
                    .add_customer_to_segment(workspace_id, segment.id, customer.id)?;
                delta.entered.push(segment.id);
            } else if !matched && member {
                self.memberships
                    .remove_customer_from_segment(workspace_id, segment.id, customer.id);
                delta.exited.push(segment.id);
            }
        }

        metrics::counter!("segments.customers_reconciled").increment(1);
        if !delta.entered.is_empty() || !delta.exited.is_empty() {
            debug!(
                customer_id = %customer.id,
                entered = delta.entered.len(),
                exited = delta.exited.len(),
                "membership delta applied"
            );
        }
        Ok(delta)
    }

    /// Ingestion entry point: records the event, then enqueues the
    /// customer-change job once the queue has capacity.
    pub async fn ingest_event(&self, event: TrackedEvent) -> CohortResult<()> {
        wait_for_capacity(
            self.queue.as_ref(),
            self.queue_config.backpressure_threshold,
            Duration::from_millis(self.queue_config.backpressure_poll_ms),
        )
        .await;

        let job = CustomerChangeJob {
            workspace_id: event.workspace_id,
            customer_id: event.customer_id,
            event_name: Some(event.name.clone()),
        };
        self.events.record(event);
        self.queue.add(job)
    }

    /// Enqueue reconciliation after an attribute mutation.
    pub async fn ingest_attribute_change(
        &self,
        workspace_id: Uuid,
        customer_id: Uuid,
    ) -> CohortResult<()> {
        wait_for_capacity(
            self.queue.as_ref(),
            self.queue_config.backpressure_threshold,
            Duration::from_millis(self.queue_config.backpressure_poll_ms),
        )
        .await;
        self.queue.add(CustomerChangeJob {
            workspace_id,
            customer_id,
            event_name: None,
        })
    }

    /// Worker entry point: take one job off the queue and reconcile.
    /// Returns `None` while the queue is paused or empty.
    pub fn process_next(&self) -> CohortResult<Option<MembershipDelta>> {
        let Some(job) = self.queue.take_next() else {
            return Ok(None);
        };
        let result = self
            .customers
            .get_customer(job.workspace_id, &job.customer_id)
            .ok_or_else(|| CohortError::not_found(format!("customer {}", job.customer_id)))
            .and_then(|customer| {
                self.reconcile_customer(&customer, job.event_name.as_deref())
            });
        self.queue.finish();
        result.map(Some)
    }

    // ── full-recompute path ──

    /// Create an automatic segment and run its initial full recompute.
    pub async fn create_automatic_segment(
        &self,
        workspace_id: Uuid,
        name: &str,
        criteria: serde_json::Value,
    ) -> CohortResult<Segment> {
        QueryNode::from_criteria(&criteria)?;
        let segment = self
            .directory
            .create(Segment::automatic(workspace_id, name, criteria));
        self.recompute_segment(workspace_id, segment.id).await?;
        self.directory
            .get(workspace_id, segment.id)
            .ok_or_else(|| CohortError::not_found(format!("segment {}", segment.id)))
    }

    /// Replace a segment's criteria and recompute membership from scratch.
    pub async fn update_segment_criteria(
        &self,
        workspace_id: Uuid,
        segment_id: Uuid,
        criteria: serde_json::Value,
    ) -> CohortResult<Segment> {
        QueryNode::from_criteria(&criteria)?;
        if self.in_flight.contains(&segment_id) {
            return Err(CohortError::conflict(format!(
                "segment {segment_id} is still updating"
            )));
        }
        self.directory
            .update_criteria(workspace_id, segment_id, criteria)?;
        self.recompute_segment(workspace_id, segment_id).await?;
        self.directory
            .get(workspace_id, segment_id)
            .ok_or_else(|| CohortError::not_found(format!("segment {segment_id}")))
    }

    /// Full recompute: pause the customer-change queue, drain active
    /// jobs, materialize the criteria across the workspace, and replace
    /// membership rows in batches. The updating flag is cleared and the
    /// queue resumed on every exit path.
    pub async fn recompute_segment(
        &self,
        workspace_id: Uuid,
        segment_id: Uuid,
    ) -> CohortResult<usize> {
        let segment = self
            .directory
            .get(workspace_id, segment_id)
            .ok_or_else(|| CohortError::not_found(format!("segment {segment_id}")))?;

        if !self.in_flight.insert(segment_id) {
            return Err(CohortError::conflict(format!(
                "segment {segment_id} is still updating"
            )));
        }
        self.directory.set_updating(workspace_id, segment_id, true);
        self.queue.pause();

        let correlation_id = Uuid::new_v4();
        let result = self.run_recompute(workspace_id, &segment).await;

        // Guaranteed cleanup: flag cleared and queue resumed before any
        // error surfaces to the job runner.
        self.directory.set_updating(workspace_id, segment_id, false);
        self.queue.resume();
        self.in_flight.remove(&segment_id);

        match result {
            Ok(size) => {
                info!(
                    segment_id = %segment_id,
                    workspace_id = %workspace_id,
                    size,
                    "segment recompute complete"
                );
                metrics::counter!("segments.recomputes").increment(1);
                Ok(size)
            }
            Err(e) => {
                error!(
                    segment_id = %segment_id,
                    correlation_id = %correlation_id,
                    error = %e,
                    "segment recompute failed"
                );
                metrics::counter!("segments.recompute_failures").increment(1);
                Err(e)
            }
        }
    }

    async fn run_recompute(&self, workspace_id: Uuid, segment: &Segment) -> CohortResult<usize> {
        wait_until_drained(
            self.queue.as_ref(),
            Duration::from_millis(self.queue_config.drain_backoff_ms),
        )
        .await;

        let criteria = segment.inclusion_criteria.as_ref().ok_or_else(|| {
            CohortError::validation(format!("segment {} has no criteria", segment.id))
        })?;
        let node = QueryNode::from_criteria(criteria)?;
        let prefix = format!("seg_{}", segment.id.simple());
        let rows = self.bulk.materialize(workspace_id, &node, &prefix)?;
        let matched: Vec<Uuid> = rows.into_iter().map(|c| c.id).collect();

        // Diff against current membership so surviving members keep
        // their entry timestamps.
        let current = self.memberships.members(workspace_id, segment.id);
        let stale: Vec<Uuid> = current
            .iter()
            .copied()
            .filter(|id| !matched.contains(id))
            .collect();
        self.memberships.bulk_remove(workspace_id, segment.id, &stale);
        for chunk in matched.chunks(self.segment_config.recompute_batch_size.max(1)) {
            self.memberships.bulk_add(workspace_id, segment.id, chunk);
        }
        Ok(matched.len())
    }

    // ── reads and journey-subsystem entry points ──

    /// Journey branch evaluation: run criteria directly against a customer.
    pub fn check_inclusion(
        &self,
        customer: &Customer,
        criteria: &serde_json::Value,
    ) -> CohortResult<bool> {
        self.evaluator.check_inclusion(customer, criteria)
    }

    pub fn is_customer_in_segment(
        &self,
        workspace_id: Uuid,
        segment_id: Uuid,
        customer_id: Uuid,
    ) -> bool {
        self.memberships
            .is_customer_in_segment(workspace_id, segment_id, customer_id)
    }

    pub fn segment_size(&self, workspace_id: Uuid, segment_id: Uuid) -> usize {
        self.memberships.get_segment_size(workspace_id, segment_id)
    }

    pub fn segment_members(&self, workspace_id: Uuid, segment_id: Uuid) -> Vec<Customer> {
        let ids = self.memberships.members(workspace_id, segment_id);
        self.customers.expand(workspace_id, &ids)
    }

    /// Manual-segment entry points (CSV imports, API assignment).
    pub fn add_members(
        &self,
        workspace_id: Uuid,
        segment_id: Uuid,
        customer_ids: &[Uuid],
    ) -> CohortResult<usize> {
        let segment = self
            .directory
            .get(workspace_id, segment_id)
            .ok_or_else(|| CohortError::not_found(format!("segment {segment_id}")))?;
        if segment.segment_type == SegmentType::Automatic {
            return Err(CohortError::validation(format!(
                "segment {segment_id} derives membership from its criteria"
            )));
        }
        Ok(self.memberships.bulk_add(workspace_id, segment_id, customer_ids))
    }

    pub fn remove_members(
        &self,
        workspace_id: Uuid,
        segment_id: Uuid,
        customer_ids: &[Uuid],
    ) -> usize {
        self.memberships
            .bulk_remove(workspace_id, segment_id, customer_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_directory_is_workspace_scoped() {
        let directory = SegmentDirectory::new();
        let ws_a = Uuid::new_v4();
        let segment = directory.create(Segment::manual(ws_a, "imported"));

        assert!(directory.get(ws_a, segment.id).is_some());
        assert!(directory.get(Uuid::new_v4(), segment.id).is_none());
        assert_eq!(directory.list(ws_a).len(), 1);
    }

    #[test]
    fn test_update_criteria_rejected_while_updating() {
        let directory = SegmentDirectory::new();
        let ws = Uuid::new_v4();
        // automatic segments start in the updating state
        let segment = directory.create(Segment::automatic(ws, "vips", json!({})));

        let err = directory
            .update_criteria(ws, segment.id, json!({"type": "composition"}))
            .unwrap_err();
        assert!(matches!(err, CohortError::Conflict(_)));

        directory.set_updating(ws, segment.id, false);
        let updated = directory
            .update_criteria(ws, segment.id, json!({"changed": true}))
            .unwrap();
        assert!(updated.is_updating);
        assert_eq!(updated.inclusion_criteria, Some(json!({"changed": true})));
    }

    #[test]
    fn test_update_criteria_unknown_segment_is_not_found() {
        let directory = SegmentDirectory::new();
        let err = directory
            .update_criteria(Uuid::new_v4(), Uuid::new_v4(), json!({}))
            .unwrap_err();
        assert!(matches!(err, CohortError::NotFound(_)));
    }
}
