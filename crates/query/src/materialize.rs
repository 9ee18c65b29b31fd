//! Mode (b): whole-workspace set-based evaluation, used for segment
//! backfills where per-customer evaluation would not scale.
//!
//! Every leaf lands its matching customer ids in a freshly named
//! intermediate collection; compositions combine collections with set
//! algebra; a drop guard deletes every collection the walk created, error
//! or not.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use cohort_core::types::Customer;
use cohort_core::CohortResult;
use cohort_profiles::CustomerStore;

use crate::ast::{CompositionOp, EventComparison, MessageComparison, QueryNode};
use crate::evaluator::QueryEvaluator;
use crate::stores::{DeliveryFilter, EventFilter};

/// Namespace of intermediate collections. Names are `prefix_counter`, so
/// concurrent recomputations never collide.
#[derive(Default)]
pub struct ScratchSpace {
    collections: DashMap<String, Vec<Uuid>>,
    counter: AtomicU64,
}

impl ScratchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn create(&self, prefix: &str, ids: Vec<Uuid>) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{prefix}_{n}");
        self.collections.insert(name.clone(), ids);
        name
    }

    fn get(&self, name: &str) -> Vec<Uuid> {
        self.collections
            .get(name)
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
    }

    fn remove(&self, name: &str) {
        self.collections.remove(name);
    }

    /// Live intermediate collections; zero between recomputes.
    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }
}

/// Tracks the collections one walk created and deletes them on drop, so
/// cleanup also runs when a later statement in the walk fails.
struct ScratchGuard<'a> {
    space: &'a ScratchSpace,
    names: Vec<String>,
}

impl<'a> ScratchGuard<'a> {
    fn new(space: &'a ScratchSpace) -> Self {
        Self {
            space,
            names: Vec::new(),
        }
    }

    fn create(&mut self, prefix: &str, ids: Vec<Uuid>) -> String {
        let name = self.space.create(prefix, ids);
        self.names.push(name.clone());
        name
    }
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        for name in &self.names {
            self.space.remove(name);
        }
    }
}

/// Whole-workspace evaluator sharing the boolean evaluator's grammar and
/// attribute semantics.
pub struct BulkEvaluator {
    store: Arc<CustomerStore>,
    evaluator: Arc<QueryEvaluator>,
    scratch: ScratchSpace,
}

impl BulkEvaluator {
    pub fn new(store: Arc<CustomerStore>, evaluator: Arc<QueryEvaluator>) -> Self {
        Self {
            store,
            evaluator,
            scratch: ScratchSpace::new(),
        }
    }

    /// Compute the full customer rows matching the query across the
    /// workspace. Intermediate collections are deleted before returning,
    /// on success and on error alike.
    pub fn materialize(
        &self,
        workspace_id: Uuid,
        node: &QueryNode,
        prefix: &str,
    ) -> CohortResult<Vec<Customer>> {
        let started = std::time::Instant::now();
        let mut guard = ScratchGuard::new(&self.scratch);
        let result = self.walk(workspace_id, node, prefix, &mut guard);
        let final_name = result?;
        let ids = self.scratch.get(&final_name);
        // One join expands the final id set to full rows.
        let rows = self.store.expand(workspace_id, &ids);
        metrics::histogram!("query.materialize_ms").record(started.elapsed().as_millis() as f64);
        debug!(
            workspace_id = %workspace_id,
            matched = rows.len(),
            collections = guard.names.len(),
            "bulk materialization complete"
        );
        Ok(rows)
    }

    pub fn scratch_collection_count(&self) -> usize {
        self.scratch.collection_count()
    }

    fn walk(
        &self,
        workspace_id: Uuid,
        node: &QueryNode,
        prefix: &str,
        guard: &mut ScratchGuard<'_>,
    ) -> CohortResult<String> {
        match node {
            QueryNode::Composition { op, children } => {
                let mut child_names = Vec::with_capacity(children.len());
                for child in children {
                    child_names.push(self.walk(workspace_id, child, prefix, guard)?);
                }
                let ids = match op {
                    CompositionOp::All => {
                        if children.is_empty() {
                            // Empty ALL matches nobody.
                            Vec::new()
                        } else {
                            // Union all child sets, keep ids occurring in
                            // every one of them.
                            let mut occurrences: HashMap<Uuid, usize> = HashMap::new();
                            for name in &child_names {
                                for id in self.scratch.get(name) {
                                    *occurrences.entry(id).or_insert(0) += 1;
                                }
                            }
                            occurrences
                                .into_iter()
                                .filter(|(_, n)| *n == children.len())
                                .map(|(id, _)| id)
                                .collect()
                        }
                    }
                    CompositionOp::Any => {
                        if children.is_empty() {
                            // Empty ANY matches the whole workspace.
                            self.all_customer_ids(workspace_id)
                        } else {
                            let mut seen = Vec::new();
                            for name in &child_names {
                                for id in self.scratch.get(name) {
                                    if !seen.contains(&id) {
                                        seen.push(id);
                                    }
                                }
                            }
                            seen
                        }
                    }
                };
                Ok(guard.create(prefix, ids))
            }
            QueryNode::Attribute { .. } => {
                // Attribute leaves reuse the boolean comparison kernel so
                // the two strategies cannot drift apart.
                let mut ids = Vec::new();
                for customer in self.store.list_customers(workspace_id) {
                    if self.evaluator.matches(&customer, node)? {
                        ids.push(customer.id);
                    }
                }
                Ok(guard.create(prefix, ids))
            }
            QueryNode::Event {
                event_name,
                comparison,
                count,
                time_window,
                property_filters,
            } => {
                let filter = EventFilter {
                    event_name: event_name.clone(),
                    time_window: time_window.clone(),
                    property_filters: property_filters.clone(),
                };
                let events = &self.evaluator.sources().events;
                let ids = match comparison {
                    EventComparison::HasPerformed => {
                        events.customers_matching(workspace_id, &filter, (*count).max(1))
                    }
                    EventComparison::HasNotPerformed => {
                        let performed = events.customers_matching(workspace_id, &filter, 1);
                        self.all_customer_ids(workspace_id)
                            .into_iter()
                            .filter(|id| !performed.contains(id))
                            .collect()
                    }
                };
                Ok(guard.create(prefix, ids))
            }
            QueryNode::Message {
                channel,
                journey,
                step_id,
                state,
                comparison,
                time_window,
            } => {
                let step_ids = match step_id {
                    Some(step) => Some(vec![*step]),
                    None => self
                        .evaluator
                        .sources()
                        .journeys
                        .resolve_steps(workspace_id, journey),
                };
                let filter = DeliveryFilter {
                    step_ids,
                    channel: *channel,
                    state: *state,
                    time_window: time_window.clone(),
                };
                let received = self
                    .evaluator
                    .sources()
                    .deliveries
                    .customers_matching(workspace_id, &filter);
                let ids = match comparison {
                    MessageComparison::HasReceived => received,
                    MessageComparison::HasNotReceived => self
                        .all_customer_ids(workspace_id)
                        .into_iter()
                        .filter(|id| !received.contains(id))
                        .collect(),
                };
                Ok(guard.create(prefix, ids))
            }
            QueryNode::Segment { segment_id } => {
                let ids = self
                    .evaluator
                    .sources()
                    .memberships
                    .members_of(workspace_id, *segment_id);
                Ok(guard.create(prefix, ids))
            }
        }
    }

    fn all_customer_ids(&self, workspace_id: Uuid) -> Vec<Uuid> {
        self.store
            .list_customers(workspace_id)
            .into_iter()
            .map(|c| c.id)
            .collect()
    }
}
