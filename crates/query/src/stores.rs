//! Seams to the signal sources the evaluators consult: the event store,
//! the message-delivery log, the journey directory, and the membership
//! reader. In-memory implementations back tests and single-node use.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use cohort_core::types::{DeliveryRecord, DeliveryState, MessageChannel, TrackedEvent};

use crate::ast::{lookup_path, CompositionOp, JourneySelector, PropertyFilterGroup, TimeWindow};

/// Row filter for event queries.
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub event_name: String,
    pub time_window: Option<TimeWindow>,
    pub property_filters: Option<PropertyFilterGroup>,
}

/// Row filter for delivery-log queries. `step_ids: None` means any journey.
#[derive(Debug, Clone)]
pub struct DeliveryFilter {
    pub step_ids: Option<Vec<Uuid>>,
    pub channel: MessageChannel,
    pub state: DeliveryState,
    pub time_window: Option<TimeWindow>,
}

pub trait EventStore: Send + Sync {
    fn record(&self, event: TrackedEvent);
    /// Count of a customer's events matching the filter.
    fn count_events(&self, workspace_id: Uuid, customer_id: Uuid, filter: &EventFilter) -> u64;
    /// Customers with at least `min_count` matching events (bulk mode).
    fn customers_matching(
        &self,
        workspace_id: Uuid,
        filter: &EventFilter,
        min_count: u64,
    ) -> Vec<Uuid>;
}

pub trait DeliveryLog: Send + Sync {
    fn record(&self, delivery: DeliveryRecord);
    fn count_deliveries(
        &self,
        workspace_id: Uuid,
        customer_id: Uuid,
        filter: &DeliveryFilter,
    ) -> u64;
    fn customers_matching(&self, workspace_id: Uuid, filter: &DeliveryFilter) -> Vec<Uuid>;
}

/// Resolves a journey selector to the step ids whose deliveries count.
/// `None` means no step restriction (any journey).
pub trait JourneyDirectory: Send + Sync {
    fn resolve_steps(&self, workspace_id: Uuid, selector: &JourneySelector) -> Option<Vec<Uuid>>;
}

/// Membership lookups consumed by the segment leaf and by bulk evaluation.
pub trait MembershipReader: Send + Sync {
    fn is_member(&self, workspace_id: Uuid, segment_id: Uuid, customer_id: Uuid) -> bool;
    fn members_of(&self, workspace_id: Uuid, segment_id: Uuid) -> Vec<Uuid>;
}

/// The full set of signal seams an evaluator needs.
#[derive(Clone)]
pub struct SignalSources {
    pub events: Arc<dyn EventStore>,
    pub deliveries: Arc<dyn DeliveryLog>,
    pub journeys: Arc<dyn JourneyDirectory>,
    pub memberships: Arc<dyn MembershipReader>,
}

fn matches_properties(properties: &serde_json::Value, group: &PropertyFilterGroup) -> bool {
    let check = |filter: &crate::ast::PropertyFilter| {
        lookup_path(properties, &filter.key) == Some(&filter.value)
    };
    match group.op {
        CompositionOp::All => group.filters.iter().all(check),
        CompositionOp::Any => group.filters.iter().any(check),
    }
}

fn event_matches(event: &TrackedEvent, filter: &EventFilter, now: chrono::DateTime<Utc>) -> bool {
    if event.name != filter.event_name {
        return false;
    }
    if let Some(window) = &filter.time_window {
        if !window.contains(event.timestamp, now) {
            return false;
        }
    }
    if let Some(group) = &filter.property_filters {
        if !matches_properties(&event.properties, group) {
            return false;
        }
    }
    true
}

fn delivery_matches(
    delivery: &DeliveryRecord,
    filter: &DeliveryFilter,
    now: chrono::DateTime<Utc>,
) -> bool {
    if delivery.channel != filter.channel || delivery.state != filter.state {
        return false;
    }
    if let Some(steps) = &filter.step_ids {
        if !steps.contains(&delivery.step_id) {
            return false;
        }
    }
    if let Some(window) = &filter.time_window {
        if !window.contains(delivery.timestamp, now) {
            return false;
        }
    }
    true
}

/// Event store backed by per-workspace vectors.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: DashMap<Uuid, Vec<TrackedEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn record(&self, event: TrackedEvent) {
        self.events
            .entry(event.workspace_id)
            .or_default()
            .push(event);
    }

    fn count_events(&self, workspace_id: Uuid, customer_id: Uuid, filter: &EventFilter) -> u64 {
        let now = Utc::now();
        self.events
            .get(&workspace_id)
            .map(|rows| {
                rows.iter()
                    .filter(|e| e.customer_id == customer_id && event_matches(e, filter, now))
                    .count() as u64
            })
            .unwrap_or(0)
    }

    fn customers_matching(
        &self,
        workspace_id: Uuid,
        filter: &EventFilter,
        min_count: u64,
    ) -> Vec<Uuid> {
        let now = Utc::now();
        let mut counts: HashMap<Uuid, u64> = HashMap::new();
        if let Some(rows) = self.events.get(&workspace_id) {
            for event in rows.iter().filter(|e| event_matches(e, filter, now)) {
                *counts.entry(event.customer_id).or_insert(0) += 1;
            }
        }
        counts
            .into_iter()
            .filter(|(_, count)| *count >= min_count)
            .map(|(id, _)| id)
            .collect()
    }
}

/// Delivery log backed by per-workspace vectors.
#[derive(Default)]
pub struct InMemoryDeliveryLog {
    deliveries: DashMap<Uuid, Vec<DeliveryRecord>>,
}

impl InMemoryDeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeliveryLog for InMemoryDeliveryLog {
    fn record(&self, delivery: DeliveryRecord) {
        self.deliveries
            .entry(delivery.workspace_id)
            .or_default()
            .push(delivery);
    }

    fn count_deliveries(
        &self,
        workspace_id: Uuid,
        customer_id: Uuid,
        filter: &DeliveryFilter,
    ) -> u64 {
        let now = Utc::now();
        self.deliveries
            .get(&workspace_id)
            .map(|rows| {
                rows.iter()
                    .filter(|d| d.customer_id == customer_id && delivery_matches(d, filter, now))
                    .count() as u64
            })
            .unwrap_or(0)
    }

    fn customers_matching(&self, workspace_id: Uuid, filter: &DeliveryFilter) -> Vec<Uuid> {
        let now = Utc::now();
        let mut seen: Vec<Uuid> = Vec::new();
        if let Some(rows) = self.deliveries.get(&workspace_id) {
            for delivery in rows.iter().filter(|d| delivery_matches(d, filter, now)) {
                if !seen.contains(&delivery.customer_id) {
                    seen.push(delivery.customer_id);
                }
            }
        }
        seen
    }
}

/// One journey known to the directory: its tags and its step ids.
#[derive(Debug, Clone)]
pub struct JourneyEntry {
    pub journey_id: Uuid,
    pub tags: Vec<String>,
    pub step_ids: Vec<Uuid>,
}

/// Directory of journeys registered per workspace.
#[derive(Default)]
pub struct StaticJourneyDirectory {
    journeys: DashMap<Uuid, Vec<JourneyEntry>>,
}

impl StaticJourneyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, workspace_id: Uuid, entry: JourneyEntry) {
        self.journeys.entry(workspace_id).or_default().push(entry);
    }
}

impl JourneyDirectory for StaticJourneyDirectory {
    fn resolve_steps(&self, workspace_id: Uuid, selector: &JourneySelector) -> Option<Vec<Uuid>> {
        match selector {
            JourneySelector::AnyJourney => None,
            JourneySelector::JourneysWithTag { tag } => {
                let steps = self
                    .journeys
                    .get(&workspace_id)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter(|e| e.tags.iter().any(|t| t == tag))
                            .flat_map(|e| e.step_ids.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                Some(steps)
            }
            JourneySelector::Journey { journey_id } => {
                let steps = self
                    .journeys
                    .get(&workspace_id)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter(|e| e.journey_id == *journey_id)
                            .flat_map(|e| e.step_ids.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                Some(steps)
            }
        }
    }
}
