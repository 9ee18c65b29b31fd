//! Mode (a): single-customer boolean evaluation of a query tree.

use std::sync::Arc;

use tracing::trace;
use uuid::Uuid;

use cohort_core::types::{AttributeType, Customer};
use cohort_core::{CohortError, CohortResult};
use cohort_profiles::SchemaRegistry;

use crate::ast::{
    AttributeComparison, CompositionOp, EventComparison, MessageComparison, QueryNode, lookup_path,
};
use crate::coerce::{coerce_comparand, coerce_stored, CoercedValue};
use crate::stores::{DeliveryFilter, EventFilter, SignalSources};

/// Evaluates a query tree against one customer. Low-latency path used on
/// event ingestion and attribute changes.
pub struct QueryEvaluator {
    schema: Arc<SchemaRegistry>,
    sources: SignalSources,
}

impl QueryEvaluator {
    pub fn new(schema: Arc<SchemaRegistry>, sources: SignalSources) -> Self {
        Self { schema, sources }
    }

    /// True iff the customer satisfies the query tree.
    pub fn matches(&self, customer: &Customer, node: &QueryNode) -> CohortResult<bool> {
        match node {
            QueryNode::Composition { op, children } => match op {
                // An empty ALL is false and an empty ANY is true; the
                // asymmetry is part of the contract.
                CompositionOp::All => {
                    if children.is_empty() {
                        return Ok(false);
                    }
                    for child in children {
                        if !self.matches(customer, child)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                CompositionOp::Any => {
                    if children.is_empty() {
                        return Ok(true);
                    }
                    for child in children {
                        if self.matches(customer, child)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            },
            QueryNode::Attribute {
                key,
                comparison,
                value,
                nested_key,
            } => self.eval_attribute(customer, key, *comparison, value.as_ref(), nested_key.as_deref()),
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
                let observed = self.sources.events.count_events(
                    customer.workspace_id,
                    customer.id,
                    &filter,
                );
                trace!(event = %event_name, observed, "event leaf evaluated");
                Ok(match comparison {
                    EventComparison::HasPerformed => observed >= (*count).max(1),
                    EventComparison::HasNotPerformed => observed < 1,
                })
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
                        .sources
                        .journeys
                        .resolve_steps(customer.workspace_id, journey),
                };
                let filter = DeliveryFilter {
                    step_ids,
                    channel: *channel,
                    state: *state,
                    time_window: time_window.clone(),
                };
                let observed = self.sources.deliveries.count_deliveries(
                    customer.workspace_id,
                    customer.id,
                    &filter,
                );
                Ok(match comparison {
                    MessageComparison::HasReceived => observed > 0,
                    MessageComparison::HasNotReceived => observed == 0,
                })
            }
            QueryNode::Segment { segment_id } => Ok(self.sources.memberships.is_member(
                customer.workspace_id,
                *segment_id,
                customer.id,
            )),
        }
    }

    fn eval_attribute(
        &self,
        customer: &Customer,
        key: &str,
        comparison: AttributeComparison,
        value: Option<&serde_json::Value>,
        nested_key: Option<&str>,
    ) -> CohortResult<bool> {
        let stored = customer.user_attributes.get(key);

        // Presence checks need no coercion.
        match comparison {
            AttributeComparison::Exists => {
                return Ok(stored.map(|v| !v.is_null()).unwrap_or(false))
            }
            AttributeComparison::NotExists => {
                return Ok(stored.map(|v| v.is_null()).unwrap_or(true))
            }
            _ => {}
        }

        let comparand = value.ok_or_else(|| {
            CohortError::validation(format!("comparison {comparison:?} on '{key}' needs a value"))
        })?;
        let declared = self
            .schema
            .get_key_by_name(customer.workspace_id, key)
            .map(|k| k.attribute_type)
            .unwrap_or(AttributeType::String);

        let stored = match stored {
            Some(v) if !v.is_null() => v,
            // Absent value never matches a value comparison.
            _ => return Ok(false),
        };

        match comparison {
            AttributeComparison::Eq | AttributeComparison::NotEq => {
                let expected = coerce_comparand(declared, comparand)?;
                let actual = match coerce_stored(declared, stored) {
                    Some(v) => v,
                    None => return Ok(false),
                };
                Ok((actual == expected) == (comparison == AttributeComparison::Eq))
            }
            AttributeComparison::Contains | AttributeComparison::NotContains => {
                let contains = match coerce_stored(declared, stored) {
                    Some(CoercedValue::Text(actual)) => {
                        let needle = comparand.as_str().ok_or_else(|| {
                            CohortError::validation(format!(
                                "contains on '{key}' needs a string value"
                            ))
                        })?;
                        actual.contains(needle)
                    }
                    Some(CoercedValue::List(items)) => items.contains(comparand),
                    _ => return Ok(false),
                };
                Ok(contains == (comparison == AttributeComparison::Contains))
            }
            AttributeComparison::GreaterThan | AttributeComparison::LessThan => {
                let expected = crate::coerce::number(comparand).ok_or_else(|| {
                    CohortError::validation(format!(
                        "comparison value {comparand} is not a valid Number"
                    ))
                })?;
                let actual = match crate::coerce::number(stored) {
                    Some(n) => n,
                    None => return Ok(false),
                };
                Ok(if comparison == AttributeComparison::GreaterThan {
                    actual > expected
                } else {
                    actual < expected
                })
            }
            AttributeComparison::After | AttributeComparison::Before => {
                let bound = crate::coerce::timestamp(comparand).ok_or_else(|| {
                    CohortError::validation(format!("'{comparand}' is not a valid date bound"))
                })?;
                let actual = match crate::coerce::timestamp(stored) {
                    Some(ts) => ts,
                    None => return Ok(false),
                };
                Ok(if comparison == AttributeComparison::After {
                    actual > bound
                } else {
                    actual < bound
                })
            }
            AttributeComparison::During => {
                let bound = crate::coerce::timestamp(comparand).ok_or_else(|| {
                    CohortError::validation(format!("'{comparand}' is not a valid date bound"))
                })?;
                let actual = match crate::coerce::timestamp(stored) {
                    Some(ts) => ts,
                    None => return Ok(false),
                };
                Ok(actual.date_naive() == bound.date_naive())
            }
            AttributeComparison::LengthEq
            | AttributeComparison::LengthGreaterThan
            | AttributeComparison::LengthLessThan => {
                let expected = crate::coerce::number(comparand).ok_or_else(|| {
                    CohortError::validation(format!(
                        "length comparison on '{key}' needs a numeric value"
                    ))
                })? as usize;
                let actual = match stored {
                    serde_json::Value::String(s) => s.chars().count(),
                    serde_json::Value::Array(a) => a.len(),
                    _ => return Ok(false),
                };
                Ok(match comparison {
                    AttributeComparison::LengthEq => actual == expected,
                    AttributeComparison::LengthGreaterThan => actual > expected,
                    _ => actual < expected,
                })
            }
            AttributeComparison::NestedEq => {
                let path = nested_key.ok_or_else(|| {
                    CohortError::validation(format!("nested comparison on '{key}' needs a path"))
                })?;
                Ok(lookup_path(stored, path) == Some(comparand))
            }
            AttributeComparison::Exists | AttributeComparison::NotExists => {
                unreachable!("presence checks handled above")
            }
        }
    }

    /// Journey-subsystem entry point: evaluate stored criteria directly.
    pub fn check_inclusion(
        &self,
        customer: &Customer,
        criteria: &serde_json::Value,
    ) -> CohortResult<bool> {
        let node = QueryNode::from_criteria(criteria)?;
        metrics::counter!("query.inclusion_checks").increment(1);
        self.matches(customer, &node)
    }

    pub(crate) fn sources(&self) -> &SignalSources {
        &self.sources
    }

    /// Convenience for callers holding only ids.
    pub fn is_member(&self, workspace_id: Uuid, segment_id: Uuid, customer_id: Uuid) -> bool {
        self.sources
            .memberships
            .is_member(workspace_id, segment_id, customer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{JourneySelector, PropertyFilter, PropertyFilterGroup, TimeWindow};
    use crate::stores::{
        DeliveryLog, EventStore, InMemoryDeliveryLog, InMemoryEventStore, JourneyEntry,
        MembershipReader, StaticJourneyDirectory,
    };
    use cohort_core::types::{
        Customer, DeliveryRecord, DeliveryState, MessageChannel, TrackedEvent,
    };
    use cohort_profiles::{CustomerStore, NewKey};
    use serde_json::json;

    struct FixedMembership(Vec<(Uuid, Uuid)>);

    impl MembershipReader for FixedMembership {
        fn is_member(&self, _ws: Uuid, segment_id: Uuid, customer_id: Uuid) -> bool {
            self.0.contains(&(segment_id, customer_id))
        }
        fn members_of(&self, _ws: Uuid, segment_id: Uuid) -> Vec<Uuid> {
            self.0
                .iter()
                .filter(|(s, _)| *s == segment_id)
                .map(|(_, c)| *c)
                .collect()
        }
    }

    struct Fixture {
        evaluator: QueryEvaluator,
        events: Arc<InMemoryEventStore>,
        deliveries: Arc<InMemoryDeliveryLog>,
        journeys: Arc<StaticJourneyDirectory>,
        ws: Uuid,
        customer: Customer,
    }

    fn fixture(memberships: Vec<(Uuid, Uuid)>) -> Fixture {
        let store = Arc::new(CustomerStore::new());
        let schema = Arc::new(SchemaRegistry::new(store.clone(), 1));
        let ws = Uuid::new_v4();
        for (name, ty) in [
            ("plan", AttributeType::String),
            ("age", AttributeType::Number),
            ("signup_date", AttributeType::DateTime),
            ("tags", AttributeType::Array),
            ("address", AttributeType::Object),
        ] {
            schema.create_key(ws, NewKey::new(name, ty), None).unwrap();
        }

        let events = Arc::new(InMemoryEventStore::new());
        let deliveries = Arc::new(InMemoryDeliveryLog::new());
        let journeys = Arc::new(StaticJourneyDirectory::new());
        let sources = SignalSources {
            events: events.clone(),
            deliveries: deliveries.clone(),
            journeys: journeys.clone(),
            memberships: Arc::new(FixedMembership(memberships)),
        };
        let evaluator = QueryEvaluator::new(schema, sources);

        let mut customer = Customer::new(ws);
        customer.user_attributes.insert("plan".into(), json!("pro"));
        customer.user_attributes.insert("age".into(), json!(30));
        customer
            .user_attributes
            .insert("signup_date".into(), json!("2024-03-01T10:00:00Z"));
        customer
            .user_attributes
            .insert("tags".into(), json!(["vip", "beta"]));
        customer
            .user_attributes
            .insert("address".into(), json!({"city": "Oslo", "geo": {"zip": "0150"}}));

        Fixture {
            evaluator,
            events,
            deliveries,
            journeys,
            ws,
            customer,
        }
    }

    fn attr(key: &str, comparison: AttributeComparison, value: serde_json::Value) -> QueryNode {
        QueryNode::Attribute {
            key: key.into(),
            comparison,
            value: Some(value),
            nested_key: None,
        }
    }

    #[test]
    fn test_empty_composition_asymmetry() {
        let f = fixture(vec![]);
        assert!(!f.evaluator.matches(&f.customer, &QueryNode::all(vec![])).unwrap());
        assert!(f.evaluator.matches(&f.customer, &QueryNode::any(vec![])).unwrap());
    }

    #[test]
    fn test_attribute_comparisons() {
        let f = fixture(vec![]);
        let e = &f.evaluator;
        let c = &f.customer;

        assert!(e.matches(c, &attr("plan", AttributeComparison::Eq, json!("pro"))).unwrap());
        assert!(e.matches(c, &attr("plan", AttributeComparison::NotEq, json!("free"))).unwrap());
        assert!(e.matches(c, &attr("plan", AttributeComparison::Contains, json!("pr"))).unwrap());
        assert!(e.matches(c, &attr("tags", AttributeComparison::Contains, json!("vip"))).unwrap());
        assert!(e.matches(c, &attr("age", AttributeComparison::GreaterThan, json!(21))).unwrap());
        assert!(e.matches(c, &attr("age", AttributeComparison::LessThan, json!(65))).unwrap());
        assert!(e
            .matches(c, &attr("signup_date", AttributeComparison::After, json!("2024-01-01")))
            .unwrap());
        assert!(e
            .matches(c, &attr("signup_date", AttributeComparison::During, json!("2024-03-01")))
            .unwrap());
        assert!(e.matches(c, &attr("plan", AttributeComparison::LengthEq, json!(3))).unwrap());
        assert!(e
            .matches(c, &attr("tags", AttributeComparison::LengthGreaterThan, json!(1)))
            .unwrap());

        let exists = QueryNode::Attribute {
            key: "plan".into(),
            comparison: AttributeComparison::Exists,
            value: None,
            nested_key: None,
        };
        assert!(e.matches(c, &exists).unwrap());
        let not_exists = QueryNode::Attribute {
            key: "missing".into(),
            comparison: AttributeComparison::NotExists,
            value: None,
            nested_key: None,
        };
        assert!(e.matches(c, &not_exists).unwrap());
    }

    #[test]
    fn test_nested_key_equality() {
        let f = fixture(vec![]);
        let node = QueryNode::Attribute {
            key: "address".into(),
            comparison: AttributeComparison::NestedEq,
            value: Some(json!("0150")),
            nested_key: Some("geo.zip".into()),
        };
        assert!(f.evaluator.matches(&f.customer, &node).unwrap());
    }

    #[test]
    fn test_stored_coercion_failure_is_no_match() {
        let f = fixture(vec![]);
        let mut customer = f.customer.clone();
        customer.user_attributes.insert("age".into(), json!("not-a-number"));
        let node = attr("age", AttributeComparison::GreaterThan, json!(21));
        assert!(!f.evaluator.matches(&customer, &node).unwrap());
    }

    #[test]
    fn test_malformed_comparand_raises() {
        let f = fixture(vec![]);
        let node = attr("age", AttributeComparison::GreaterThan, json!("not-a-number"));
        let err = f.evaluator.matches(&f.customer, &node).unwrap_err();
        assert!(matches!(err, CohortError::Validation(_)));
    }

    #[test]
    fn test_event_leaf_with_window_and_threshold() {
        let f = fixture(vec![]);
        let node = QueryNode::Event {
            event_name: "login".into(),
            comparison: EventComparison::HasPerformed,
            count: 2,
            time_window: Some(TimeWindow::Relative {
                after_days_ago: Some(7),
                before_days_ago: None,
            }),
            property_filters: None,
        };
        assert!(!f.evaluator.matches(&f.customer, &node).unwrap());

        f.events
            .record(TrackedEvent::new(f.ws, f.customer.id, "login", json!({})));
        assert!(!f.evaluator.matches(&f.customer, &node).unwrap());

        f.events
            .record(TrackedEvent::new(f.ws, f.customer.id, "login", json!({})));
        assert!(f.evaluator.matches(&f.customer, &node).unwrap());

        let never = QueryNode::Event {
            event_name: "churn".into(),
            comparison: EventComparison::HasNotPerformed,
            count: 1,
            time_window: None,
            property_filters: None,
        };
        assert!(f.evaluator.matches(&f.customer, &never).unwrap());
    }

    #[test]
    fn test_event_property_filters() {
        let f = fixture(vec![]);
        f.events.record(TrackedEvent::new(
            f.ws,
            f.customer.id,
            "purchase",
            json!({"total": 120, "item": {"sku": "a-1"}}),
        ));

        let node = QueryNode::Event {
            event_name: "purchase".into(),
            comparison: EventComparison::HasPerformed,
            count: 1,
            time_window: None,
            property_filters: Some(PropertyFilterGroup {
                op: CompositionOp::All,
                filters: vec![PropertyFilter {
                    key: "item.sku".into(),
                    value: json!("a-1"),
                }],
            }),
        };
        assert!(f.evaluator.matches(&f.customer, &node).unwrap());
    }

    #[test]
    fn test_message_leaf_by_journey_tag() {
        let f = fixture(vec![]);
        let journey_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();
        f.journeys.register(
            f.ws,
            JourneyEntry {
                journey_id,
                tags: vec!["onboarding".into()],
                step_ids: vec![step_id],
            },
        );
        f.deliveries.record(DeliveryRecord {
            id: Uuid::new_v4(),
            workspace_id: f.ws,
            customer_id: f.customer.id,
            journey_id,
            step_id,
            channel: MessageChannel::Email,
            state: DeliveryState::Opened,
            timestamp: chrono::Utc::now(),
        });

        let node = QueryNode::Message {
            channel: MessageChannel::Email,
            journey: JourneySelector::JourneysWithTag {
                tag: "onboarding".into(),
            },
            step_id: None,
            state: DeliveryState::Opened,
            comparison: MessageComparison::HasReceived,
            time_window: None,
        };
        assert!(f.evaluator.matches(&f.customer, &node).unwrap());

        let miss = QueryNode::Message {
            channel: MessageChannel::Email,
            journey: JourneySelector::JourneysWithTag {
                tag: "winback".into(),
            },
            step_id: None,
            state: DeliveryState::Opened,
            comparison: MessageComparison::HasNotReceived,
            time_window: None,
        };
        assert!(f.evaluator.matches(&f.customer, &miss).unwrap());
    }

    #[test]
    fn test_segment_leaf_checks_membership() {
        let segment_id = Uuid::new_v4();
        let f = fixture(vec![]);
        let node = QueryNode::Segment { segment_id };
        assert!(!f.evaluator.matches(&f.customer, &node).unwrap());

        let f2 = fixture(vec![(segment_id, f.customer.id)]);
        assert!(f2.evaluator.matches(&f.customer, &node).unwrap());
    }

    #[test]
    fn test_nested_composition_recurses() {
        let f = fixture(vec![]);
        let node = QueryNode::all(vec![
            attr("plan", AttributeComparison::Eq, json!("pro")),
            QueryNode::any(vec![
                attr("age", AttributeComparison::GreaterThan, json!(100)),
                attr("age", AttributeComparison::LessThan, json!(40)),
            ]),
        ]);
        assert!(f.evaluator.matches(&f.customer, &node).unwrap());

        let node = QueryNode::all(vec![
            attr("plan", AttributeComparison::Eq, json!("free")),
            QueryNode::any(vec![attr("age", AttributeComparison::LessThan, json!(40))]),
        ]);
        assert!(!f.evaluator.matches(&f.customer, &node).unwrap());
    }
}
