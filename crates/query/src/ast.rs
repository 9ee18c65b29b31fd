//! The segment query AST. Criteria are stored on segments as JSON and
//! parsed into [`QueryNode`] before evaluation.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cohort_core::types::{DeliveryState, MessageChannel};
use cohort_core::{CohortError, CohortResult};

/// Boolean combinator for composition nodes and property-filter groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionOp {
    All,
    Any,
}

/// Comparison applied by an attribute leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeComparison {
    Eq,
    NotEq,
    Contains,
    NotContains,
    Exists,
    NotExists,
    GreaterThan,
    LessThan,
    After,
    Before,
    During,
    LengthEq,
    LengthGreaterThan,
    LengthLessThan,
    NestedEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventComparison {
    HasPerformed,
    HasNotPerformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageComparison {
    HasReceived,
    HasNotReceived,
}

/// Which journeys a message leaf counts deliveries from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JourneySelector {
    #[default]
    AnyJourney,
    JourneysWithTag {
        tag: String,
    },
    Journey {
        journey_id: Uuid,
    },
}

/// Time bound on event and message leaves, either relative to evaluation
/// time ("N days ago") or absolute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeWindow {
    Relative {
        #[serde(default)]
        after_days_ago: Option<i64>,
        #[serde(default)]
        before_days_ago: Option<i64>,
    },
    Absolute {
        #[serde(default)]
        after: Option<DateTime<Utc>>,
        #[serde(default)]
        before: Option<DateTime<Utc>>,
    },
}

impl TimeWindow {
    /// Whether `ts` falls inside the window, resolved against `now`.
    pub fn contains(&self, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            TimeWindow::Relative {
                after_days_ago,
                before_days_ago,
            } => {
                let after_ok = after_days_ago
                    .map(|days| ts >= now - Duration::days(days))
                    .unwrap_or(true);
                let before_ok = before_days_ago
                    .map(|days| ts <= now - Duration::days(days))
                    .unwrap_or(true);
                after_ok && before_ok
            }
            TimeWindow::Absolute { after, before } => {
                let after_ok = after.map(|bound| ts >= bound).unwrap_or(true);
                let before_ok = before.map(|bound| ts <= bound).unwrap_or(true);
                after_ok && before_ok
            }
        }
    }
}

/// One equality filter against a (possibly dotted) event property path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilter {
    pub key: String,
    pub value: serde_json::Value,
}

/// Property filters combined with ALL/ANY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilterGroup {
    pub op: CompositionOp,
    pub filters: Vec<PropertyFilter>,
}

/// A node of the segment query grammar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryNode {
    Composition {
        op: CompositionOp,
        children: Vec<QueryNode>,
    },
    Attribute {
        key: String,
        comparison: AttributeComparison,
        #[serde(default)]
        value: Option<serde_json::Value>,
        #[serde(default)]
        nested_key: Option<String>,
    },
    Event {
        event_name: String,
        comparison: EventComparison,
        #[serde(default = "default_event_count")]
        count: u64,
        #[serde(default)]
        time_window: Option<TimeWindow>,
        #[serde(default)]
        property_filters: Option<PropertyFilterGroup>,
    },
    Message {
        channel: MessageChannel,
        #[serde(default)]
        journey: JourneySelector,
        #[serde(default)]
        step_id: Option<Uuid>,
        state: DeliveryState,
        comparison: MessageComparison,
        #[serde(default)]
        time_window: Option<TimeWindow>,
    },
    Segment {
        segment_id: Uuid,
    },
}

fn default_event_count() -> u64 {
    1
}

impl QueryNode {
    pub fn all(children: Vec<QueryNode>) -> Self {
        QueryNode::Composition {
            op: CompositionOp::All,
            children,
        }
    }

    pub fn any(children: Vec<QueryNode>) -> Self {
        QueryNode::Composition {
            op: CompositionOp::Any,
            children,
        }
    }

    /// Parse a segment's stored criteria into the AST. Malformed criteria
    /// is a validation failure, never a silent skip.
    pub fn from_criteria(criteria: &serde_json::Value) -> CohortResult<Self> {
        serde_json::from_value(criteria.clone())
            .map_err(|e| CohortError::validation(format!("malformed segment criteria: {e}")))
    }

    pub fn to_criteria(&self) -> CohortResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Every event name referenced anywhere in the tree.
    pub fn event_names(&self) -> HashSet<&str> {
        let mut names = HashSet::new();
        self.collect_event_names(&mut names);
        names
    }

    /// Whether any event leaf in the tree references the given name. Used
    /// as the cheap pre-filter before per-customer reconciliation.
    pub fn references_event(&self, name: &str) -> bool {
        self.event_names().contains(name)
    }

    fn collect_event_names<'a>(&'a self, names: &mut HashSet<&'a str>) {
        match self {
            QueryNode::Composition { children, .. } => {
                for child in children {
                    child.collect_event_names(names);
                }
            }
            QueryNode::Event { event_name, .. } => {
                names.insert(event_name.as_str());
            }
            _ => {}
        }
    }
}

/// Walk a dotted path ("order.items.sku") into a JSON value.
pub fn lookup_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_criteria_round_trips_through_json() {
        let node = QueryNode::all(vec![
            QueryNode::Attribute {
                key: "plan".into(),
                comparison: AttributeComparison::Eq,
                value: Some(json!("pro")),
                nested_key: None,
            },
            QueryNode::any(vec![QueryNode::Event {
                event_name: "login".into(),
                comparison: EventComparison::HasPerformed,
                count: 1,
                time_window: Some(TimeWindow::Relative {
                    after_days_ago: Some(7),
                    before_days_ago: None,
                }),
                property_filters: None,
            }]),
        ]);

        let criteria = node.to_criteria().unwrap();
        assert_eq!(criteria["type"], "composition");
        let parsed = QueryNode::from_criteria(&criteria).unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn test_malformed_criteria_is_validation_error() {
        let err = QueryNode::from_criteria(&json!({"type": "composition"})).unwrap_err();
        assert!(matches!(err, cohort_core::CohortError::Validation(_)));
    }

    #[test]
    fn test_references_event_walks_nested_tree() {
        let node = QueryNode::all(vec![
            QueryNode::Attribute {
                key: "plan".into(),
                comparison: AttributeComparison::Exists,
                value: None,
                nested_key: None,
            },
            QueryNode::any(vec![QueryNode::Event {
                event_name: "purchase".into(),
                comparison: EventComparison::HasPerformed,
                count: 1,
                time_window: None,
                property_filters: None,
            }]),
        ]);
        assert!(node.references_event("purchase"));
        assert!(!node.references_event("login"));
    }

    #[test]
    fn test_relative_window_contains() {
        let now = Utc::now();
        let window = TimeWindow::Relative {
            after_days_ago: Some(7),
            before_days_ago: None,
        };
        assert!(window.contains(now - Duration::days(3), now));
        assert!(!window.contains(now - Duration::days(8), now));
    }

    #[test]
    fn test_lookup_path_walks_nested_objects() {
        let value = json!({"order": {"total": 42, "items": {"sku": "a-1"}}});
        assert_eq!(lookup_path(&value, "order.total"), Some(&json!(42)));
        assert_eq!(lookup_path(&value, "order.items.sku"), Some(&json!("a-1")));
        assert_eq!(lookup_path(&value, "order.missing"), None);
    }
}
