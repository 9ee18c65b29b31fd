//! Resolves an inbound payload to exactly one customer, or creates one.
//!
//! Strategies run in a fixed order, first match wins: primary-key value,
//! message-channel attribute value, correlation id. All lookups are
//! workspace-scoped and the whole resolution commits in one transaction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use cohort_core::types::{Customer, SystemAttributes};
use cohort_core::{CohortError, CohortResult};
use cohort_profiles::{CustomerStore, WorkspaceProfiles};

/// Attribute-name prefixes treated as message-channel identifiers.
const CHANNEL_ATTRIBUTE_PREFIXES: [&str; 4] =
    ["email", "phone", "iosDeviceToken", "androidDeviceToken"];

fn is_channel_attribute(name: &str) -> bool {
    CHANNEL_ATTRIBUTE_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// The identity-bearing subset of an inbound event or upsert.
#[derive(Debug, Clone, Default)]
pub struct InboundProfile {
    pub primary_key_value: Option<serde_json::Value>,
    pub correlation_id: Option<String>,
    pub properties: HashMap<String, serde_json::Value>,
}

/// Outcome of a resolution: the customer and whether it was just created.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub customer: Customer,
    pub created: bool,
}

pub struct IdentityResolver {
    store: Arc<CustomerStore>,
}

impl IdentityResolver {
    /// The resolver reads the primary-key designation straight off the
    /// workspace schema inside its transaction.
    pub fn new(store: Arc<CustomerStore>) -> Self {
        Self { store }
    }

    /// Resolve the inbound payload to one customer, applying its attribute
    /// writes, or create a new customer when nothing matches.
    pub fn resolve(&self, workspace_id: Uuid, inbound: &InboundProfile) -> CohortResult<Resolution> {
        let resolution = self.store.transaction(workspace_id, |txn| {
            match self.find_match(workspace_id, txn, inbound) {
                Some(customer_id) => {
                    let customer = apply_inbound(txn, &customer_id, inbound)?;
                    Ok(Resolution {
                        customer,
                        created: false,
                    })
                }
                None => {
                    let customer = create_customer(workspace_id, txn, inbound);
                    Ok(Resolution {
                        customer,
                        created: true,
                    })
                }
            }
        })?;

        if resolution.created {
            metrics::counter!("identity.customers_created").increment(1);
        } else {
            metrics::counter!("identity.customers_resolved").increment(1);
        }
        Ok(resolution)
    }

    /// Record an alias identifier against an existing customer. Aliases are
    /// tracked in `other_ids`; customer rows are never physically merged.
    pub fn identify(
        &self,
        workspace_id: Uuid,
        correlation_id: &str,
        alias: &str,
    ) -> CohortResult<Customer> {
        self.store.transaction(workspace_id, |txn| {
            let customer_id = {
                let hits = txn.find_by_correlation(correlation_id);
                hits.first().map(|c| c.id).ok_or_else(|| {
                    CohortError::not_found(format!("no customer for correlation '{correlation_id}'"))
                })?
            };
            let customer = txn
                .customer_mut(&customer_id)
                .ok_or_else(|| CohortError::not_found(format!("customer {customer_id}")))?;
            if !customer.other_ids.iter().any(|o| o == alias) {
                customer.other_ids.push(alias.to_string());
                customer.updated_at = Utc::now();
            }
            Ok(customer.clone())
        })
    }

    fn find_match(
        &self,
        workspace_id: Uuid,
        txn: &WorkspaceProfiles,
        inbound: &InboundProfile,
    ) -> Option<Uuid> {
        // 1. primary-key value equality
        if let (Some(primary), Some(value)) = (txn.primary_key(), &inbound.primary_key_value) {
            let hits = txn.find_by_attribute(&primary.name, value);
            if let Some(found) = pick(workspace_id, "primary_key", &hits) {
                return Some(found);
            }
        }

        // 2. any configured message-channel attribute value
        for (name, value) in &inbound.properties {
            if !is_channel_attribute(name) {
                continue;
            }
            let hits = txn.find_by_attribute(name, value);
            if let Some(found) = pick(workspace_id, "message_channel", &hits) {
                return Some(found);
            }
        }

        // 3. correlation id against uuid or aliases
        if let Some(correlation) = &inbound.correlation_id {
            let hits = txn.find_by_correlation(correlation);
            if let Some(found) = pick(workspace_id, "correlation", &hits) {
                return Some(found);
            }
        }

        None
    }
}

/// Take the first hit; more than one row from a single strategy is a
/// data-integrity anomaly that is logged but never raised.
fn pick(workspace_id: Uuid, strategy: &str, hits: &[&Customer]) -> Option<Uuid> {
    if hits.len() > 1 {
        warn!(
            workspace_id = %workspace_id,
            strategy = strategy,
            matches = hits.len(),
            "identity resolution returned multiple customers"
        );
        metrics::counter!("identity.resolution_anomalies").increment(1);
    }
    hits.first().map(|c| c.id)
}

fn apply_inbound(
    txn: &mut WorkspaceProfiles,
    customer_id: &Uuid,
    inbound: &InboundProfile,
) -> CohortResult<Customer> {
    let primary_name = txn.primary_key().map(|k| k.name.clone());
    let customer = txn
        .customer_mut(customer_id)
        .ok_or_else(|| CohortError::not_found(format!("customer {customer_id}")))?;

    reconcile_device_tokens(customer, &inbound.properties);

    for (name, value) in &inbound.properties {
        customer
            .user_attributes
            .insert(name.clone(), value.clone());
    }
    if let (Some(name), Some(value)) = (primary_name, &inbound.primary_key_value) {
        customer.user_attributes.insert(name, value.clone());
        customer.system_attributes.is_anonymous = false;
    }
    customer.updated_at = Utc::now();
    debug!(customer_id = %customer.id, "inbound attributes applied");
    Ok(customer.clone())
}

fn create_customer(
    workspace_id: Uuid,
    txn: &mut WorkspaceProfiles,
    inbound: &InboundProfile,
) -> Customer {
    let mut customer = Customer::new(workspace_id);
    customer.system_attributes = SystemAttributes {
        is_anonymous: inbound.primary_key_value.is_none(),
        ..SystemAttributes::default()
    };
    reconcile_device_tokens(&mut customer, &inbound.properties);
    if let (Some(primary), Some(value)) = (txn.primary_key(), &inbound.primary_key_value) {
        customer
            .user_attributes
            .insert(primary.name.clone(), value.clone());
    }
    for (name, value) in &inbound.properties {
        customer
            .user_attributes
            .insert(name.clone(), value.clone());
    }
    if let Some(correlation) = &inbound.correlation_id {
        customer.other_ids.push(correlation.clone());
    }

    debug!(customer_id = %customer.id, workspace_id = %workspace_id, "customer created");
    txn.insert_customer(customer.clone());
    customer
}

/// A stored token that differs from the inbound one is overwritten (not
/// unioned) and the set-at timestamp stamped.
fn reconcile_device_tokens(customer: &mut Customer, properties: &HashMap<String, serde_json::Value>) {
    let now = Utc::now();
    for (name, value) in properties {
        if name.starts_with("iosDeviceToken") {
            if customer.user_attributes.get(name) != Some(value) {
                customer.system_attributes.ios_device_token_set_at = Some(now);
            }
        } else if name.starts_with("androidDeviceToken")
            && customer.user_attributes.get(name) != Some(value)
        {
            customer.system_attributes.android_device_token_set_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::types::AttributeType;
    use cohort_profiles::{NewKey, SchemaRegistry};
    use serde_json::json;

    fn setup() -> (Arc<CustomerStore>, IdentityResolver, Uuid) {
        let store = Arc::new(CustomerStore::new());
        let schema = SchemaRegistry::new(store.clone(), 1);
        let ws = Uuid::new_v4();
        schema
            .create_key(ws, NewKey::new("customer_id", AttributeType::String), None)
            .unwrap();
        schema
            .create_key(ws, NewKey::new("email", AttributeType::Email), None)
            .unwrap();
        let resolver = IdentityResolver::new(store.clone());
        (store, resolver, ws)
    }

    fn promote(store: &Arc<CustomerStore>, ws: Uuid) {
        let schema = SchemaRegistry::new(store.clone(), 1);
        schema.promote_primary_key(ws, "customer_id", None).unwrap();
    }

    #[test]
    fn test_unmatched_payload_creates_customer() {
        let (store, resolver, ws) = setup();
        promote(&store, ws);

        let inbound = InboundProfile {
            primary_key_value: Some(json!("c-1")),
            correlation_id: None,
            properties: HashMap::from([("plan".to_string(), json!("pro"))]),
        };
        let resolution = resolver.resolve(ws, &inbound).unwrap();
        assert!(resolution.created);
        assert!(!resolution.customer.system_attributes.is_anonymous);
        assert_eq!(resolution.customer.user_attributes["customer_id"], json!("c-1"));
        assert_eq!(resolution.customer.user_attributes["plan"], json!("pro"));
    }

    #[test]
    fn test_anonymous_when_no_primary_key_value() {
        let (store, resolver, ws) = setup();
        promote(&store, ws);

        let inbound = InboundProfile {
            primary_key_value: None,
            correlation_id: Some("anon-7".into()),
            properties: HashMap::new(),
        };
        let resolution = resolver.resolve(ws, &inbound).unwrap();
        assert!(resolution.created);
        assert!(resolution.customer.system_attributes.is_anonymous);
        assert_eq!(resolution.customer.other_ids, vec!["anon-7".to_string()]);
    }

    #[test]
    fn test_resolves_by_primary_key_before_channel() {
        let (store, resolver, ws) = setup();
        promote(&store, ws);

        let first = resolver
            .resolve(
                ws,
                &InboundProfile {
                    primary_key_value: Some(json!("c-1")),
                    correlation_id: None,
                    properties: HashMap::from([("email".to_string(), json!("a@x.com"))]),
                },
            )
            .unwrap();

        // Same primary key, different email: must hit the same customer.
        let second = resolver
            .resolve(
                ws,
                &InboundProfile {
                    primary_key_value: Some(json!("c-1")),
                    correlation_id: None,
                    properties: HashMap::from([("email".to_string(), json!("b@x.com"))]),
                },
            )
            .unwrap();

        assert!(!second.created);
        assert_eq!(first.customer.id, second.customer.id);
        assert_eq!(second.customer.user_attributes["email"], json!("b@x.com"));
        assert_eq!(store.customer_count(ws), 1);
    }

    #[test]
    fn test_resolves_by_channel_attribute() {
        let (store, resolver, ws) = setup();
        promote(&store, ws);

        let created = resolver
            .resolve(
                ws,
                &InboundProfile {
                    primary_key_value: Some(json!("c-1")),
                    correlation_id: None,
                    properties: HashMap::from([("email".to_string(), json!("a@x.com"))]),
                },
            )
            .unwrap();

        // No primary key this time, only the email channel value.
        let resolved = resolver
            .resolve(
                ws,
                &InboundProfile {
                    primary_key_value: None,
                    correlation_id: None,
                    properties: HashMap::from([("email".to_string(), json!("a@x.com"))]),
                },
            )
            .unwrap();

        assert!(!resolved.created);
        assert_eq!(created.customer.id, resolved.customer.id);
        assert_eq!(store.customer_count(ws), 1);
    }

    #[test]
    fn test_resolves_by_correlation_alias() {
        let (store, resolver, ws) = setup();
        promote(&store, ws);

        let created = resolver
            .resolve(
                ws,
                &InboundProfile {
                    primary_key_value: None,
                    correlation_id: Some("visitor-9".into()),
                    properties: HashMap::new(),
                },
            )
            .unwrap();

        let resolved = resolver
            .resolve(
                ws,
                &InboundProfile {
                    primary_key_value: None,
                    correlation_id: Some("visitor-9".into()),
                    properties: HashMap::from([("plan".to_string(), json!("free"))]),
                },
            )
            .unwrap();

        assert!(!resolved.created);
        assert_eq!(created.customer.id, resolved.customer.id);
        assert_eq!(store.customer_count(ws), 1);
    }

    #[test]
    fn test_identify_appends_alias_once() {
        let (_, resolver, ws) = setup();

        let created = resolver
            .resolve(
                ws,
                &InboundProfile {
                    primary_key_value: None,
                    correlation_id: Some("visitor-1".into()),
                    properties: HashMap::new(),
                },
            )
            .unwrap();

        resolver.identify(ws, "visitor-1", "crm-55").unwrap();
        let customer = resolver.identify(ws, "visitor-1", "crm-55").unwrap();
        assert_eq!(customer.id, created.customer.id);
        assert_eq!(
            customer.other_ids,
            vec!["visitor-1".to_string(), "crm-55".to_string()]
        );
    }

    #[test]
    fn test_device_token_overwrite_stamps_timestamp() {
        let (_, resolver, ws) = setup();

        let created = resolver
            .resolve(
                ws,
                &InboundProfile {
                    primary_key_value: None,
                    correlation_id: Some("device-1".into()),
                    properties: HashMap::from([(
                        "iosDeviceToken".to_string(),
                        json!("tok-aaa"),
                    )]),
                },
            )
            .unwrap();
        let first_stamp = created.customer.system_attributes.ios_device_token_set_at;
        assert!(first_stamp.is_some());

        let updated = resolver
            .resolve(
                ws,
                &InboundProfile {
                    primary_key_value: None,
                    correlation_id: Some("device-1".into()),
                    properties: HashMap::from([(
                        "iosDeviceToken".to_string(),
                        json!("tok-bbb"),
                    )]),
                },
            )
            .unwrap();
        assert!(!updated.created);
        assert_eq!(
            updated.customer.user_attributes["iosDeviceToken"],
            json!("tok-bbb")
        );
        assert!(updated.customer.system_attributes.ios_device_token_set_at >= first_stamp);
    }
}
