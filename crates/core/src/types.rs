//! Shared domain types: attribute schema definitions, customers, segments,
//! and the signal rows (events, deliveries) that segment criteria query.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Attribute Schema ───────────────────────────────────────────────────

/// Declared type of a customer attribute. Drives value coercion at
/// evaluation time; storage itself is an open JSON bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Number,
    Boolean,
    Email,
    Date,
    DateTime,
    Array,
    Object,
}

impl AttributeType {
    /// Whether this type may appear as the subtype of another definition
    /// (e.g. the element type of an `Array`).
    pub fn can_be_subtype(&self) -> bool {
        !matches!(self, AttributeType::Array | AttributeType::Object)
    }

    /// Whether definitions of this type carry a display parameter.
    pub fn requires_parameter(&self) -> bool {
        matches!(self, AttributeType::Date | AttributeType::DateTime)
    }
}

/// Display/format specifier attachable to an attribute definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeParameter {
    DayMonthYear,
    MonthDayYear,
    IsoDate,
    Custom(String),
}

/// A per-workspace attribute definition. At most one definition per
/// workspace carries `is_primary = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerKey {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub attribute_type: AttributeType,
    pub subtype: Option<AttributeType>,
    pub parameter: Option<AttributeParameter>,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomerKey {
    pub fn new(workspace_id: Uuid, name: impl Into<String>, attribute_type: AttributeType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            name: name.into(),
            attribute_type,
            subtype: None,
            parameter: None,
            is_primary: false,
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── Customers ──────────────────────────────────────────────────────────

/// Internal flags maintained by the platform, not the customer schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemAttributes {
    pub is_anonymous: bool,
    pub ios_device_token_set_at: Option<DateTime<Utc>>,
    pub android_device_token_set_at: Option<DateTime<Utc>>,
}

/// A customer profile. `user_attributes` is an open key/value map shaped
/// by the workspace's `CustomerKey` schema. Profiles are never physically
/// merged; alias identifiers accumulate in `other_ids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub user_attributes: HashMap<String, serde_json::Value>,
    pub system_attributes: SystemAttributes,
    pub other_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    pub fn new(workspace_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            user_attributes: HashMap::new(),
            system_attributes: SystemAttributes::default(),
            other_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── Segments ───────────────────────────────────────────────────────────

/// How a segment's membership is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    /// Membership fully derived from `inclusion_criteria`.
    Automatic,
    /// Membership is explicit, authoritative state (CSV imports, API).
    Manual,
    /// Internally reserved.
    System,
}

/// A segment definition. `inclusion_criteria` holds the query AST as data;
/// `cohort-query` parses it. `is_updating` guards against concurrent full
/// recomputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub segment_type: SegmentType,
    pub inclusion_criteria: Option<serde_json::Value>,
    pub is_updating: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Segment {
    /// A new automatic segment starts in the updating state; it becomes
    /// ready once the initial full recompute clears the flag.
    pub fn automatic(
        workspace_id: Uuid,
        name: impl Into<String>,
        inclusion_criteria: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            name: name.into(),
            segment_type: SegmentType::Automatic,
            inclusion_criteria: Some(inclusion_criteria),
            is_updating: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn manual(workspace_id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            name: name.into(),
            segment_type: SegmentType::Manual,
            inclusion_criteria: None,
            is_updating: false,
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── Signal rows ────────────────────────────────────────────────────────

/// A behavioral event attributed to a customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub customer_id: Uuid,
    pub name: String,
    pub properties: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TrackedEvent {
    pub fn new(
        workspace_id: Uuid,
        customer_id: Uuid,
        name: impl Into<String>,
        properties: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            customer_id,
            name: name.into(),
            properties,
            timestamp: Utc::now(),
        }
    }
}

/// Delivery channel of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageChannel {
    Email,
    Push,
    Sms,
    InApp,
}

/// Delivery lifecycle state recorded in the message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sent,
    Opened,
    Clicked,
}

/// One row in the message-delivery log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub customer_id: Uuid,
    pub journey_id: Uuid,
    pub step_id: Uuid,
    pub channel: MessageChannel,
    pub state: DeliveryState,
    pub timestamp: DateTime<Utc>,
}
