//! Segment query language: the boolean AST over customer attributes,
//! behavioral events, message deliveries, and segment membership, plus its
//! two evaluation strategies (per-customer boolean and whole-workspace
//! set algebra).

pub mod ast;
pub mod coerce;
pub mod evaluator;
pub mod materialize;
pub mod stores;

pub use ast::{CompositionOp, QueryNode};
pub use evaluator::QueryEvaluator;
pub use materialize::{BulkEvaluator, ScratchSpace};
pub use stores::{
    DeliveryLog, EventStore, InMemoryDeliveryLog, InMemoryEventStore, JourneyDirectory,
    MembershipReader, SignalSources, StaticJourneyDirectory,
};
