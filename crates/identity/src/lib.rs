//! Customer identity resolution for inbound events and upserts.

pub mod resolver;

pub use resolver::{IdentityResolver, InboundProfile, Resolution};
