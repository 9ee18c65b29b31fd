//! Materialized segment membership: the store of membership facts, the
//! customer-change queue, and the maintainer that keeps membership in
//! step with segment criteria.

pub mod maintainer;
pub mod queue;
pub mod store;

pub use maintainer::{MembershipDelta, MembershipMaintainer, SegmentDirectory};
pub use queue::{CustomerChangeJob, CustomerChangeQueue, JobQueue};
pub use store::MembershipStore;
