//! Customer profile storage and the per-workspace attribute schema registry.

pub mod customers;
pub mod schema;

pub use customers::{CustomerStore, WorkspaceProfiles};
pub use schema::{KeyRename, NewKey, SchemaRegistry};
