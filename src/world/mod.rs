//! Interfaces to the collaborators the control plane drives but does not own

pub mod host;
pub mod store;

pub use host::{BindError, WorldHost};
pub use store::{AccountFilter, CharacterStore, CharacterSummary, StoreError};
