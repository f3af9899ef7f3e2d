//! In-memory world host and character store
//!
//! Used by the demo binary and the tests. Both support failure injection.

pub mod store;
pub mod world;

pub use store::SimCharacterStore;
pub use world::SimWorldHost;
