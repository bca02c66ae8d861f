//! Towns Core - persistence and cache lifecycle
//!
//! Storage contract, table registry and schema formatting, cache load-state
//! gating, the host collaborator interface, and one-shot data migrations.
//! Concrete database engines live with the host binary.

pub mod cache;
pub mod database;
pub mod error;
pub mod host;
pub mod migrator;
pub mod schema;
pub mod settings;

pub use cache::*;
pub use database::*;
pub use error::*;
pub use host::*;
pub use migrator::*;
pub use schema::{Table, TableNames};
pub use settings::*;
