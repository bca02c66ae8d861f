//! Towns Types - Pure type definitions for the towns persistence core
//!
//! This crate contains only plain data records (users, towns, claim grids)
//! with no async runtime or database dependencies, so every layer above it
//! can share them.

pub mod claim;
pub mod town;
pub mod user;

pub use claim::*;
pub use town::*;
pub use user::*;

use thiserror::Error;

/// Errors raised while manipulating in-memory records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Chunk ({x}, {z}) is already claimed")]
    AlreadyClaimed { x: i32, z: i32 },

    #[error("User {0} is not a member of this town")]
    NotAMember(uuid::Uuid),
}
