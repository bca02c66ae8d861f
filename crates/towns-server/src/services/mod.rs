//! Business logic services

pub mod towns;

pub use towns::{CacheReport, TownsService};
