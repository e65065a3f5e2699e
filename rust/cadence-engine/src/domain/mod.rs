//! Core domain models.
//!
//! This module contains the persisted records: schedules and their runs,
//! query templates, and backfill collections with their week units.

pub mod collection;
pub mod runs;
pub mod schedule;
pub mod template;

pub use collection::*;
pub use runs::*;
pub use schedule::*;
pub use template::*;
