//! Core data model: issues, identifiers, and dependency edges.
//!
//! Everything here is plain data. Mutation happens only by replaying event
//! records into the materialized store; nothing in this module touches disk.
//!
//! ## Submodules
//!
//! - [`issue`] — the issue aggregate and its enumerations.
//! - [`issue_id`] — content-derived stable identifiers.
//! - [`dependency`] — typed dependency edges.

pub mod dependency;
pub mod issue;
pub mod issue_id;
