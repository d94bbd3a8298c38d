//! Object catalog
//!
//! `objects` names every identifier and its value kind; `groups` maps them to
//! metric names, labels and cadence tiers, and expands the tables against a
//! discovered [`Inventory`](crate::discovery::Inventory).

pub mod groups;
pub mod objects;

pub use groups::{
    derive_groups, metric_help, Cadences, Capability, PollEntry, PollGroup, Tier, INVERTER_LABEL,
};
pub use objects::{kind_of, object, ObjectInfo};
