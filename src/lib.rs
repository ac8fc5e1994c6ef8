pub mod config;
pub mod error;
pub mod extract;
pub mod harness;
pub mod ics;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod reconcile;
pub mod recurrence;
pub mod source;
pub mod store;
pub mod walker;
