//! Shared vocabulary for the weft model checker: operation tags, process and object
//! identifiers, and schedules.
//!
//! The strings produced by the `Display` impls in this crate are part of the checker's
//! external interface: `weft-checker` prints them verbatim when dumping schedules, so they
//! must not change shape.

mod ids;
mod operations;
mod schedule;

pub use ids::{ObjectId, ProcessId};
pub use operations::Op;
pub use schedule::{Schedule, ScheduleStep};
