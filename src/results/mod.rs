//! Result batches submitted during a session.
//!
//! Rows arrive from the portal as arbitrary string-keyed maps. The set of
//! field names is not known in advance, so each batch tracks the union of
//! every field it has seen (its dynamic schema) alongside the rows
//! themselves. The reserved `task` field is lifted out of the rows and kept
//! as the batch's task label.
//!
//! * [`data`]: [`ResultRow`], [`ResultBatch`], and [`ResultSubmission`].
//! * [`accumulator`]: [`ResultAccumulator`], the transactional append path.

pub mod accumulator;
pub mod data;

pub use accumulator::{AppendOutcome, ResultAccumulator};
pub use data::{render_value, ResultBatch, ResultRow, ResultSubmission, TASK_FIELD};
