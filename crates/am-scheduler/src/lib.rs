//! The alert manager's scheduling core: the three-level priority queue
//! (media type → alert pool → alert), the placement/removal invariants, and
//! the retry/outcome state machine. See SPEC_FULL.md §2-4 for the contract
//! every operation here implements.

pub mod heap;
pub mod pool_id;
pub mod scheduler;

pub use pool_id::calc_alertpoolid;
pub use scheduler::{RetryOutcome, Scheduler, SchedulerError};
