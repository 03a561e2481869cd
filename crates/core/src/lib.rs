//! `objproc-core`: building blocks shared by storage backends, processors and the engine.
//!
//! This crate is **pure data and contracts** (no IO, no threads): the processing
//! phase model, the status declaration macro, the processable-object contract and
//! the identifiers/lock token that flow between the layers.

pub mod error;
pub mod id;
pub mod lock;
pub mod phase;
pub mod processable;
pub mod status;

pub use error::{CoreError, CoreResult};
pub use id::ObjectId;
pub use lock::{LockOwner, ObjectLock};
pub use phase::ProcessingPhase;
pub use processable::{ProcessableObject, ProcessingState};
pub use status::{ProcessingStatus, pending_statuses, statuses_in_phase};
