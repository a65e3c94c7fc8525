//! Store-backed restore queues: volume pulls and tape-location lookups.

pub mod prep;
pub mod pull;

pub use self::prep::{DEFAULT_BATCH_SIZE, PrepQueue};
pub use self::pull::{BASE_PRIORITIES, Band, PullQueue, VolumeLock};
