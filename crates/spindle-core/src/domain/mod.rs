//! Domain model (ids, features, records, leases, catalog status codes).

pub mod catalog;
pub mod errors;
pub mod features;
pub mod ids;
pub mod lease;
pub mod service;
pub mod status;
pub mod task;

pub use self::catalog::{BackupRecordStatus, FileStatus, QueueKind, RowStatus};
pub use self::errors::{ErrorKind, SchedulerError};
pub use self::features::{FeatureError, FeatureSet, FeatureSignature};
pub use self::ids::{Id, IdMarker, LeaseId, ParseIdError};
pub use self::lease::{Lease, Selected};
pub use self::service::{ServiceId, ServiceInfo};
pub use self::status::QueueStatus;
pub use self::task::{QueueName, TaskRecord};
