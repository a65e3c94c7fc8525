//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。永続ストア（カタログ DB、pull_queue）
//! と時刻・ID 生成をここで抽象化し、実装は impls/ に置く。

pub mod catalog_store;
pub mod clock;
pub mod id_generator;
pub mod restore_store;

pub use self::catalog_store::{CatalogStore, StoreError};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::restore_store::{PullRowUpdate, RequeuedRow, RestoreStore, VolumeCandidate};
