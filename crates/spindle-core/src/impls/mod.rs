//! Impls - ports の実装
//!
//! - **InMemoryArchiveStore**: CatalogStore + RestoreStore の開発用実装

pub mod memory_store;

pub use self::memory_store::{
    BackupRow, FileRow, IngestRow, InMemoryArchiveStore, Md5Row, PullRow, StoreSnapshot, TarRow,
};
