//! spindle-core
//!
//! Task scheduling and dispatch for the archive's worker fleet.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, features, task, lease, status, catalog status codes, errors）
//! - **ports**: 抽象化レイヤー（CatalogStore, RestoreStore, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryArchiveStore）
//! - **queue**: feature 別ラウンドロビンの in-memory Queue と QueueHooks
//! - **restore**: store-backed の PullQueue / PrepQueue
//! - **manager**: 優先度レベルと lease・heartbeat を管理する TaskManager
//! - **division**: 1 division 分のキュー一式の構築と初期投入
//! - **app**: Dispatcher, DispatcherBuilder, ReaperLoop, BandScheduleLoop
//! - **config**: TOML 設定
//! - **api**: ディスパッチプロトコルのワイヤ型

pub mod api;
pub mod app;
pub mod config;
pub mod division;
pub mod domain;
pub mod impls;
pub mod manager;
pub mod ports;
pub mod queue;
pub mod restore;
