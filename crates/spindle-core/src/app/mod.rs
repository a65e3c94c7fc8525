//! App - アプリケーション層
//!
//! division 群を束ねてディスパッチプロトコルを実装し、回収・スケジュールの
//! バックグラウンドループを提供する。
//!
//! # 主要コンポーネント
//! - **DispatcherBuilder**: 設定とストアからの構築（Fail-fast）
//! - **Dispatcher**: NextTask / TaskComplete / PutTask / Heartbeat ほか
//! - **ReaperLoop**: lost lease と滞留 restore 行の回収
//! - **BandScheduleLoop**: pull の追加優先度帯の時刻起動

pub mod band_loop;
pub mod builder;
pub mod dispatcher;
pub mod reaper_loop;

pub use self::band_loop::BandScheduleLoop;
pub use self::builder::{BuildError, DispatcherBuilder};
pub use self::dispatcher::{Dispatcher, DivisionStatus, OfflineResources};
pub use self::reaper_loop::ReaperLoop;
