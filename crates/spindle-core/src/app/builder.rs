//! DispatcherBuilder - 起動時のワイヤリング
//!
//! 設定の検証とストアの有無を build() でまとめてチェックする（Fail-fast）。
//! 足りないものがあれば BuildError を返し、半端な Dispatcher は作らない。

use std::sync::Arc;

use crate::config::{Config, ConfigError};
use crate::division::{Division, FeatureRouter};
use crate::domain::SchedulerError;
use crate::ports::{CatalogStore, Clock, IdGenerator, RestoreStore, SystemClock, UlidGenerator};

use super::Dispatcher;

/// BuildError は Dispatcher 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("no {0} store configured")]
    MissingStore(&'static str),

    #[error("failed to open division {division}: {source}")]
    Division {
        division: String,
        source: SchedulerError,
    },
}

/// # 使用例
/// ```ignore
/// let store = Arc::new(InMemoryArchiveStore::new(clock.clone()));
/// let dispatcher = DispatcherBuilder::new(config)
///     .catalog(store.clone())
///     .restore(store)
///     .build()
///     .await?;
/// ```
pub struct DispatcherBuilder {
    config: Config,
    catalog: Option<Arc<dyn CatalogStore>>,
    restore: Option<Arc<dyn RestoreStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl DispatcherBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            catalog: None,
            restore: None,
            clock: None,
            ids: None,
        }
    }

    pub fn catalog(mut self, catalog: Arc<dyn CatalogStore>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn restore(mut self, restore: Arc<dyn RestoreStore>) -> Self {
        self.restore = Some(restore);
        self
    }

    /// Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to ULIDs on the builder's clock.
    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Validates the config, then opens and seeds every division.
    pub async fn build(self) -> Result<Dispatcher, BuildError> {
        self.config.validate()?;
        let catalog = self.catalog.ok_or(BuildError::MissingStore("catalog"))?;
        let restore = self.restore.ok_or(BuildError::MissingStore("restore"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));

        let router = Arc::new(FeatureRouter::new(&self.config.remote_sources));
        let mut divisions = Vec::with_capacity(self.config.divisions.len());
        for division in &self.config.divisions {
            let opened = Division::open(
                division,
                &self.config.scheduler,
                Arc::clone(&router),
                Arc::clone(&catalog),
                Arc::clone(&restore),
                Arc::clone(&clock),
                Arc::clone(&ids),
            )
            .await
            .map_err(|source| BuildError::Division {
                division: division.name.clone(),
                source,
            })?;
            divisions.push(opened);
        }

        Ok(Dispatcher::new(divisions, self.config.scheduler, clock))
    }
}
