//! Routes catalog records to features when a queue is seeded.
//!
//! A record naming a `source` goes to that feature. A record whose path sits
//! under a configured remote source goes to that source's feature. Both skip
//! the queue's default features; everything else gets the defaults.

use std::collections::BTreeMap;

use crate::config::RemoteSource;
use crate::domain::{FeatureError, FeatureSet, QueueKind, TaskRecord};

#[derive(Debug, Clone, Default)]
pub struct FeatureRouter {
    /// `(path_prefix, feature)`, longest prefix first.
    prefixes: Vec<(String, String)>,
}

impl FeatureRouter {
    pub fn new(remote_sources: &BTreeMap<String, RemoteSource>) -> Self {
        let mut prefixes: Vec<(String, String)> = remote_sources
            .iter()
            .map(|(feature, source)| (source.path_prefix.clone(), feature.clone()))
            .collect();
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { prefixes }
    }

    pub fn is_remote_feature(&self, feature: &str) -> bool {
        self.prefixes.iter().any(|(_, f)| f == feature)
    }

    /// `Some(features)` when the record is pinned to a source (defaults must
    /// not be added), `None` when the queue defaults apply.
    pub fn route(
        &self,
        kind: QueueKind,
        record: &TaskRecord,
    ) -> Result<Option<FeatureSet>, FeatureError> {
        if let Some(source) = record.get_str("source") {
            return FeatureSet::new([source]).map(Some);
        }
        let Some(path) = source_path(kind, record) else {
            return Ok(None);
        };
        match self.prefixes.iter().find(|(prefix, _)| path.starts_with(prefix.as_str())) {
            Some((_, feature)) => FeatureSet::new([feature.as_str()]).map(Some),
            None => Ok(None),
        }
    }
}

/// Where the worker will read the file from, per queue kind.
fn source_path(kind: QueueKind, record: &TaskRecord) -> Option<&str> {
    match kind {
        QueueKind::Ingest => record.get_str("_file"),
        QueueKind::Copy => record.get_str("origin_file_path"),
        QueueKind::Tar => record
            .get_str("origin_file_path")
            .or_else(|| record.get_str("file_path")),
        _ => None,
    }
}
