//! Errors - エラー型と分類
//!
//! 「タスクなし」「タスク失敗」「不明な task_id の完了報告」はエラーではなく
//! 通常の戻り値で表現する。ここに来るのはプロトコル違反とストア障害だけ。

use thiserror::Error;

use super::FeatureError;
use crate::ports::StoreError;

/// ErrorKind は境界（HTTP など）での扱いを決める分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 呼び出し側のプロトコル違反（不正な feature、未知の queue 名）
    Protocol,
    /// 存在しない division など
    NotFound,
    /// 永続ストアの障害
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown division={0}")]
    UnknownDivision(String),

    #[error("unknown pull_queue_id={0}")]
    UnknownPullRow(i64),

    #[error("unknown queue={0}")]
    UnknownQueue(String),

    #[error("malformed features: {0}")]
    MalformedFeatures(#[from] FeatureError),

    #[error("malformed task data: {0}")]
    MalformedData(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::UnknownDivision(_) | SchedulerError::UnknownPullRow(_) => {
                ErrorKind::NotFound
            }
            SchedulerError::UnknownQueue(_)
            | SchedulerError::MalformedFeatures(_)
            | SchedulerError::MalformedData(_) => ErrorKind::Protocol,
            SchedulerError::Store(_) => ErrorKind::Infrastructure,
        }
    }
}
