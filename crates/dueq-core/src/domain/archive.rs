//! Archive - 終端状態になった item の cold table 上のコピー

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::WorkItem;

/// A terminal [`WorkItem`] copied verbatim plus the time it was archived.
///
/// archive は item id をキーにした追記専用テーブル。
/// 同じ item を二度コピーしても最初のコピーが残ります。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    #[serde(flatten)]
    pub item: WorkItem,
    pub archived_at: DateTime<Utc>,
}

impl ArchiveRecord {
    pub fn new(item: WorkItem, archived_at: DateTime<Utc>) -> Self {
        Self { item, archived_at }
    }
}
