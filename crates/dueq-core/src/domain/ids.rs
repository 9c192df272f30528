//! Domain identifiers (strongly-typed IDs).
//!
//! ULID (Universally Unique Lexicographically Sortable Identifier) を使用します。
//! `Id<T>` というジェネリック型で共通実装を提供し、`T` は PhantomData の
//! マーカー型としてコンパイル時の型安全性だけを担います。
//!
//! - **時刻でソート可能**: claim の tie-break (`scheduled_for`, `id`) がそのまま生成順になる
//! - **分散生成可能**: producer / worker が調整なしで発行できる

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"item-", "lease-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// # 例
/// ```ignore
/// let item: WorkItemId = Id::from(Ulid::new());
/// let token: LeaseToken = Id::from(Ulid::new());
/// // item と token は異なる型なので、混同できない
/// ```
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Storage form: the bare 26-character ULID, without prefix.
    ///
    /// Lexicographic order of this string equals `Ord` on the id, which the
    /// Postgres claim query relies on for its tie-break.
    pub fn to_storage(&self) -> String {
        self.ulid.to_string()
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Parse error for [`Id`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id {input:?}: {reason}")]
pub struct ParseIdError {
    pub input: String,
    pub reason: String,
}

/// Accepts both the display form (`item-01H...`) and the bare storage form.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|e| ParseIdError {
                input: s.to_string(),
                reason: e.to_string(),
            })
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Item {}

impl IdMarker for Item {
    fn prefix() -> &'static str {
        "item-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lease {}

impl IdMarker for Lease {
    fn prefix() -> &'static str {
        "lease-"
    }
}

/// Identifier of a work item. Immutable for the item's whole life, archive included.
pub type WorkItemId = Id<Item>;

/// Identifies one claim of an item.
///
/// A fresh token is stamped on every claim; ack/nack present it back so the
/// store can tell "my lease" from "a lease the Reaper already handed to someone else".
pub type LeaseToken = Id<Lease>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let ulid1 = Ulid::new();
        let ulid2 = Ulid::new();

        let item = WorkItemId::from_ulid(ulid1);
        let token = LeaseToken::from_ulid(ulid2);

        assert_eq!(item.as_ulid(), ulid1);
        assert_eq!(token.as_ulid(), ulid2);

        assert!(item.to_string().starts_with("item-"));
        assert!(token.to_string().starts_with("lease-"));
        // let _: WorkItemId = token; // <- does not compile
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = WorkItemId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = WorkItemId::from_ulid(Ulid::new());

        assert!(id1 < id2);
        assert!(id1.to_storage() < id2.to_storage());
    }

    #[test]
    fn parses_display_and_storage_forms() {
        let id = WorkItemId::from_ulid(Ulid::new());

        let from_display: WorkItemId = id.to_string().parse().unwrap();
        let from_storage: WorkItemId = id.to_storage().parse().unwrap();

        assert_eq!(from_display, id);
        assert_eq!(from_storage, id);
    }

    #[test]
    fn rejects_garbage() {
        let err = "item-not-a-ulid".parse::<WorkItemId>().unwrap_err();
        assert_eq!(err.input, "item-not-a-ulid");
    }

    #[test]
    fn serializes_as_bare_ulid() {
        let id = WorkItemId::from_ulid(Ulid::new());

        let serialized = serde_json::to_string(&id).unwrap();
        assert_eq!(serialized, format!("\"{}\"", id.to_storage()));

        let deserialized: WorkItemId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(id, deserialized);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;

        assert_eq!(size_of::<WorkItemId>(), size_of::<Ulid>());
        assert_eq!(size_of::<LeaseToken>(), 16);
    }
}
