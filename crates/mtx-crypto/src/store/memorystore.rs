// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CryptoStore, PickleKind, Result, StoreEntry};

/// An in-memory only store that forgets all the E2EE state once it's
/// dropped.
///
/// Useful for tests and for clients that don't want to persist any state.
#[derive(Debug, Default)]
pub struct MemoryStore {
    account: DashMap<String, Vec<u8>>,
    sessions: DashMap<String, Vec<u8>>,
    inbound_group_sessions: DashMap<String, Vec<u8>>,
    outbound_group_sessions: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: PickleKind) -> &DashMap<String, Vec<u8>> {
        match kind {
            PickleKind::Account => &self.account,
            PickleKind::Session => &self.sessions,
            PickleKind::InboundGroup => &self.inbound_group_sessions,
            PickleKind::OutboundGroup => &self.outbound_group_sessions,
        }
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn put(&self, kind: PickleKind, id: &str, blob: Vec<u8>) -> Result<()> {
        self.map(kind).insert(id.to_owned(), blob);
        Ok(())
    }

    async fn put_many(&self, entries: Vec<StoreEntry>) -> Result<()> {
        // In-memory writes can't be observed half-done by the async
        // callers of this store, the batch is applied in one go.
        for entry in entries {
            self.map(entry.kind).insert(entry.id, entry.blob);
        }

        Ok(())
    }

    async fn get(&self, kind: PickleKind, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map(kind).get(id).map(|blob| blob.clone()))
    }

    async fn delete(&self, kind: PickleKind, id: &str) -> Result<()> {
        self.map(kind).remove(id);
        Ok(())
    }

    async fn list(&self, kind: PickleKind) -> Result<Vec<String>> {
        Ok(self.map(kind).iter().map(|entry| entry.key().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{CryptoStore, MemoryStore, PickleKind, StoreEntry};

    #[tokio::test]
    async fn blob_round_trip() {
        let store = MemoryStore::new();

        store.put(PickleKind::Session, "a|1", vec![1, 2, 3]).await.unwrap();

        assert_eq!(store.get(PickleKind::Session, "a|1").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.get(PickleKind::Account, "a|1").await.unwrap(), None);

        store.delete(PickleKind::Session, "a|1").await.unwrap();
        assert_eq!(store.get(PickleKind::Session, "a|1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_many_files_entries_under_their_kind() {
        let store = MemoryStore::new();

        store
            .put_many(vec![
                StoreEntry { kind: PickleKind::Account, id: "account".into(), blob: vec![1] },
                StoreEntry { kind: PickleKind::Session, id: "a|1".into(), blob: vec![2] },
                StoreEntry { kind: PickleKind::Session, id: "a|2".into(), blob: vec![3] },
            ])
            .await
            .unwrap();

        assert_eq!(store.get(PickleKind::Account, "account").await.unwrap(), Some(vec![1]));

        let mut ids = store.list(PickleKind::Session).await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a|1".to_owned(), "a|2".to_owned()]);
    }
}
