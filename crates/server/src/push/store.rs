//! On-disk push subscription store.
//!
//! Every mutation is a read-modify-write of the whole file under one async
//! lock, so concurrent subscribe/unsubscribe calls cannot interleave.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use openchamber_protocol::SubscriptionKeys;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::PushError;

pub const MAX_SUBSCRIPTIONS_PER_TOKEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
    pub created_at: u64,
    pub last_seen_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreFile {
    #[serde(default = "current_version")]
    version: u32,
    /// UI session token → subscriptions, newest first.
    #[serde(default)]
    subscriptions_by_session: BTreeMap<String, Vec<PushSubscription>>,
}

fn current_version() -> u32 {
    1
}

pub struct SubscriptionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SubscriptionStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<StoreFile, PushError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(StoreFile::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, file: &StoreFile) -> Result<(), PushError> {
        let json = serde_json::to_vec_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn update<T>(&self, f: impl FnOnce(&mut StoreFile) -> T) -> Result<T, PushError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        file.version = current_version();
        let out = f(&mut file);
        self.write(&file).await?;
        Ok(out)
    }

    /// Register (or refresh) an endpoint for a UI session token.
    pub async fn subscribe(
        &self,
        token: &str,
        endpoint: &str,
        keys: SubscriptionKeys,
    ) -> Result<(), PushError> {
        let now = now_ms();
        self.update(|file| {
            let list = file
                .subscriptions_by_session
                .entry(token.to_string())
                .or_default();
            let created_at = list
                .iter()
                .find(|s| s.endpoint == endpoint)
                .map_or(now, |s| s.created_at);
            list.retain(|s| s.endpoint != endpoint);
            list.insert(
                0,
                PushSubscription {
                    endpoint: endpoint.to_string(),
                    keys,
                    created_at,
                    last_seen_at: now,
                },
            );
            list.truncate(MAX_SUBSCRIPTIONS_PER_TOKEN);
        })
        .await
    }

    /// Returns whether the endpoint was registered for this token.
    pub async fn unsubscribe(&self, token: &str, endpoint: &str) -> Result<bool, PushError> {
        self.update(|file| {
            let Some(list) = file.subscriptions_by_session.get_mut(token) else {
                return false;
            };
            let before = list.len();
            list.retain(|s| s.endpoint != endpoint);
            let removed = list.len() != before;
            if list.is_empty() {
                file.subscriptions_by_session.remove(token);
            }
            removed
        })
        .await
    }

    /// Drop an endpoint from every token. Browsers may route several UI
    /// sessions to the same push endpoint.
    pub async fn remove_endpoint(&self, endpoint: &str) -> Result<usize, PushError> {
        let removed = self
            .update(|file| {
                let mut removed = 0;
                file.subscriptions_by_session.retain(|_, list| {
                    let before = list.len();
                    list.retain(|s| s.endpoint != endpoint);
                    removed += before - list.len();
                    !list.is_empty()
                });
                removed
            })
            .await?;
        debug!(
            component = "push",
            event = "push.store.endpoint_pruned",
            endpoint = %endpoint,
            removed,
        );
        Ok(removed)
    }

    pub async fn for_token(&self, token: &str) -> Result<Vec<PushSubscription>, PushError> {
        let _guard = self.lock.lock().await;
        let file = self.read().await?;
        Ok(file
            .subscriptions_by_session
            .get(token)
            .cloned()
            .unwrap_or_default())
    }

    /// Every subscription, deduplicated by endpoint.
    pub async fn unique(&self) -> Result<Vec<PushSubscription>, PushError> {
        let _guard = self.lock.lock().await;
        let file = self.read().await?;
        let mut seen = HashSet::new();
        Ok(file
            .subscriptions_by_session
            .into_values()
            .flatten()
            .filter(|s| seen.insert(s.endpoint.clone()))
            .collect())
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn keys() -> SubscriptionKeys {
        SubscriptionKeys {
            p256dh: "BNc".into(),
            auth: "tBH".into(),
        }
    }

    fn store(dir: &tempfile::TempDir) -> SubscriptionStore {
        SubscriptionStore::new(dir.path().join("push-subscriptions.json"))
    }

    #[tokio::test]
    async fn caps_per_token_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for i in 0..12 {
            store
                .subscribe("tok", &format!("https://push/{i}"), keys())
                .await
                .unwrap();
        }
        let list = store.for_token("tok").await.unwrap();
        assert_eq!(list.len(), MAX_SUBSCRIPTIONS_PER_TOKEN);
        assert_eq!(list[0].endpoint, "https://push/11");
        assert!(!list.iter().any(|s| s.endpoint == "https://push/0"));
    }

    #[tokio::test]
    async fn resubscribe_moves_to_front_and_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.subscribe("tok", "https://push/a", keys()).await.unwrap();
        let created = store.for_token("tok").await.unwrap()[0].created_at;
        store.subscribe("tok", "https://push/b", keys()).await.unwrap();
        store.subscribe("tok", "https://push/a", keys()).await.unwrap();

        let list = store.for_token("tok").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].endpoint, "https://push/a");
        assert_eq!(list[0].created_at, created);
    }

    #[tokio::test]
    async fn concurrent_subscribes_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(&dir));
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .subscribe(&format!("tok-{}", i % 4), &format!("https://push/{i}"), keys())
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(store.unique().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn prune_is_global_and_unique_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.subscribe("a", "https://push/shared", keys()).await.unwrap();
        store.subscribe("b", "https://push/shared", keys()).await.unwrap();
        store.subscribe("b", "https://push/own", keys()).await.unwrap();

        assert_eq!(store.unique().await.unwrap().len(), 2);
        assert_eq!(store.remove_endpoint("https://push/shared").await.unwrap(), 2);
        assert!(store.for_token("a").await.unwrap().is_empty());
        assert_eq!(store.for_token("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_reports_membership() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.subscribe("a", "https://push/x", keys()).await.unwrap();
        assert!(!store.unsubscribe("b", "https://push/x").await.unwrap());
        assert!(store.unsubscribe("a", "https://push/x").await.unwrap());
        assert!(store.unique().await.unwrap().is_empty());
    }
}
