//! In-process store backed by a concurrent map
//!
//! Used for development runs without an etcd cluster and throughout the
//! test suite. Only leaf keys are stored; directories are implied by key
//! prefixes, matching the etcd view of the tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{normalize_key, KvEntry, KvError, KvStore};

#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaf keys currently stored
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn dir_prefix(dir: &str) -> String {
        let dir = normalize_key(dir);
        if dir.is_empty() {
            dir
        } else {
            format!("{}/", dir)
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<String, KvError> {
        let key = normalize_key(key);
        self.data
            .get(&key)
            .map(|v| v.clone())
            .ok_or(KvError::NotFound(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.data.insert(normalize_key(key), value.to_string());
        Ok(())
    }

    async fn create(&self, key: &str, value: &str) -> Result<(), KvError> {
        let key = normalize_key(key);
        match self.data.entry(key.clone()) {
            Entry::Occupied(_) => Err(KvError::AlreadyExists(key)),
            Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                Ok(())
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let key = normalize_key(key);
        self.data
            .remove(&key)
            .map(|_| ())
            .ok_or(KvError::NotFound(key))
    }

    async fn delete_dir(&self, dir: &str) -> Result<(), KvError> {
        let prefix = Self::dir_prefix(dir);
        let before = self.data.len();
        self.data.retain(|k, _| !k.starts_with(&prefix));
        if self.data.len() == before {
            return Err(KvError::NotFound(normalize_key(dir)));
        }
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<KvEntry>, KvError> {
        let prefix = Self::dir_prefix(dir);
        let mut children: BTreeMap<String, Option<String>> = BTreeMap::new();

        for item in self.data.iter() {
            let Some(rest) = item.key().strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((child, _)) => {
                    children.insert(format!("{}{}", prefix, child), None);
                }
                None => {
                    children
                        .entry(item.key().clone())
                        .or_insert_with(|| Some(item.value().clone()));
                }
            }
        }

        if children.is_empty() {
            return Err(KvError::NotFound(normalize_key(dir)));
        }

        Ok(children
            .into_iter()
            .map(|(key, value)| KvEntry { key, value })
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let key = normalize_key(key);
        if self.data.contains_key(&key) {
            return Ok(true);
        }
        let prefix = Self::dir_prefix(&key);
        Ok(self.data.iter().any(|item| item.key().starts_with(&prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set() {
        let store = MemoryStore::new();
        store.set("/a/b", "1").await.unwrap();

        assert_eq!(store.get("a/b").await.unwrap(), "1");
        assert!(store.get("a/c").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_is_set_if_absent() {
        let store = MemoryStore::new();
        store.create("ports/30000", "").await.unwrap();

        let err = store.create("ports/30000", "x").await.unwrap_err();
        assert_eq!(err, KvError::AlreadyExists("ports/30000".to_string()));
        assert_eq!(store.get("ports/30000").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_list_immediate_children() {
        let store = MemoryStore::new();
        store.set("inst/meta", "{}").await.unwrap();
        store.set("inst/nodes/n1/backend", "cell-a").await.unwrap();
        store.set("inst/nodes/n2/backend", "cell-b").await.unwrap();

        let children = store.list("inst").await.unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].key, "inst/meta");
        assert_eq!(children[0].value.as_deref(), Some("{}"));
        assert_eq!(children[1].key, "inst/nodes");
        assert!(children[1].is_dir());

        let nodes = store.list("inst/nodes").await.unwrap();
        let names: Vec<_> = nodes.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["n1", "n2"]);
    }

    #[tokio::test]
    async fn test_list_missing_dir() {
        let store = MemoryStore::new();
        assert!(store.list("nothing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_dir_recursive() {
        let store = MemoryStore::new();
        store.set("inst/meta", "{}").await.unwrap();
        store.set("inst/nodes/n1/backend", "cell-a").await.unwrap();
        store.set("other/meta", "{}").await.unwrap();

        store.delete_dir("inst").await.unwrap();

        assert!(!store.exists("inst").await.unwrap());
        assert!(store.exists("other/meta").await.unwrap());
        assert!(store.delete_dir("inst").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_exists_for_dirs_and_prefix_collisions() {
        let store = MemoryStore::new();
        store.set("inst-10/meta", "{}").await.unwrap();

        assert!(store.exists("inst-10").await.unwrap());
        assert!(!store.exists("inst-1").await.unwrap());
    }
}
