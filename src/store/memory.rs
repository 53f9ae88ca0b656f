//! In-process [`Store`] for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::Store;
use crate::model::{ReferenceId, Repository, RepositoryId, TrackedReference};

#[derive(Default)]
pub struct MemoryStore {
    repositories: Mutex<BTreeMap<RepositoryId, Repository>>,
    references: Mutex<BTreeMap<ReferenceId, TrackedReference>>,
    reference_writes: Mutex<Vec<Vec<ReferenceId>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a repository together with its references.
    pub fn insert(&self, repository: Repository) {
        let mut refs = self.references.lock().expect("store poisoned");
        for reference in &repository.references {
            refs.insert(reference.id, reference.clone());
        }
        let mut stored = repository;
        stored.references.clear();
        self.repositories
            .lock()
            .expect("store poisoned")
            .insert(stored.id, stored);
    }

    /// Ids of every reference batch written so far, in write order.
    pub fn reference_batches(&self) -> Vec<Vec<ReferenceId>> {
        self.reference_writes.lock().expect("store poisoned").clone()
    }

    fn attach(&self, mut repository: Repository) -> Repository {
        let refs = self.references.lock().expect("store poisoned");
        repository.references = refs
            .values()
            .filter(|r| r.repository_id == repository.id)
            .cloned()
            .collect();
        repository
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_all_repositories(&self) -> Result<Vec<Repository>> {
        let repos: Vec<Repository> = self
            .repositories
            .lock()
            .expect("store poisoned")
            .values()
            .filter(|r| !r.deleted)
            .cloned()
            .collect();
        Ok(repos.into_iter().map(|r| self.attach(r)).collect())
    }

    async fn find_repository(&self, id: RepositoryId) -> Result<Option<Repository>> {
        let repo = self
            .repositories
            .lock()
            .expect("store poisoned")
            .get(&id)
            .cloned();
        Ok(repo.map(|r| self.attach(r)))
    }

    async fn save_repository(&self, repository: &Repository) -> Result<()> {
        let mut stored = repository.clone();
        stored.references.clear();
        self.repositories
            .lock()
            .expect("store poisoned")
            .insert(stored.id, stored);
        Ok(())
    }

    async fn find_reference(&self, id: ReferenceId) -> Result<Option<TrackedReference>> {
        Ok(self.references.lock().expect("store poisoned").get(&id).cloned())
    }

    async fn save_references(&self, batch: &[TrackedReference]) -> Result<()> {
        let mut refs = self.references.lock().expect("store poisoned");
        for reference in batch {
            refs.insert(reference.id, reference.clone());
        }
        self.reference_writes
            .lock()
            .expect("store poisoned")
            .push(batch.iter().map(|r| r.id).collect());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::branch_reference;

    #[tokio::test]
    async fn repositories_come_back_with_references() {
        let store = MemoryStore::new();
        store.insert(Repository {
            id: 1,
            checkout_status: true,
            references: vec![branch_reference(10, 1, "main"), branch_reference(11, 1, "dev")],
            ..Default::default()
        });
        store.insert(Repository {
            id: 2,
            checkout_status: true,
            ..Default::default()
        });

        let repo = store.find_repository(1).await.unwrap().unwrap();
        assert_eq!(repo.references.len(), 2);

        let active = store.find_active_repositories().await.unwrap();
        assert_eq!(active.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn reference_updates_are_visible_and_recorded() {
        let store = MemoryStore::new();
        let mut reference = branch_reference(10, 1, "main");
        store.save_references(&[reference.clone()]).await.unwrap();

        reference.last_seen_hash = "abc".into();
        store.update_references(&[reference]).await.unwrap();

        let stored = store.find_reference(10).await.unwrap().unwrap();
        assert_eq!(stored.last_seen_hash, "abc");
        assert_eq!(store.reference_batches(), vec![vec![10], vec![10]]);
    }
}
