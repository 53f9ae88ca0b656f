//! Persistence of repositories and tracked references.

pub mod keydb;
#[cfg(test)]
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{ReferenceId, Repository, RepositoryId, TrackedReference};

pub use keydb::KeyDbStore;
#[cfg(test)]
pub use memory::MemoryStore;

/// Record store consumed by the watcher and the service.
///
/// Repositories are returned with their tracked references attached.  Reads
/// issued after an `update_*` call observe that update.
#[async_trait]
pub trait Store: Send + Sync {
    /// Repositories eligible for polling (see [`Repository::is_pollable`]).
    async fn find_active_repositories(&self) -> Result<Vec<Repository>> {
        let all = self.find_all_repositories().await?;
        Ok(all.into_iter().filter(Repository::is_pollable).collect())
    }

    /// Every repository that has not been logically deleted.
    async fn find_all_repositories(&self) -> Result<Vec<Repository>>;

    async fn find_repository(&self, id: RepositoryId) -> Result<Option<Repository>>;

    /// Insert or overwrite a repository record.  Its references are not
    /// written.
    async fn save_repository(&self, repository: &Repository) -> Result<()>;

    /// Overwrite the fields of a known repository.
    async fn update_repository(&self, repository: &Repository) -> Result<()> {
        self.save_repository(repository).await
    }

    async fn find_reference(&self, id: ReferenceId) -> Result<Option<TrackedReference>>;

    /// Insert or overwrite a batch of references, indexing each under its
    /// repository.
    async fn save_references(&self, batch: &[TrackedReference]) -> Result<()>;

    async fn update_references(&self, batch: &[TrackedReference]) -> Result<()> {
        self.save_references(batch).await
    }
}
