//! KeyDB-backed [`Store`].
//!
//! Each record is a flat hash (`HSET` / `HGETALL`); sets index which records
//! exist and which references belong to which repository.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fred::clients::Pool;
use fred::interfaces::{HashesInterface, SetsInterface};
use tracing::{debug, trace};

use super::Store;
use crate::model::{ReferenceId, Repository, RepositoryId, TrackedReference};

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

const REPOSITORIES_KEY: &str = "forgewatch:repositories";

fn repository_key(id: RepositoryId) -> String {
    format!("forgewatch:repository:{id}")
}

fn repository_references_key(id: RepositoryId) -> String {
    format!("forgewatch:repository:{id}:references")
}

fn reference_key(id: ReferenceId) -> String {
    format!("forgewatch:reference:{id}")
}

// ---------------------------------------------------------------------------
// Record <-> flat map
// ---------------------------------------------------------------------------

fn get_str(map: &HashMap<String, String>, field: &str) -> String {
    map.get(field).cloned().unwrap_or_default()
}

fn get_parsed<T: std::str::FromStr + Default>(map: &HashMap<String, String>, field: &str) -> T {
    map.get(field).and_then(|v| v.parse().ok()).unwrap_or_default()
}

fn get_bool(map: &HashMap<String, String>, field: &str) -> bool {
    map.get(field).is_some_and(|v| v == "1")
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn repository_to_pairs(repo: &Repository) -> Vec<(String, String)> {
    vec![
        ("id".into(), repo.id.to_string()),
        ("name".into(), repo.name.clone()),
        ("url".into(), repo.url.clone()),
        ("provider_id".into(), repo.provider_id.clone()),
        (
            "checkout_location".into(),
            repo.checkout_location
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ),
        ("checkout_status".into(), flag(repo.checkout_status)),
        ("checkout_message".into(), repo.checkout_message.clone()),
        ("deleted".into(), flag(repo.deleted)),
        (
            "last_fetch_time".into(),
            repo.last_fetch_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        ),
        ("fetch_error_count".into(), repo.fetch_error_count.to_string()),
        ("fetch_error_message".into(), repo.fetch_error_message.clone()),
    ]
}

fn repository_from_map(map: &HashMap<String, String>) -> Repository {
    let location = get_str(map, "checkout_location");
    Repository {
        id: get_parsed(map, "id"),
        name: get_str(map, "name"),
        url: get_str(map, "url"),
        provider_id: get_str(map, "provider_id"),
        checkout_location: (!location.is_empty()).then(|| PathBuf::from(location)),
        checkout_status: get_bool(map, "checkout_status"),
        checkout_message: get_str(map, "checkout_message"),
        deleted: get_bool(map, "deleted"),
        last_fetch_time: map
            .get("last_fetch_time")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc)),
        fetch_error_count: get_parsed(map, "fetch_error_count"),
        fetch_error_message: get_str(map, "fetch_error_message"),
        references: Vec::new(),
    }
}

fn reference_to_pairs(reference: &TrackedReference) -> Vec<(String, String)> {
    vec![
        ("id".into(), reference.id.to_string()),
        ("repository_id".into(), reference.repository_id.to_string()),
        ("kind".into(), reference.kind.as_str().to_string()),
        ("value".into(), reference.value.clone()),
        ("last_seen_hash".into(), reference.last_seen_hash.clone()),
        ("commit_author".into(), reference.commit_author.clone()),
        (
            "commit_date".into(),
            reference
                .commit_date
                .map(|d| d.to_rfc3339())
                .unwrap_or_default(),
        ),
        ("commit_history".into(), reference.commit_history.clone()),
        ("errored".into(), flag(reference.errored)),
        ("error_message".into(), reference.error_message.clone()),
        ("active".into(), flag(reference.active)),
    ]
}

fn reference_from_map(map: &HashMap<String, String>) -> TrackedReference {
    TrackedReference {
        id: get_parsed(map, "id"),
        repository_id: get_parsed(map, "repository_id"),
        kind: get_parsed(map, "kind"),
        value: get_str(map, "value"),
        last_seen_hash: get_str(map, "last_seen_hash"),
        commit_author: get_str(map, "commit_author"),
        commit_date: map
            .get("commit_date")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok()),
        commit_history: get_str(map, "commit_history"),
        errored: get_bool(map, "errored"),
        error_message: get_str(map, "error_message"),
        active: get_bool(map, "active"),
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct KeyDbStore {
    pool: Pool,
}

impl KeyDbStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn load_repository(&self, id: RepositoryId) -> Result<Option<Repository>> {
        let map: HashMap<String, String> = self
            .pool
            .hgetall(repository_key(id))
            .await
            .context("HGETALL repository")?;
        if map.is_empty() {
            trace!(repository_id = id, "repository not found");
            return Ok(None);
        }
        let mut repository = repository_from_map(&map);
        repository.references = self.load_references(id).await?;
        Ok(Some(repository))
    }

    async fn load_references(&self, repository_id: RepositoryId) -> Result<Vec<TrackedReference>> {
        let ids: Vec<ReferenceId> = self
            .pool
            .smembers(repository_references_key(repository_id))
            .await
            .context("SMEMBERS repository references")?;
        let mut references = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(reference) = self.find_reference(id).await? {
                references.push(reference);
            }
        }
        references.sort_by_key(|r| r.id);
        Ok(references)
    }
}

#[async_trait]
impl Store for KeyDbStore {
    async fn find_all_repositories(&self) -> Result<Vec<Repository>> {
        let ids: Vec<RepositoryId> = self
            .pool
            .smembers(REPOSITORIES_KEY)
            .await
            .context("SMEMBERS repositories")?;
        let mut repositories = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_repository(id).await? {
                Some(repository) if !repository.deleted => repositories.push(repository),
                _ => {}
            }
        }
        repositories.sort_by_key(|r| r.id);
        Ok(repositories)
    }

    async fn find_repository(&self, id: RepositoryId) -> Result<Option<Repository>> {
        self.load_repository(id).await
    }

    async fn save_repository(&self, repository: &Repository) -> Result<()> {
        let _: () = self
            .pool
            .hset(repository_key(repository.id), repository_to_pairs(repository))
            .await
            .context("HSET repository")?;
        let _: () = self
            .pool
            .sadd(REPOSITORIES_KEY, repository.id)
            .await
            .context("SADD repositories")?;
        debug!(repository_id = repository.id, "repository written");
        Ok(())
    }

    async fn find_reference(&self, id: ReferenceId) -> Result<Option<TrackedReference>> {
        let map: HashMap<String, String> = self
            .pool
            .hgetall(reference_key(id))
            .await
            .context("HGETALL reference")?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(reference_from_map(&map)))
    }

    async fn save_references(&self, batch: &[TrackedReference]) -> Result<()> {
        for reference in batch {
            let _: () = self
                .pool
                .hset(reference_key(reference.id), reference_to_pairs(reference))
                .await
                .context("HSET reference")?;
            let _: () = self
                .pool
                .sadd(repository_references_key(reference.repository_id), reference.id)
                .await
                .context("SADD repository references")?;
        }
        debug!(count = batch.len(), "references written");
        Ok(())
    }
}
