use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::fs;

use crate::types::{ChangeSet, Record, Snapshot};

pub const REDIS_LISTINGS_KEY: &str = "harvester:listings";

/// Durable home of the harvested dataset.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn load_all(&self) -> anyhow::Result<Snapshot>;

    /// Deletes `to_delete`, then upserts `to_insert` and `to_update`.
    async fn apply_change_set(&self, changes: &ChangeSet) -> anyhow::Result<()>;
}

/// Keeps every record in one JSON array file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ListingStore for JsonFileStore {
    async fn load_all(&self) -> anyhow::Result<Snapshot> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no stored listings at {:?}, starting empty", self.path);
                return Ok(Snapshot::default());
            }
            Err(e) => return Err(e).context(format!("could not read {:?}", self.path)),
        };
        let records: Vec<Record> = serde_json::from_slice(&content)
            .context(format!("could not parse stored listings in {:?}", self.path))?;
        debug!("loaded {} listings from {:?}", records.len(), self.path);
        Ok(Snapshot::from_records(records))
    }

    async fn apply_change_set(&self, changes: &ChangeSet) -> anyhow::Result<()> {
        let mut snapshot = self.load_all().await?;
        snapshot.apply(changes);
        let records = snapshot.into_records();

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .context(format!("could not create {:?}", dir))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&records)?)
            .await
            .context(format!("could not write {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .await
            .context(format!("could not move {:?} to {:?}", tmp, self.path))?;

        info!(
            "stored {} listings in {:?} ({})",
            records.len(),
            self.path,
            changes.counts()
        );
        Ok(())
    }
}

/// Keeps records as JSON values in a single redis hash keyed by id.
pub struct RedisStore {
    client: redis::Client,
    key: String,
}

impl RedisStore {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        Self::with_key(url, REDIS_LISTINGS_KEY)
    }

    pub fn with_key(url: &str, key: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context(format!("invalid redis url {}", url))?;
        Ok(RedisStore {
            client,
            key: key.into(),
        })
    }
}

#[async_trait]
impl ListingStore for RedisStore {
    async fn load_all(&self) -> anyhow::Result<Snapshot> {
        let mut con = self
            .client
            .get_async_connection()
            .await
            .context("could not connect to redis")?;
        let values: Vec<String> = con.hvals(&self.key).await?;

        let mut records = Vec::with_capacity(values.len());
        for value in values {
            records.push(
                serde_json::from_str::<Record>(&value)
                    .context(format!("malformed listing in redis hash {}", self.key))?,
            );
        }
        debug!("loaded {} listings from redis", records.len());
        Ok(Snapshot::from_records(records))
    }

    async fn apply_change_set(&self, changes: &ChangeSet) -> anyhow::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for record in &changes.to_delete {
            pipe.hdel(&self.key, &record.id).ignore();
        }
        for record in changes.to_insert.iter().chain(changes.to_update.iter()) {
            pipe.hset(&self.key, &record.id, serde_json::to_string(record)?)
                .ignore();
        }

        let mut con = self
            .client
            .get_async_connection()
            .await
            .context("could not connect to redis")?;
        pipe.query_async::<_, ()>(&mut con)
            .await
            .context(format!("could not apply change set to {}", self.key))?;

        info!("stored change set in redis ({})", changes.counts());
        Ok(())
    }
}
