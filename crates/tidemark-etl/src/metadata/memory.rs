//! In-process checkpoint store, used by tests and dry runs

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{MetadataRepository, PipelineCheckpoint};
use crate::error::Result;

#[derive(Default)]
pub struct InMemoryMetadataRepository {
    checkpoints: RwLock<BTreeMap<(String, String), PipelineCheckpoint>>,
}

impl InMemoryMetadataRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(group_id: &str, pipeline_name: &str) -> (String, String) {
    (group_id.to_string(), pipeline_name.to_string())
}

#[async_trait]
impl MetadataRepository for InMemoryMetadataRepository {
    async fn get(&self, group_id: &str, pipeline_name: &str) -> Result<Option<PipelineCheckpoint>> {
        Ok(self
            .checkpoints
            .read()
            .await
            .get(&key(group_id, pipeline_name))
            .cloned())
    }

    async fn put(&self, checkpoint: &PipelineCheckpoint) -> Result<()> {
        self.checkpoints.write().await.insert(
            key(&checkpoint.group_id, &checkpoint.pipeline_name),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn delete(&self, group_id: &str, pipeline_name: &str) -> Result<()> {
        self.checkpoints
            .write()
            .await
            .remove(&key(group_id, pipeline_name));
        Ok(())
    }

    async fn list(&self, group_id: &str) -> Result<Vec<PipelineCheckpoint>> {
        Ok(self
            .checkpoints
            .read()
            .await
            .values()
            .filter(|checkpoint| checkpoint.group_id == group_id)
            .cloned()
            .collect())
    }
}
