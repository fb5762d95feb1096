//! In-memory stores.
//!
//! The map lock is only held to look up, insert or remove an entry. Each record
//! sits behind its own `RwLock`, so writes to unrelated records never contend.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;
use toolhub_process::{Configuration, ConfigurationId, Instance, InstanceId, ToolType};

use crate::error::{ToolError, ToolResult};
use crate::repository::{ConfigurationRepository, InstanceMutation, InstanceRepository};

#[derive(Debug)]
struct RecordStore<K, V> {
    what: &'static str,
    records: RwLock<HashMap<K, Arc<RwLock<V>>>>,
}

impl<K, V> RecordStore<K, V>
where
    K: Eq + Hash + Clone + ToString,
    V: Clone,
{
    fn new(what: &'static str) -> Self {
        Self {
            what,
            records: RwLock::new(HashMap::new()),
        }
    }

    async fn insert(&self, key: K, value: V) -> ToolResult<()> {
        let mut map = self.records.write().await;
        if map.contains_key(&key) {
            return Err(ToolError::Conflict(format!(
                "{} already exists: {}",
                self.what,
                key.to_string()
            )));
        }
        map.insert(key, Arc::new(RwLock::new(value)));
        Ok(())
    }

    async fn record(&self, key: &K) -> ToolResult<Arc<RwLock<V>>> {
        self.records
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ToolError::not_found(self.what, key.to_string()))
    }

    async fn get(&self, key: &K) -> ToolResult<V> {
        let rec = self.record(key).await?;
        let v = rec.read().await.clone();
        Ok(v)
    }

    async fn snapshot(&self) -> Vec<V> {
        let recs: Vec<Arc<RwLock<V>>> = self.records.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(recs.len());
        for r in recs {
            out.push(r.read().await.clone());
        }
        out
    }

    async fn replace(&self, key: &K, value: V) -> ToolResult<()> {
        let rec = self.record(key).await?;
        *rec.write().await = value;
        Ok(())
    }

    async fn modify<F>(&self, key: &K, f: F) -> ToolResult<V>
    where
        F: FnOnce(&mut V) -> ToolResult<()>,
    {
        let rec = self.record(key).await?;
        let mut guard = rec.write().await;
        let mut next = guard.clone();
        f(&mut next)?;
        *guard = next.clone();
        Ok(next)
    }

    async fn remove(&self, key: &K) -> ToolResult<()> {
        self.records
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| ToolError::not_found(self.what, key.to_string()))
    }
}

#[derive(Debug)]
pub struct InMemoryConfigurationRepository {
    store: RecordStore<ConfigurationId, Configuration>,
}

impl Default for InMemoryConfigurationRepository {
    fn default() -> Self {
        Self {
            store: RecordStore::new("configuration"),
        }
    }
}

impl InMemoryConfigurationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_configurations(mut v: Vec<Configuration>) -> Vec<Configuration> {
    v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    v
}

#[async_trait]
impl ConfigurationRepository for InMemoryConfigurationRepository {
    async fn save(&self, config: &Configuration) -> ToolResult<()> {
        self.store.insert(config.id.clone(), config.clone()).await
    }

    async fn find_by_id(&self, id: &ConfigurationId) -> ToolResult<Configuration> {
        self.store.get(id).await
    }

    async fn find_by_type(&self, tool_type: ToolType) -> ToolResult<Vec<Configuration>> {
        let all = self.store.snapshot().await;
        Ok(sort_configurations(
            all.into_iter().filter(|c| c.tool_type == tool_type).collect(),
        ))
    }

    async fn find_all(&self) -> ToolResult<Vec<Configuration>> {
        Ok(sort_configurations(self.store.snapshot().await))
    }

    async fn update(&self, config: &Configuration) -> ToolResult<()> {
        self.store.replace(&config.id, config.clone()).await
    }

    async fn delete(&self, id: &ConfigurationId) -> ToolResult<()> {
        self.store.remove(id).await
    }
}

#[derive(Debug)]
pub struct InMemoryInstanceRepository {
    store: RecordStore<InstanceId, Instance>,
}

impl Default for InMemoryInstanceRepository {
    fn default() -> Self {
        Self {
            store: RecordStore::new("instance"),
        }
    }
}

impl InMemoryInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_instances(mut v: Vec<Instance>) -> Vec<Instance> {
    v.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
    v
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn save(&self, instance: &Instance) -> ToolResult<()> {
        self.store.insert(instance.id.clone(), instance.clone()).await
    }

    async fn find_by_id(&self, id: &InstanceId) -> ToolResult<Instance> {
        self.store.get(id).await
    }

    async fn find_running(&self) -> ToolResult<Vec<Instance>> {
        let all = self.store.snapshot().await;
        Ok(sort_instances(all.into_iter().filter(|i| i.is_live()).collect()))
    }

    async fn find_by_type(&self, tool_type: ToolType) -> ToolResult<Vec<Instance>> {
        let all = self.store.snapshot().await;
        Ok(sort_instances(
            all.into_iter()
                .filter(|i| i.config.tool_type == tool_type)
                .collect(),
        ))
    }

    async fn find_all(&self) -> ToolResult<Vec<Instance>> {
        Ok(sort_instances(self.store.snapshot().await))
    }

    async fn update(&self, instance: &Instance) -> ToolResult<()> {
        self.store.replace(&instance.id, instance.clone()).await
    }

    async fn delete(&self, id: &InstanceId) -> ToolResult<()> {
        self.store.remove(id).await
    }

    async fn modify(&self, id: &InstanceId, mutation: InstanceMutation) -> ToolResult<Instance> {
        self.store.modify(id, mutation).await
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, path::PathBuf};

    use chrono::Utc;
    use toolhub_process::InstanceStatus;

    use super::*;

    fn config(tool_type: ToolType, port: u16) -> Configuration {
        let now = Utc::now();
        Configuration {
            id: ConfigurationId::new(),
            name: format!("{tool_type}-{port}"),
            tool_type,
            executable_path: PathBuf::from("/bin/true"),
            working_dir: None,
            host: "127.0.0.1".to_string(),
            port,
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            auto_start: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn instance(tool_type: ToolType) -> Instance {
        Instance::starting(
            InstanceId::new(),
            config(tool_type, 8188),
            Some(1),
            PathBuf::from("x.log"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn save_never_overwrites() {
        let repo = InMemoryConfigurationRepository::new();
        let c = config(ToolType::ComfyUi, 8188);
        repo.save(&c).await.unwrap();

        let mut dup = c.clone();
        dup.name = "other".to_string();
        let err = repo.save(&dup).await.unwrap_err();
        assert!(matches!(err, ToolError::Conflict(_)));
        assert_eq!(repo.find_by_id(&c.id).await.unwrap().name, c.name);
    }

    #[tokio::test]
    async fn missing_ids_are_not_found() {
        let repo = InMemoryConfigurationRepository::new();
        let c = config(ToolType::Ollama, 11434);
        for err in [
            repo.find_by_id(&c.id).await.unwrap_err(),
            repo.update(&c).await.unwrap_err(),
            repo.delete(&c.id).await.unwrap_err(),
        ] {
            assert!(matches!(err, ToolError::NotFound { what: "configuration", .. }));
        }
    }

    #[tokio::test]
    async fn find_by_type_filters_configurations() {
        let repo = InMemoryConfigurationRepository::new();
        repo.save(&config(ToolType::ComfyUi, 8188)).await.unwrap();
        repo.save(&config(ToolType::Ollama, 11434)).await.unwrap();
        repo.save(&config(ToolType::ComfyUi, 8189)).await.unwrap();

        let comfy = repo.find_by_type(ToolType::ComfyUi).await.unwrap();
        assert_eq!(comfy.len(), 2);
        assert!(comfy.iter().all(|c| c.tool_type == ToolType::ComfyUi));
        assert_eq!(repo.find_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn update_then_delete_configuration() {
        let repo = InMemoryConfigurationRepository::new();
        let mut c = config(ToolType::LocalAi, 8080);
        repo.save(&c).await.unwrap();

        c.name = "renamed".to_string();
        repo.update(&c).await.unwrap();
        assert_eq!(repo.find_by_id(&c.id).await.unwrap().name, "renamed");

        repo.delete(&c.id).await.unwrap();
        assert!(repo.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_running_only_returns_live_instances() {
        let repo = InMemoryInstanceRepository::new();
        let live = instance(ToolType::ComfyUi);
        let mut done = instance(ToolType::Ollama);
        done.transition(InstanceStatus::Stopped, Utc::now()).unwrap();
        repo.save(&live).await.unwrap();
        repo.save(&done).await.unwrap();

        let running = repo.find_running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, live.id);

        let ollama = repo.find_by_type(ToolType::Ollama).await.unwrap();
        assert_eq!(ollama.len(), 1);
        assert_eq!(ollama[0].id, done.id);
    }

    #[tokio::test]
    async fn failed_mutation_leaves_record_untouched() {
        let repo = InMemoryInstanceRepository::new();
        let i = instance(ToolType::ComfyUi);
        repo.save(&i).await.unwrap();

        let err = repo
            .modify(
                &i.id,
                Box::new(|inst| {
                    inst.status = InstanceStatus::Running;
                    Err(ToolError::Conflict("nope".to_string()))
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Conflict(_)));
        assert_eq!(
            repo.find_by_id(&i.id).await.unwrap().status,
            InstanceStatus::Starting
        );
    }

    #[tokio::test]
    async fn concurrent_modifications_do_not_lose_updates() {
        let repo = Arc::new(InMemoryInstanceRepository::new());
        let i = instance(ToolType::ComfyUi);
        repo.save(&i).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let repo = repo.clone();
            let id = i.id.clone();
            tasks.push(tokio::spawn(async move {
                repo.modify(
                    &id,
                    Box::new(|inst| {
                        inst.last_error.push('x');
                        Ok(())
                    }),
                )
                .await
                .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(repo.find_by_id(&i.id).await.unwrap().last_error.len(), 32);
    }

    #[tokio::test]
    async fn modify_on_missing_instance_is_not_found() {
        let repo = InMemoryInstanceRepository::new();
        let err = repo
            .modify(&InstanceId::new(), Box::new(|_| Ok(())))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound { what: "instance", .. }));
    }
}
