//! In-process platform: assets live in a map, expressions are evaluated
//! locally and tasks follow a scripted sequence of states.
//!
//! Used for `--dry-run` and by the test suites.

use super::{AssetProbe, Platform, PlatformError, TaskHandle, TaskState, TaskStatus};
use crate::asset::AssetId;
use crate::expr::CollectionExpr;
use geobatch::sanitize::coordinates_len;
use geojson::Feature;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

#[derive(Debug)]
struct TaskRecord {
    description: String,
    destination: AssetId,
    /// Evaluated at submission; written to `destination` on completion.
    features: Vec<Feature>,
    /// States still to be reported; the last one sticks.
    script: VecDeque<TaskState>,
    current: TaskState,
}

#[derive(Debug, Default)]
struct Inner {
    assets: BTreeMap<AssetId, Vec<Feature>>,
    tasks: HashMap<String, TaskRecord>,
    default_script: Vec<TaskState>,
    scripts: HashMap<String, Vec<TaskState>>,
    failing_probes: HashSet<AssetId>,
    failing_deletes: HashSet<AssetId>,
    exports: Vec<(String, AssetId)>,
    deleted: Vec<AssetId>,
    status_polls: usize,
}

/// A [`Platform`] that keeps everything in memory.
#[derive(Debug)]
pub struct InMemoryPlatform {
    project: String,
    inner: Mutex<Inner>,
}

impl InMemoryPlatform {
    /// Tasks report `RUNNING` once, then `COMPLETED`.
    pub fn new(project: &str) -> Self {
        Self {
            project: project.trim_end_matches('/').to_owned(),
            inner: Mutex::new(Inner {
                default_script: vec![TaskState::Running, TaskState::Completed],
                ..Default::default()
            }),
        }
    }

    /// State sequence used by every task without a specific script.
    pub fn with_default_script(self, states: Vec<TaskState>) -> Self {
        self.inner.lock().default_script = states;
        self
    }

    /// State sequence for the task submitted with `description`.
    pub fn script_task(&self, description: &str, states: Vec<TaskState>) {
        self.inner.lock().scripts.insert(description.to_owned(), states);
    }

    pub fn insert_asset(&self, id: AssetId, features: Vec<Feature>) {
        self.inner.lock().assets.insert(id, features);
    }

    /// Makes existence checks of `id` fail with a transport error.
    pub fn fail_probe(&self, id: AssetId) {
        self.inner.lock().failing_probes.insert(id);
    }

    /// Makes deletion of `id` fail.
    pub fn fail_delete(&self, id: AssetId) {
        self.inner.lock().failing_deletes.insert(id);
    }

    pub fn asset(&self, id: &AssetId) -> Option<Vec<Feature>> {
        self.inner.lock().assets.get(id).cloned()
    }

    pub fn asset_ids(&self) -> Vec<AssetId> {
        self.inner.lock().assets.keys().cloned().collect()
    }

    /// `(description, destination)` of every submitted export, in order.
    pub fn exports(&self) -> Vec<(String, AssetId)> {
        self.inner.lock().exports.clone()
    }

    pub fn deleted(&self) -> Vec<AssetId> {
        self.inner.lock().deleted.clone()
    }

    pub fn status_polls(&self) -> usize {
        self.inner.lock().status_polls
    }

    /// Evaluates a collection against the stored assets.
    pub fn evaluate(&self, collection: &CollectionExpr) -> Result<Vec<Feature>, PlatformError> {
        let inner = self.inner.lock();
        evaluate(&inner.assets, collection)
    }
}

fn evaluate(
    assets: &BTreeMap<AssetId, Vec<Feature>>,
    collection: &CollectionExpr,
) -> Result<Vec<Feature>, PlatformError> {
    match collection {
        CollectionExpr::Inline(features) => Ok(features.as_ref().clone()),
        CollectionExpr::Asset(id) => assets
            .get(id)
            .cloned()
            .ok_or_else(|| PlatformError::Rejected(format!("Asset '{}' not found", id))),
        CollectionExpr::Merge(a, b) => {
            let mut out = evaluate(assets, a)?;
            out.extend(evaluate(assets, b)?);
            Ok(out)
        }
        CollectionExpr::FlagEmpty { source, property } => {
            let mut features = evaluate(assets, source)?;
            for feature in &mut features {
                let empty = feature
                    .geometry
                    .as_ref()
                    .map_or(true, |g| coordinates_len(&g.value) == 0);
                feature
                    .properties
                    .get_or_insert_with(Default::default)
                    .insert(property.clone(), i64::from(empty).into());
            }
            Ok(features)
        }
        CollectionExpr::FilterEq {
            source,
            property,
            value,
        } => {
            let features = evaluate(assets, source)?;
            Ok(features
                .into_iter()
                .filter(|f| {
                    f.property(property).and_then(|v| v.as_i64()) == Some(*value)
                })
                .collect())
        }
    }
}

impl Platform for InMemoryPlatform {
    async fn probe_asset(&self, id: &AssetId) -> Result<AssetProbe, PlatformError> {
        let inner = self.inner.lock();
        if inner.failing_probes.contains(id) {
            return Err(PlatformError::Transport(format!("probe of {} timed out", id)));
        }
        Ok(if inner.assets.contains_key(id) {
            AssetProbe::Exists
        } else {
            AssetProbe::Missing
        })
    }

    async fn export_table(
        &self,
        collection: &CollectionExpr,
        description: &str,
        destination: &AssetId,
    ) -> Result<TaskHandle, PlatformError> {
        let mut inner = self.inner.lock();
        if inner.assets.contains_key(destination) {
            return Err(PlatformError::Rejected(format!(
                "Cannot overwrite asset '{}'",
                destination
            )));
        }
        let features = evaluate(&inner.assets, collection)?;
        let script: VecDeque<TaskState> = inner
            .scripts
            .get(description)
            .unwrap_or(&inner.default_script)
            .iter()
            .copied()
            .collect();

        let id = format!("{}/operations/{}", self.project, uuid::Uuid::new_v4().simple());
        inner.tasks.insert(
            id.clone(),
            TaskRecord {
                description: description.to_owned(),
                destination: destination.clone(),
                features,
                script,
                current: TaskState::Pending,
            },
        );
        inner
            .exports
            .push((description.to_owned(), destination.clone()));

        Ok(TaskHandle {
            id,
            description: description.to_owned(),
        })
    }

    async fn task_status(&self, task: &TaskHandle) -> Result<TaskStatus, PlatformError> {
        let mut inner = self.inner.lock();
        inner.status_polls += 1;

        let record = inner
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| PlatformError::Rejected(format!("Unknown task '{}'", task.id)))?;

        let was_terminal = record.current.is_terminal();
        if !was_terminal {
            if let Some(next) = record.script.pop_front() {
                record.current = next;
            }
        }
        let state = record.current;
        let description = record.description.clone();
        let finished = (!was_terminal && state == TaskState::Completed)
            .then(|| (record.destination.clone(), std::mem::take(&mut record.features)));

        if let Some((destination, features)) = finished {
            inner.assets.insert(destination, features);
        }

        Ok(TaskStatus {
            state,
            error: (state == TaskState::Failed).then(|| "scripted failure".to_owned()),
            description,
        })
    }

    async fn collection_size(&self, collection: &CollectionExpr) -> Result<u64, PlatformError> {
        let inner = self.inner.lock();
        Ok(evaluate(&inner.assets, collection)?.len() as u64)
    }

    async fn delete_asset(&self, id: &AssetId) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock();
        if inner.failing_deletes.contains(id) {
            return Err(PlatformError::Status {
                status: 403,
                url: id.to_string(),
                body: "permission denied".to_owned(),
            });
        }
        match inner.assets.remove(id) {
            Some(_) => {
                inner.deleted.push(id.clone());
                Ok(())
            }
            None => Err(PlatformError::Status {
                status: 404,
                url: id.to_string(),
                body: "asset not found".to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geojson::{Geometry, Value};

    fn feature(value: Value) -> Feature {
        Feature {
            bbox: None,
            geometry: Some(Geometry::new(value)),
            id: None,
            properties: None,
            foreign_members: None,
        }
    }

    fn square() -> Value {
        Value::Polygon(vec![vec![
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![1.0, 1.0],
            vec![0.0, 0.0],
        ]])
    }

    #[tokio::test]
    async fn export_completes_after_script_and_writes_asset() {
        let platform = InMemoryPlatform::new("projects/p");
        let dest = AssetId::new("projects/p/assets/a");
        let task = platform
            .export_table(&CollectionExpr::inline(vec![feature(square())]), "A", &dest)
            .await
            .unwrap();

        assert_eq!(platform.task_status(&task).await.unwrap().state, TaskState::Running);
        assert!(platform.asset(&dest).is_none());
        assert_eq!(platform.task_status(&task).await.unwrap().state, TaskState::Completed);
        assert_eq!(platform.asset(&dest).unwrap().len(), 1);
        // Sticks at the terminal state.
        assert_eq!(platform.task_status(&task).await.unwrap().state, TaskState::Completed);
        assert_eq!(platform.status_polls(), 3);
        assert_eq!(platform.probe_asset(&dest).await.unwrap(), AssetProbe::Exists);
    }

    #[tokio::test]
    async fn failed_task_writes_nothing() {
        let platform = InMemoryPlatform::new("projects/p");
        platform.script_task("B", vec![TaskState::Failed]);
        let dest = AssetId::new("projects/p/assets/b");
        let task = platform
            .export_table(&CollectionExpr::inline(vec![]), "B", &dest)
            .await
            .unwrap();
        let status = platform.task_status(&task).await.unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert!(status.error.is_some());
        assert_eq!(platform.probe_asset(&dest).await.unwrap(), AssetProbe::Missing);
    }

    #[tokio::test]
    async fn flag_and_filter_drop_empty_geometries() {
        let platform = InMemoryPlatform::new("projects/p");
        let id = AssetId::new("projects/p/assets/src");
        platform.insert_asset(
            id.clone(),
            vec![
                feature(square()),
                feature(Value::Polygon(vec![])),
                feature(Value::MultiPolygon(vec![])),
            ],
        );

        let expr = CollectionExpr::asset(id)
            .flag_empty("empty_buffer")
            .filter_eq("empty_buffer", 0);
        let kept = platform.evaluate(&expr).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].property("empty_buffer").unwrap(), 0);
        assert_eq!(platform.collection_size(&expr).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn overwrite_and_missing_sources_are_rejected() {
        let platform = InMemoryPlatform::new("projects/p");
        let existing = AssetId::new("projects/p/assets/x");
        platform.insert_asset(existing.clone(), vec![]);

        let err = platform
            .export_table(&CollectionExpr::inline(vec![]), "X", &existing)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Rejected(_)));

        let err = platform
            .export_table(
                &CollectionExpr::asset(AssetId::new("projects/p/assets/nope")),
                "Y",
                &AssetId::new("projects/p/assets/y"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Rejected(_)));
    }

    #[tokio::test]
    async fn injected_failures() {
        let platform = InMemoryPlatform::new("projects/p");
        let id = AssetId::new("projects/p/assets/z");
        platform.insert_asset(id.clone(), vec![]);
        platform.fail_probe(id.clone());
        platform.fail_delete(id.clone());

        assert!(matches!(
            platform.probe_asset(&id).await,
            Err(PlatformError::Transport(_))
        ));
        assert!(platform.delete_asset(&id).await.is_err());
        assert!(platform.asset(&id).is_some());
    }
}
