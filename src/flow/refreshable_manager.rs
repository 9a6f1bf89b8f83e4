//! Flow manager that rebuilds its template set from a descriptor source.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, RwLock};

use crate::common::files::max_execution_id;
use crate::common::worker_pool::WorkerPool;
use crate::flow::builder;
use crate::flow::error::PersistenceError;
use crate::flow::executable::ExecutableFlow;
use crate::flow::manager::{FlowManager, ImmutableFlowManager};
use crate::flow::serialization::FlowExecutionHolder;
use crate::flow::template::Flow;
use crate::jobs::job::JobFactory;
use crate::jobs::manager::JobDescriptorSource;

/// Holds an atomically swapped `ImmutableFlowManager` snapshot. Reads go
/// to whichever snapshot is current; `reload()` builds a complete new one
/// from the descriptor source and swaps it in, so readers never observe a
/// half-built template set.
pub struct RefreshableFlowManager {
    source: Arc<dyn JobDescriptorSource>,
    factory: Arc<dyn JobFactory>,
    pool: Arc<WorkerPool>,
    store_dir: PathBuf,
    /// Shared across snapshots so reload never resets id allocation.
    id_counter: Arc<AtomicU64>,
    current: RwLock<Arc<ImmutableFlowManager>>,
}

impl RefreshableFlowManager {
    /// Builds the first snapshot immediately. The id counter starts past
    /// the largest `{id}.json` already present in `store_dir`.
    pub fn new(
        source: Arc<dyn JobDescriptorSource>,
        factory: Arc<dyn JobFactory>,
        pool: Arc<WorkerPool>,
        store_dir: PathBuf,
    ) -> Result<Self, anyhow::Error> {
        let start_id = max_execution_id(&store_dir)?;
        let id_counter = Arc::new(AtomicU64::new(start_id));

        let snapshot = build_snapshot(
            &source,
            &factory,
            &pool,
            store_dir.clone(),
            Arc::clone(&id_counter),
        )?;

        Ok(Self {
            source,
            factory,
            pool,
            store_dir,
            id_counter,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    fn snapshot(&self) -> Arc<ImmutableFlowManager> {
        Arc::clone(&self.current.read().unwrap())
    }
}

fn build_snapshot(
    source: &Arc<dyn JobDescriptorSource>,
    factory: &Arc<dyn JobFactory>,
    pool: &Arc<WorkerPool>,
    store_dir: PathBuf,
    id_counter: Arc<AtomicU64>,
) -> Result<ImmutableFlowManager, anyhow::Error> {
    let descriptors = source.load_descriptors()?;
    let flows = builder::build_flows(&descriptors, factory, pool)?;
    let root_names = builder::root_names(&descriptors);

    let mut folder_index: HashMap<String, Vec<String>> = HashMap::new();
    for root in &root_names {
        if let Some(descriptor) = descriptors.get(root) {
            folder_index
                .entry(descriptor.folder().to_string())
                .or_default()
                .push(root.clone());
        }
    }
    for roots in folder_index.values_mut() {
        roots.sort();
    }

    Ok(ImmutableFlowManager::new(
        flows,
        root_names,
        folder_index,
        store_dir,
        Arc::clone(factory),
        Arc::clone(pool),
        id_counter,
    ))
}

impl FlowManager for RefreshableFlowManager {
    fn has_flow(&self, name: &str) -> bool {
        self.snapshot().has_flow(name)
    }

    fn get_flow(&self, name: &str) -> Option<Arc<Flow>> {
        self.snapshot().get_flow(name)
    }

    fn get_flows(&self) -> Vec<Arc<Flow>> {
        self.snapshot().get_flows()
    }

    fn root_flow_names(&self) -> Vec<String> {
        self.snapshot().root_flow_names()
    }

    fn folders(&self) -> Vec<String> {
        self.snapshot().folders()
    }

    fn root_names_by_folder(&self, folder: &str) -> Vec<String> {
        self.snapshot().root_names_by_folder(folder)
    }

    fn next_id(&self) -> u64 {
        self.snapshot().next_id()
    }

    fn curr_max_id(&self) -> u64 {
        self.snapshot().curr_max_id()
    }

    fn create_new_executable_flow(&self, name: &str) -> Option<Arc<ExecutableFlow>> {
        self.snapshot().create_new_executable_flow(name)
    }

    fn save_executable_flow(&self, holder: &FlowExecutionHolder) -> Result<(), PersistenceError> {
        self.snapshot().save_executable_flow(holder)
    }

    fn load_executable_flow(
        &self,
        id: u64,
    ) -> Result<Option<Arc<FlowExecutionHolder>>, PersistenceError> {
        self.snapshot().load_executable_flow(id)
    }

    fn reload(&self) -> Result<(), anyhow::Error> {
        let snapshot = build_snapshot(
            &self.source,
            &self.factory,
            &self.pool,
            self.store_dir.clone(),
            Arc::clone(&self.id_counter),
        )?;
        *self.current.write().unwrap() = Arc::new(snapshot);
        log::info!("flow manager reloaded from descriptor source");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::common::props::Props;
    use crate::flow::status::Status;
    use crate::flow::testkit::{pool, wait, watch, TestFactory};
    use crate::jobs::descriptor::JobDescriptor;
    use crate::jobs::manager::InMemoryDescriptorSource;

    fn manager_over(
        source: Arc<InMemoryDescriptorSource>,
        store_dir: &Path,
    ) -> RefreshableFlowManager {
        RefreshableFlowManager::new(
            source,
            Arc::new(TestFactory::new()),
            pool(),
            store_dir.to_path_buf(),
        )
        .unwrap()
    }

    #[test]
    fn test_roots_and_folders_come_from_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(InMemoryDescriptorSource::new(vec![
            JobDescriptor::new("load", "test")
                .with_path("etl/load.job")
                .with_dependencies(vec!["extract".to_string()]),
            JobDescriptor::new("extract", "test").with_path("etl/extract.job"),
            JobDescriptor::new("report", "test"),
        ]));
        let manager = manager_over(source, dir.path());

        assert_eq!(manager.root_flow_names(), vec!["load", "report"]);
        assert_eq!(manager.folders(), vec!["default", "etl"]);
        assert_eq!(manager.root_names_by_folder("etl"), vec!["load"]);
        assert!(manager.has_flow("extract"));
    }

    #[test]
    fn test_id_counter_resumes_past_persisted_executions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("7.json"), "{}").unwrap();
        let source = Arc::new(InMemoryDescriptorSource::new(vec![JobDescriptor::new(
            "a", "test",
        )]));
        let manager = manager_over(source, dir.path());
        assert_eq!(manager.curr_max_id(), 7);
        assert_eq!(manager.next_id(), 8);
    }

    #[test]
    fn test_reload_picks_up_descriptor_changes() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(InMemoryDescriptorSource::new(vec![JobDescriptor::new(
            "a", "test",
        )]));
        let manager = manager_over(Arc::clone(&source), dir.path());
        assert!(!manager.has_flow("b"));

        source.upsert(JobDescriptor::new("b", "test"));
        manager.reload().unwrap();
        assert!(manager.has_flow("b"));
        assert!(manager.has_flow("a"));
    }

    #[test]
    fn test_created_executions_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(InMemoryDescriptorSource::new(vec![JobDescriptor::new(
            "a", "test",
        )]));
        let manager = manager_over(source, dir.path());

        let flow = manager.create_new_executable_flow("a").unwrap();
        let id: u64 = flow.id().parse().unwrap();
        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);

        let holder = FlowExecutionHolder::new(flow, Props::new());
        manager.save_executable_flow(&holder).unwrap();

        let loaded = manager.load_executable_flow(id).unwrap().unwrap();
        assert_eq!(loaded.flow.status(), Status::Succeeded);
        assert!(manager.load_executable_flow(id + 100).unwrap().is_none());
    }
}
