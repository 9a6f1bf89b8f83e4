//! Flow registry and persistence glue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::common::worker_pool::WorkerPool;
use crate::flow::error::PersistenceError;
use crate::flow::executable::ExecutableFlow;
use crate::flow::serialization::{self, FlowExecutionHolder};
use crate::flow::template::Flow;
use crate::jobs::job::JobFactory;

/// Registry of named flow templates plus the persistence of their
/// executions. Implementations differ in how the template set is obtained
/// and refreshed; execution snapshots always live as `{id}.json` files in
/// the manager's storage directory.
pub trait FlowManager: Send + Sync {
    fn has_flow(&self, name: &str) -> bool;

    fn get_flow(&self, name: &str) -> Option<Arc<Flow>>;

    fn get_flows(&self) -> Vec<Arc<Flow>>;

    /// Names of flows no other flow depends on.
    fn root_flow_names(&self) -> Vec<String>;

    fn folders(&self) -> Vec<String>;

    fn root_names_by_folder(&self, folder: &str) -> Vec<String>;

    /// Allocate a fresh execution id. Monotonic and safe under concurrent
    /// callers.
    fn next_id(&self) -> u64;

    fn curr_max_id(&self) -> u64;

    /// Instantiate a fresh run-state tree for the named flow, or `None`
    /// for an unknown name.
    fn create_new_executable_flow(&self, name: &str) -> Option<Arc<ExecutableFlow>>;

    fn save_executable_flow(&self, holder: &FlowExecutionHolder) -> Result<(), PersistenceError>;

    /// Load the persisted execution `id`, or `None` if it was never saved.
    fn load_executable_flow(
        &self,
        id: u64,
    ) -> Result<Option<Arc<FlowExecutionHolder>>, PersistenceError>;

    /// Rebuild the template set from the descriptor source. Not every
    /// implementation supports this.
    fn reload(&self) -> Result<(), anyhow::Error>;
}

/// A frozen template set. All lookups hit immutable maps; only the shared
/// id counter mutates. `RefreshableFlowManager` swaps whole instances of
/// this type on reload.
pub struct ImmutableFlowManager {
    flows: HashMap<String, Arc<Flow>>,
    root_names: Vec<String>,
    folder_index: HashMap<String, Vec<String>>,
    store_dir: PathBuf,
    factory: Arc<dyn JobFactory>,
    pool: Arc<WorkerPool>,
    id_counter: Arc<AtomicU64>,
}

impl ImmutableFlowManager {
    pub fn new(
        flows: HashMap<String, Arc<Flow>>,
        root_names: Vec<String>,
        folder_index: HashMap<String, Vec<String>>,
        store_dir: PathBuf,
        factory: Arc<dyn JobFactory>,
        pool: Arc<WorkerPool>,
        id_counter: Arc<AtomicU64>,
    ) -> Self {
        Self {
            flows,
            root_names,
            folder_index,
            store_dir,
            factory,
            pool,
            id_counter,
        }
    }
}

impl FlowManager for ImmutableFlowManager {
    fn has_flow(&self, name: &str) -> bool {
        self.flows.contains_key(name)
    }

    fn get_flow(&self, name: &str) -> Option<Arc<Flow>> {
        self.flows.get(name).cloned()
    }

    fn get_flows(&self) -> Vec<Arc<Flow>> {
        let mut flows: Vec<(&String, &Arc<Flow>)> = self.flows.iter().collect();
        flows.sort_by(|a, b| a.0.cmp(b.0));
        flows.into_iter().map(|(_, f)| Arc::clone(f)).collect()
    }

    fn root_flow_names(&self) -> Vec<String> {
        self.root_names.clone()
    }

    fn folders(&self) -> Vec<String> {
        let mut folders: Vec<String> = self.folder_index.keys().cloned().collect();
        folders.sort();
        folders
    }

    fn root_names_by_folder(&self, folder: &str) -> Vec<String> {
        self.folder_index.get(folder).cloned().unwrap_or_default()
    }

    fn next_id(&self) -> u64 {
        self.id_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn curr_max_id(&self) -> u64 {
        self.id_counter.load(Ordering::SeqCst)
    }

    fn create_new_executable_flow(&self, name: &str) -> Option<Arc<ExecutableFlow>> {
        let template = self.flows.get(name)?;
        let id = self.next_id().to_string();
        let mut overrides = HashMap::new();
        Some(template.create_executable_flow(&id, &mut overrides))
    }

    fn save_executable_flow(&self, holder: &FlowExecutionHolder) -> Result<(), PersistenceError> {
        serialization::save(&self.store_dir, holder)
    }

    fn load_executable_flow(
        &self,
        id: u64,
    ) -> Result<Option<Arc<FlowExecutionHolder>>, PersistenceError> {
        serialization::load(&self.store_dir, &id.to_string(), &self.factory, &self.pool)
            .map(|opt| opt.map(Arc::new))
    }

    fn reload(&self) -> Result<(), anyhow::Error> {
        Err(anyhow::anyhow!(
            "an immutable flow manager cannot reload; use RefreshableFlowManager"
        ))
    }
}

/// Standard de-duplication entry point used by callers that already hold a
/// template: stamp a tree for `id` with a fresh overrides map.
pub fn instantiate_flow(template: &Flow, id: u64) -> Arc<ExecutableFlow> {
    let mut overrides = HashMap::new();
    template.create_executable_flow(&id.to_string(), &mut overrides)
}
