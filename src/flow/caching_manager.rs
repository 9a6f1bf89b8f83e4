//! Bounded execution cache over another flow manager.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::common::props::Props;
use crate::flow::error::PersistenceError;
use crate::flow::executable::ExecutableFlow;
use crate::flow::serialization::FlowExecutionHolder;
use crate::flow::status::Status;
use crate::flow::template::Flow;

use super::manager::FlowManager;

/// Keeps recently used executions in memory so repeated loads of the same
/// id do not hit disk, and so live executions stay reachable by id.
///
/// The cache is access-ordered and bounded, but never evicts an execution
/// that is still RUNNING; it warns and overflows instead. Inserting the
/// same id twice is a programming error and panics, since id allocation is
/// monotonic.
pub struct CachingFlowManager {
    inner: Arc<dyn FlowManager>,
    capacity: usize,
    cache: Mutex<Cache>,
}

struct Cache {
    entries: HashMap<u64, Arc<FlowExecutionHolder>>,
    /// Access order, least recently used at the front.
    order: VecDeque<u64>,
}

impl Cache {
    fn touch(&mut self, id: u64) {
        if let Some(pos) = self.order.iter().position(|&x| x == id) {
            self.order.remove(pos);
        }
        self.order.push_back(id);
    }

    fn insert(&mut self, id: u64, holder: Arc<FlowExecutionHolder>, capacity: usize) {
        if self.entries.insert(id, holder).is_some() {
            panic!("execution [{id}] was added to the flow cache twice");
        }
        self.touch(id);

        while self.entries.len() > capacity {
            let Some(&eldest) = self.order.front() else {
                break;
            };
            let running = self
                .entries
                .get(&eldest)
                .map(|h| h.flow.status() == Status::Running)
                .unwrap_or(false);
            if running {
                log::warn!(
                    "flow cache is over capacity ({} > {capacity}) but execution [{eldest}] \
                     is still running; refusing to evict it",
                    self.entries.len()
                );
                break;
            }
            self.order.pop_front();
            self.entries.remove(&eldest);
        }
    }
}

impl CachingFlowManager {
    pub fn new(inner: Arc<dyn FlowManager>, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            cache: Mutex::new(Cache {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// The cached holder for a live or recently loaded execution.
    pub fn cached_execution(&self, id: u64) -> Option<Arc<FlowExecutionHolder>> {
        let mut cache = self.cache.lock().unwrap();
        let holder = cache.entries.get(&id).cloned();
        if holder.is_some() {
            cache.touch(id);
        }
        holder
    }
}

impl FlowManager for CachingFlowManager {
    fn has_flow(&self, name: &str) -> bool {
        self.inner.has_flow(name)
    }

    fn get_flow(&self, name: &str) -> Option<Arc<Flow>> {
        self.inner.get_flow(name)
    }

    fn get_flows(&self) -> Vec<Arc<Flow>> {
        self.inner.get_flows()
    }

    fn root_flow_names(&self) -> Vec<String> {
        self.inner.root_flow_names()
    }

    fn folders(&self) -> Vec<String> {
        self.inner.folders()
    }

    fn root_names_by_folder(&self, folder: &str) -> Vec<String> {
        self.inner.root_names_by_folder(folder)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id()
    }

    fn curr_max_id(&self) -> u64 {
        self.inner.curr_max_id()
    }

    /// Creates through the wrapped manager and installs the new execution
    /// into the cache immediately, so it is reachable by id for its whole
    /// lifetime.
    fn create_new_executable_flow(&self, name: &str) -> Option<Arc<ExecutableFlow>> {
        let flow = self.inner.create_new_executable_flow(name)?;
        let id: u64 = match flow.id().parse() {
            Ok(id) => id,
            Err(_) => {
                log::warn!(
                    "execution id [{}] is not numeric; not caching it",
                    flow.id()
                );
                return Some(flow);
            }
        };
        let holder = Arc::new(FlowExecutionHolder::new(Arc::clone(&flow), Props::new()));
        self.cache.lock().unwrap().insert(id, holder, self.capacity);
        Some(flow)
    }

    fn save_executable_flow(&self, holder: &FlowExecutionHolder) -> Result<(), PersistenceError> {
        self.inner.save_executable_flow(holder)
    }

    fn load_executable_flow(
        &self,
        id: u64,
    ) -> Result<Option<Arc<FlowExecutionHolder>>, PersistenceError> {
        if let Some(holder) = self.cached_execution(id) {
            return Ok(Some(holder));
        }
        match self.inner.load_executable_flow(id)? {
            Some(holder) => {
                let mut cache = self.cache.lock().unwrap();
                // A racing load may have inserted it first; reuse that one.
                if let Some(existing) = cache.entries.get(&id).cloned() {
                    cache.touch(id);
                    return Ok(Some(existing));
                }
                cache.insert(id, Arc::clone(&holder), self.capacity);
                Ok(Some(holder))
            }
            None => Ok(None),
        }
    }

    fn reload(&self) -> Result<(), anyhow::Error> {
        self.inner.reload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::individual::IndividualJobExecutableFlow;
    use crate::flow::refreshable_manager::RefreshableFlowManager;
    use crate::flow::testkit::{pool, TestFactory};
    use crate::jobs::descriptor::JobDescriptor;
    use crate::jobs::job::JobFactory;
    use crate::jobs::manager::InMemoryDescriptorSource;

    fn holder_with_status(id: &str, status: Option<Status>) -> Arc<FlowExecutionHolder> {
        let factory: Arc<dyn JobFactory> = Arc::new(TestFactory::new());
        let node = IndividualJobExecutableFlow::new(id, "job", factory, pool());
        if let Some(status) = status {
            node.restore(status, None, None, None, None);
        }
        Arc::new(FlowExecutionHolder::new(
            Arc::new(ExecutableFlow::Individual(node)),
            Props::new(),
        ))
    }

    fn empty_cache() -> Cache {
        Cache {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let mut cache = empty_cache();
        cache.insert(1, holder_with_status("1", None), 2);
        cache.insert(2, holder_with_status("2", None), 2);
        cache.touch(1);
        cache.insert(3, holder_with_status("3", None), 2);

        assert!(cache.entries.contains_key(&1));
        assert!(!cache.entries.contains_key(&2));
        assert!(cache.entries.contains_key(&3));
    }

    #[test]
    fn test_running_executions_are_not_evicted() {
        let mut cache = empty_cache();
        cache.insert(1, holder_with_status("1", Some(Status::Running)), 1);
        cache.insert(2, holder_with_status("2", None), 1);

        // Over capacity, but the running execution stays.
        assert_eq!(cache.entries.len(), 2);
        assert!(cache.entries.contains_key(&1));
    }

    #[test]
    #[should_panic(expected = "added to the flow cache twice")]
    fn test_duplicate_insert_panics() {
        let mut cache = empty_cache();
        cache.insert(1, holder_with_status("1", None), 4);
        cache.insert(1, holder_with_status("1", None), 4);
    }

    #[test]
    fn test_created_executions_are_immediately_cached() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(InMemoryDescriptorSource::new(vec![JobDescriptor::new(
            "a", "test",
        )]));
        let inner = RefreshableFlowManager::new(
            source,
            Arc::new(TestFactory::new()),
            pool(),
            dir.path().to_path_buf(),
        )
        .unwrap();
        let caching = CachingFlowManager::new(Arc::new(inner), 4);

        let flow = caching.create_new_executable_flow("a").unwrap();
        let id: u64 = flow.id().parse().unwrap();
        let cached = caching.cached_execution(id).unwrap();
        assert!(Arc::ptr_eq(&cached.flow, &flow));

        // Loads of a cached id must not rebuild from disk.
        let loaded = caching.load_executable_flow(id).unwrap().unwrap();
        assert!(Arc::ptr_eq(&loaded, &cached));
    }
}
