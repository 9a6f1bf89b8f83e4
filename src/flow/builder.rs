//! Builds flow templates out of job descriptors.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::worker_pool::WorkerPool;
use crate::flow::error::BuildError;
use crate::flow::template::{Flow, IndividualJobFlow, MultipleDependencyFlow};
use crate::jobs::descriptor::JobDescriptor;
use crate::jobs::job::JobFactory;

/// Build one flow template per descriptor. Templates are memoized by job
/// name so shared dependencies become shared subtrees, and a dependency
/// cycle is rejected with the offending path.
pub fn build_flows(
    descriptors: &HashMap<String, JobDescriptor>,
    factory: &Arc<dyn JobFactory>,
    pool: &Arc<WorkerPool>,
) -> Result<HashMap<String, Arc<Flow>>, BuildError> {
    let mut memo: HashMap<String, Arc<Flow>> = HashMap::new();
    let mut names: Vec<&String> = descriptors.keys().collect();
    names.sort();
    for name in names {
        let mut visiting = Vec::new();
        build(name, descriptors, factory, pool, &mut memo, &mut visiting)?;
    }
    Ok(memo)
}

/// Job names that no other job depends on. These are the entry points a
/// folder of descriptors exposes.
pub fn root_names(descriptors: &HashMap<String, JobDescriptor>) -> Vec<String> {
    let mut roots: Vec<String> = descriptors
        .keys()
        .filter(|name| {
            !descriptors
                .values()
                .any(|d| d.dependencies().iter().any(|dep| dep == *name))
        })
        .cloned()
        .collect();
    roots.sort();
    roots
}

fn build(
    name: &str,
    descriptors: &HashMap<String, JobDescriptor>,
    factory: &Arc<dyn JobFactory>,
    pool: &Arc<WorkerPool>,
    memo: &mut HashMap<String, Arc<Flow>>,
    visiting: &mut Vec<String>,
) -> Result<Arc<Flow>, BuildError> {
    if let Some(flow) = memo.get(name) {
        return Ok(Arc::clone(flow));
    }
    if visiting.iter().any(|n| n == name) {
        let mut path = visiting.clone();
        path.push(name.to_string());
        return Err(BuildError::DependencyCycle {
            path: path.join(" -> "),
        });
    }

    let descriptor = descriptors.get(name).ok_or_else(|| BuildError::UnknownJob {
        depender: visiting.last().cloned().unwrap_or_default(),
        dependee: name.to_string(),
    })?;

    visiting.push(name.to_string());
    let node = Flow::Individual(IndividualJobFlow::new(
        name,
        Arc::clone(factory),
        Arc::clone(pool),
    ));
    let flow = if descriptor.dependencies().is_empty() {
        Arc::new(node)
    } else {
        let mut dependees = Vec::with_capacity(descriptor.dependencies().len());
        for dep in descriptor.dependencies() {
            dependees.push(build(dep, descriptors, factory, pool, memo, visiting)?);
        }
        Arc::new(Flow::MultipleDependency(MultipleDependencyFlow {
            depender: Arc::new(node),
            dependees,
        }))
    };
    visiting.pop();

    memo.insert(name.to_string(), Arc::clone(&flow));
    Ok(flow)
}
