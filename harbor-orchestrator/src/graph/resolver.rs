use harbor_protocol::Service;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::error::GraphError;

/// Services that can be deployed in parallel: none of them depends on another.
pub type Layer = Vec<Arc<Service>>;

/// The pure logic core of deployment ordering.
///
/// It performs no I/O, so cycles and dangling requirements are reported before a single
/// container or network is touched.
pub struct GraphResolver;

impl GraphResolver {
    /// Solves the `requires` graph into ordered layers.
    ///
    /// A service's layer is the length of the longest requirement chain beneath it: services
    /// without requirements land in layer 0, and a service shared by several dependents waits
    /// for the deepest chain that reaches it. Every requirement of a service therefore sits
    /// in a strictly earlier layer. Within a layer services are sorted by name.
    ///
    /// Any cycle, including a service requiring itself, fails with [`GraphError::Cycle`]
    /// naming the edge that closed it.
    pub fn layered(services: &BTreeMap<String, Arc<Service>>) -> Result<Vec<Layer>, GraphError> {
        let mut heights: HashMap<&str, usize> = HashMap::new();
        let mut path: HashSet<&str> = HashSet::new();

        for name in services.keys() {
            Self::visit(name, services, &mut heights, &mut path)?;
        }

        let depth = match heights.values().max() {
            Some(max) => max + 1,
            None => return Ok(Vec::new()),
        };

        let mut layers: Vec<Layer> = vec![Vec::new(); depth];
        // BTreeMap iteration keeps every layer sorted by name.
        for (name, service) in services {
            layers[heights[name.as_str()]].push(Arc::clone(service));
        }

        Ok(layers)
    }

    /// Depth-first walk returning the height of `name`, memoized in `heights`.
    ///
    /// `path` holds the services on the current recursion path; meeting one of them again
    /// means the graph has a cycle.
    fn visit<'a>(
        name: &'a str,
        services: &'a BTreeMap<String, Arc<Service>>,
        heights: &mut HashMap<&'a str, usize>,
        path: &mut HashSet<&'a str>,
    ) -> Result<usize, GraphError> {
        if let Some(height) = heights.get(name) {
            return Ok(*height);
        }

        let Some(service) = services.get(name) else {
            return Ok(0);
        };

        path.insert(name);
        let mut height = 0;
        for dependency in service.requires() {
            if path.contains(dependency.as_str()) {
                return Err(GraphError::Cycle {
                    from: name.to_string(),
                    to: dependency.clone(),
                });
            }
            let required = services
                .get(dependency)
                .ok_or_else(|| GraphError::DependencyNotFound {
                    service: name.to_string(),
                    dependency: dependency.clone(),
                })?;
            let below = Self::visit(required.name(), services, heights, path)?;
            height = height.max(below + 1);
        }
        path.remove(name);

        heights.insert(name, height);
        Ok(height)
    }
}
