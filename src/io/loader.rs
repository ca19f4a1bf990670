use std::sync::Arc;

use crate::io::resolver::SharedSubgraphs;
use crate::scene::node::NodeRef;

/// Turns a path into an in-memory, detached subgraph. Implementations do the
/// actual format parsing; the pipeline only cares that failure is
/// representable and does not retry.
pub trait NodeLoader: Send + Sync {
    fn load(&self, path: &str, options: &Arc<LoadOptions>) -> Result<NodeRef, anyhow::Error>;
}

/// Read-time options threaded through every load, including the ones the
/// pager issues later for paged content.
pub struct LoadOptions {
    pub loader: Arc<dyn NodeLoader>,
    /// When set, loads of the same path share one subgraph instead of parsing
    /// it once per reference.
    pub shared: Option<Arc<SharedSubgraphs>>,
}

impl LoadOptions {
    pub fn new(loader: Arc<dyn NodeLoader>) -> Arc<Self> {
        Arc::new(Self {
            loader,
            shared: Some(Arc::new(SharedSubgraphs::new())),
        })
    }
}
