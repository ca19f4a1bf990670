use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, warn};

use crate::rendering::compile::context::{CompileContext, RenderSink};
use crate::rendering::compile::queue::ResourceQueue;
use crate::rendering::device::GpuDevice;
use crate::rendering::resources::{BinDetails, CollectRequirements, ResourceHints};
use crate::scene::node::NodeRef;
use crate::viewer::{View, Viewer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileStatus {
    Success,
    /// The context pool is permanently empty; the attempt was aborted before
    /// any work happened. Deliberately not retried.
    PoolShutDown,
    /// The device could not satisfy a reservation or an allocation; only this
    /// object is affected.
    OutOfResources,
    /// Submission or wait failed. Fatal for this object, not for the process.
    DeviceError,
}

/// Outcome of one compile invocation. Ownership passes to whoever queues the
/// merge; the merge step applies it to the shared render state exactly once.
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub status: CompileStatus,
    pub max_slot: u32,
    pub contains_paged_lod: bool,
    /// Bin usage per render view the compiling context feeds. Weak so a view
    /// torn down mid-flight is simply skipped at merge time.
    pub views: Vec<(Weak<View>, BinDetails)>,
}

impl CompileResult {
    pub fn aborted(status: CompileStatus) -> Self {
        Self {
            status,
            max_slot: 0,
            contains_paged_lod: false,
            views: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self.status, CompileStatus::Success)
    }
}

/// Orchestrates compilation against a bounded pool of reusable contexts.
/// `compile` may be called from any number of threads; callers beyond the pool
/// size block on checkout, which is the pipeline's only admission control.
pub struct CompileManager {
    pool: ResourceQueue<CompileContext>,
    pool_size: usize,
    /// Extra context outside the pool, handed to the streaming pager when
    /// paged content first shows up.
    pager_context: Mutex<Option<CompileContext>>,
}

impl CompileManager {
    pub fn new(device: Arc<dyn GpuDevice>, hints: &ResourceHints, pool_size: usize) -> Result<Self, anyhow::Error> {
        if pool_size == 0 {
            anyhow::bail!("the compile context pool needs at least one context");
        }

        let pool = ResourceQueue::new();
        for _ in 0..pool_size {
            pool.add(CompileContext::new(device.clone(), hints)?);
        }
        let pager_context = CompileContext::new(device, hints)?;

        Ok(Self {
            pool,
            pool_size,
            pager_context: Mutex::new(Some(pager_context)),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    fn lease(&self) -> Option<ContextLease<'_>> {
        self.pool.take_when_available().map(|context| ContextLease {
            context: Some(context),
            pool: &self.pool,
        })
    }

    /// Compiles a detached subgraph: checkout, collect requirements, reserve,
    /// traverse, record and wait. Synchronous from the caller's point of view;
    /// the context goes back into the pool on every path.
    pub fn compile(&self, object: &NodeRef) -> CompileResult {
        let Some(mut lease) = self.lease() else {
            debug!("Compile aborted, the context pool is shut down");
            return CompileResult::aborted(CompileStatus::PoolShutDown);
        };

        compile_with_context(&mut lease, object)
    }

    /// Takes every context out of the pool, mutates it, and puts it back.
    /// Serializes against in-flight compiles: this blocks until all of them
    /// have checked their contexts back in.
    fn reconfigure(&self, mut mutate: impl FnMut(&mut CompileContext)) {
        let mut contexts = Vec::with_capacity(self.pool_size);
        while contexts.len() < self.pool_size {
            match self.pool.take_when_available() {
                Some(context) => contexts.push(context),
                None => break,
            }
        }

        for context in &mut contexts {
            mutate(context);
        }
        if let Some(context) = self.pager_context.lock().expect("pager context lock").as_mut() {
            mutate(context);
        }

        for context in contexts {
            self.pool.add(context);
        }
    }

    /// Attaches a device-only sink to every context. Configuration-time
    /// operation, not meant to run concurrently with active compiles.
    pub fn add_device(&self) {
        self.reconfigure(|context| context.add_sink(RenderSink::for_device()));
    }

    /// Attaches one view to every context.
    pub fn add_view(&self, view: Arc<View>) {
        self.reconfigure(|context| context.add_sink(RenderSink::for_view(view.clone())));
    }

    /// Attaches all views assigned to a viewer to every context.
    pub fn add_viewer(&self, viewer: &Viewer) {
        let views = viewer.views();
        self.reconfigure(|context| {
            for view in &views {
                context.add_sink(RenderSink::for_view(view.clone()));
            }
        });
    }

    pub fn take_pager_context(&self) -> Option<CompileContext> {
        self.pager_context.lock().expect("pager context lock").take()
    }

    /// Poisons the pool: in-flight compiles finish and check in (their
    /// contexts are dropped), new compiles fail fast with `PoolShutDown`.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

/// Shared between the pooled path and the pager's dedicated context.
pub(crate) fn compile_with_context(context: &mut CompileContext, object: &NodeRef) -> CompileResult {
    let mut collector = CollectRequirements::default();
    object.accept(&mut collector);
    let requirements = collector.requirements;

    let bin_details = requirements.bin_details();
    let mut views = Vec::new();
    for sink in context.sinks() {
        if let Some(view) = &sink.view {
            if !bin_details.indices.is_empty() {
                views.push((Arc::downgrade(view), bin_details.clone()));
            }
        }
    }

    let mut result = CompileResult {
        status: CompileStatus::OutOfResources,
        max_slot: requirements.max_slot,
        contains_paged_lod: requirements.contains_paged_lod,
        views,
    };

    if let Err(error) = context.reserve(&requirements) {
        warn!("Resource reservation failed: {error:#}");
        context.reset();
        return result;
    }

    if let Err(error) = context.compile_subgraph(object) {
        warn!("Resource compilation failed: {error:#}");
        context.reset();
        return result;
    }

    if let Err(error) = context.record().and_then(|()| context.wait_for_completion()) {
        error!("Device submission failed: {error:#}");
        context.reset();
        result.status = CompileStatus::DeviceError;
        return result;
    }

    result.status = CompileStatus::Success;
    result
}

/// Checkout guard for one compile context. Dropping it returns the context to
/// the pool, also on early-return and failure paths, so the pool never leaks
/// capacity.
pub struct ContextLease<'a> {
    context: Option<CompileContext>,
    pool: &'a ResourceQueue<CompileContext>,
}

impl Deref for ContextLease<'_> {
    type Target = CompileContext;

    fn deref(&self) -> &CompileContext {
        self.context.as_ref().expect("context lease already released")
    }
}

impl DerefMut for ContextLease<'_> {
    fn deref_mut(&mut self) -> &mut CompileContext {
        self.context.as_mut().expect("context lease already released")
    }
}

impl Drop for ContextLease<'_> {
    fn drop(&mut self) {
        if let Some(mut context) = self.context.take() {
            context.reset();
            self.pool.add(context);
        }
    }
}
