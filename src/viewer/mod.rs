use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use anyhow::bail;
use itertools::Itertools;
use log::warn;

use crate::loading::Operation;
use crate::rendering::compile::manager::{CompileManager, CompileResult};
use crate::rendering::device::GpuDevice;
use crate::rendering::resources::ResourceHints;
use crate::streaming::Pager;

/// A render view. Bins are created lazily on first reference and never
/// destroyed during the session.
pub struct View {
    pub bins: RwLock<Vec<Bin>>,
}

impl View {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bins: RwLock::new(Vec::new()),
        })
    }

    pub fn has_bin(&self, number: i32) -> bool {
        self.bins
            .read()
            .expect("bins read lock")
            .iter()
            .any(|bin| bin.number == number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    NoSort,
    Descending,
}

impl SortOrder {
    /// Negative bins draw back-to-front, positive ones front-to-back, bin
    /// zero in traversal order.
    pub fn for_bin_number(number: i32) -> Self {
        if number < 0 {
            SortOrder::Ascending
        } else if number == 0 {
            SortOrder::NoSort
        } else {
            SortOrder::Descending
        }
    }
}

/// Ordered collection of drawables within a view, identified by its number.
#[derive(Debug)]
pub struct Bin {
    pub number: i32,
    pub sort: SortOrder,
}

impl Bin {
    pub fn new(number: i32, sort: SortOrder) -> Self {
        Self { number, sort }
    }
}

/// Per-frame record-and-submit state shared with the renderer. `max_slot` is
/// a high-water mark, only ever raised, and only from the owning thread's
/// merge step.
pub struct RenderTask {
    pub views: Vec<Arc<View>>,
    pub max_slot: AtomicU32,
    pub pager: OnceLock<Arc<Pager>>,
}

impl RenderTask {
    pub fn new(views: Vec<Arc<View>>) -> Self {
        Self {
            views,
            max_slot: AtomicU32::new(0),
            pager: OnceLock::new(),
        }
    }
}

struct UpdateQueue {
    operations: Mutex<VecDeque<Operation>>,
}

impl UpdateQueue {
    fn add(&self, operation: Operation) {
        self.operations
            .lock()
            .expect("update queue lock")
            .push_back(operation);
    }

    fn drain(&self) -> VecDeque<Operation> {
        std::mem::take(&mut *self.operations.lock().expect("update queue lock"))
    }

    fn len(&self) -> usize {
        self.operations.lock().expect("update queue lock").len()
    }
}

/// Owns the scene-facing side of the pipeline: the render tasks, the deferred
/// merge queue, and the compile manager. Background tasks hold it weakly and
/// hand their results over through [`Viewer::add_update_operation`]; all
/// scene and render-state mutation happens inside [`Viewer::update`], on the
/// single thread that calls it.
pub struct Viewer {
    weak_self: Weak<Viewer>,
    active: AtomicBool,
    render_tasks: RwLock<Vec<RenderTask>>,
    update_queue: UpdateQueue,
    compile_manager: OnceLock<Arc<CompileManager>>,
    pager: OnceLock<Arc<Pager>>,
}

impl Viewer {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            active: AtomicBool::new(true),
            render_tasks: RwLock::new(Vec::new()),
            update_queue: UpdateQueue {
                operations: Mutex::new(VecDeque::new()),
            },
            compile_manager: OnceLock::new(),
            pager: OnceLock::new(),
        })
    }

    pub fn assign_render_task(&self, views: Vec<Arc<View>>) {
        self.render_tasks
            .write()
            .expect("render tasks write lock")
            .push(RenderTask::new(views));
    }

    pub fn views(&self) -> Vec<Arc<View>> {
        self.render_tasks
            .read()
            .expect("render tasks read lock")
            .iter()
            .flat_map(|task| task.views.iter().cloned())
            .collect_vec()
    }

    /// Builds the compile context pool and attaches every assigned view to
    /// it. Call once, after the render tasks are assigned and before any
    /// loads are queued.
    pub fn compile(
        &self,
        device: Arc<dyn GpuDevice>,
        hints: &ResourceHints,
        pool_size: usize,
    ) -> Result<(), anyhow::Error> {
        let manager = Arc::new(CompileManager::new(device, hints, pool_size)?);
        manager.add_viewer(self);
        if self.compile_manager.set(manager).is_err() {
            bail!("the compile context pool has already been built");
        }
        Ok(())
    }

    pub fn compile_manager(&self) -> Option<Arc<CompileManager>> {
        self.compile_manager.get().cloned()
    }

    pub fn add_update_operation(&self, operation: Operation) {
        self.update_queue.add(operation);
    }

    pub fn pending_updates(&self) -> usize {
        self.update_queue.len()
    }

    /// The owning thread's drain point: runs once per frame, strictly before
    /// any record/submit work, and applies queued merges in FIFO order.
    pub fn update(&self) {
        for operation in self.update_queue.drain() {
            operation.run();
        }
    }

    /// Folds one compile result into the shared render state. Runs before the
    /// object is attached, so the renderer never sees a node whose
    /// requirements are unaccounted for. Owning thread only, which is why it
    /// stays crate-internal.
    pub(crate) fn reconcile(&self, result: &CompileResult) {
        let tasks = self.render_tasks.read().expect("render tasks read lock");

        for task in tasks.iter() {
            task.max_slot.fetch_max(result.max_slot, Ordering::SeqCst);
        }

        if result.contains_paged_lod {
            if self.pager.get().is_none() {
                match self.compile_manager.get().and_then(|manager| manager.take_pager_context()) {
                    Some(context) => {
                        let pager = Pager::new(context);
                        pager.start();
                        let _ = self.pager.set(pager);
                    }
                    None => warn!("Paged content encountered, but no pager context is available"),
                }
            }
            if let Some(pager) = self.pager.get() {
                for task in tasks.iter() {
                    let _ = task.pager.get_or_init(|| pager.clone());
                }
            }
        }

        for (view, details) in &result.views {
            let Some(view) = view.upgrade() else { continue };
            let mut bins = view.bins.write().expect("bins write lock");
            for &number in &details.indices {
                if !bins.iter().any(|bin| bin.number == number) {
                    bins.push(Bin::new(number, SortOrder::for_bin_number(number)));
                }
            }
        }
    }

    pub fn max_slot(&self) -> u32 {
        self.render_tasks
            .read()
            .expect("render tasks read lock")
            .iter()
            .map(|task| task.max_slot.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0)
    }

    pub fn pager(&self) -> Option<Arc<Pager>> {
        self.pager.get().cloned()
    }

    pub fn weak(&self) -> Weak<Viewer> {
        self.weak_self.clone()
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Winds the pipeline down: the context pool is poisoned so in-flight
    /// compiles finish and new ones fail fast, and the pager thread is joined.
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(manager) = self.compile_manager.get() {
            manager.shutdown();
        }
        if let Some(pager) = self.pager.get() {
            pager.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SortOrder;

    #[test]
    fn sort_order_follows_the_sign() {
        assert_eq!(SortOrder::for_bin_number(-3), SortOrder::Ascending);
        assert_eq!(SortOrder::for_bin_number(0), SortOrder::NoSort);
        assert_eq!(SortOrder::for_bin_number(5), SortOrder::Descending);
    }
}
