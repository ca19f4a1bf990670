use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use itertools::Itertools;
use log::{debug, trace, warn};

use crate::io::loader::LoadOptions;
use crate::rendering::compile::manager::CompileResult;
use crate::rendering::compile::queue::ResourceQueue;
use crate::scene::bounds::normalize_to_unit_sphere;
use crate::scene::node::NodeRef;
use crate::viewer::Viewer;

/// Unit of deferred work. Load tasks run on the background worker pool, merge
/// tasks only ever on the owning thread draining the viewer's update queue;
/// each queue consumer dispatches on the variant it expects.
pub enum Operation {
    Load(LoadTask),
    Merge(MergeTask),
}

impl Operation {
    pub fn run(self) {
        match self {
            Operation::Load(task) => task.run(),
            Operation::Merge(task) => task.run(),
        }
    }
}

/// Loads one object, normalizes it into the unit sphere, compiles it, and on
/// success queues the merge. Never touches the shared scene graph.
pub struct LoadTask {
    pub path: String,
    pub options: Arc<LoadOptions>,
    pub viewer: Weak<Viewer>,
    pub attachment: NodeRef,
}

impl LoadTask {
    pub fn run(self) {
        let loaded = match &self.options.shared {
            Some(shared) => shared.resolve(&self.path, || self.options.loader.load(&self.path, &self.options)),
            None => self.options.loader.load(&self.path, &self.options),
        };
        let node = match loaded {
            Ok(node) => node,
            Err(error) => {
                warn!("Dropping {}: {error:#}", self.path);
                return;
            }
        };

        let Some(viewer) = self.viewer.upgrade() else {
            debug!("Viewer is gone, dropping {}", self.path);
            return;
        };
        if !viewer.active() {
            debug!("Viewer is shutting down, dropping {}", self.path);
            return;
        }
        let Some(manager) = viewer.compile_manager() else {
            warn!("Viewer has no compile manager yet, dropping {}", self.path);
            return;
        };

        let wrapped = normalize_to_unit_sphere(node);
        let result = manager.compile(&wrapped);
        if !result.success() {
            warn!("Compilation of {} failed with {:?}, dropping", self.path, result.status);
            return;
        }

        trace!("Compiled {}", self.path);
        viewer.add_update_operation(Operation::Merge(MergeTask {
            path: self.path,
            viewer: self.viewer,
            attachment: self.attachment,
            node: wrapped,
            result,
        }));
    }
}

/// Applies one fully-compiled object to the live scene: reconciles the shared
/// render state first, then attaches the object, which is the moment it
/// becomes visible to the renderer.
pub struct MergeTask {
    pub path: String,
    pub viewer: Weak<Viewer>,
    pub attachment: NodeRef,
    pub node: NodeRef,
    pub result: CompileResult,
}

impl MergeTask {
    pub fn run(self) {
        let Some(viewer) = self.viewer.upgrade() else {
            debug!("Viewer is gone, dropping merge of {}", self.path);
            return;
        };

        trace!("Merging {} into the scene", self.path);
        viewer.reconcile(&self.result);
        self.attachment.attach(self.node);
    }
}

/// Fixed-size pool of background worker threads pulling operations off a
/// shared queue. Shutdown poisons the queue; idle workers wake up and exit,
/// busy workers finish their current operation first.
pub struct LoaderPool {
    queue: Arc<ResourceQueue<Operation>>,
    /// Operations added but not finished yet. Counted from enqueue to
    /// completion, so there is no window where a popped-but-not-yet-running
    /// operation looks idle.
    outstanding: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>,
}

impl LoaderPool {
    pub fn new(threads: usize) -> Self {
        let queue = Arc::new(ResourceQueue::<Operation>::new());
        let outstanding = Arc::new(AtomicUsize::new(0));

        let workers = (0..threads)
            .map(|index| {
                let queue = queue.clone();
                let outstanding = outstanding.clone();
                std::thread::Builder::new()
                    .name(format!("Loader Worker {}", index))
                    .spawn(move || {
                        while let Some(operation) = queue.take_when_available() {
                            operation.run();
                            outstanding.fetch_sub(1, Ordering::SeqCst);
                        }
                    })
                    .expect("Failed to spawn loader worker")
            })
            .collect_vec();

        Self {
            queue,
            outstanding,
            workers,
        }
    }

    pub fn add(&self, operation: Operation) {
        // counted before the enqueue so a fast worker can't finish (and
        // decrement) before the increment happened
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if !self.queue.add(operation) {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }

    pub fn shutdown(self) {
        self.queue.shutdown();
        for worker in self.workers {
            worker.join().expect("Loader worker to terminate normally");
        }
    }
}
