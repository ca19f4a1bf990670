use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use log::{debug, trace, warn};

use crate::loading::{MergeTask, Operation};
use crate::rendering::compile::context::CompileContext;
use crate::rendering::compile::manager::compile_with_context;
use crate::rendering::compile::queue::ResourceQueue;
use crate::scene::node::{Node, NodeRef};
use crate::viewer::Viewer;

pub struct PageRequest {
    pub lod: NodeRef,
    pub viewer: Weak<Viewer>,
}

/// Background subsystem paging in full-detail content for `PagedLod` nodes.
/// Created lazily, at most once per session, by the owning thread's merge
/// step, and handed its own compile context so it never competes for the
/// pool. Requests are serviced in arrival order; eviction is not this
/// pager's business.
pub struct Pager {
    requests: Arc<ResourceQueue<PageRequest>>,
    context: Mutex<Option<CompileContext>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Pager {
    pub fn new(context: CompileContext) -> Arc<Self> {
        Arc::new(Self {
            requests: Arc::new(ResourceQueue::new()),
            context: Mutex::new(Some(context)),
            worker: Mutex::new(None),
        })
    }

    /// Spawns the pager thread. Called exactly once, right after creation.
    pub fn start(self: &Arc<Self>) {
        let Some(mut context) = self.context.lock().expect("pager context lock").take() else {
            warn!("Pager started twice, ignoring");
            return;
        };

        let requests = self.requests.clone();
        let worker = std::thread::Builder::new()
            .name("Pager".into())
            .spawn(move || {
                while let Some(request) = requests.take_when_available() {
                    Self::service(&mut context, request);
                }
            })
            .expect("Failed to spawn pager thread");

        *self.worker.lock().expect("pager worker lock") = Some(worker);
    }

    /// Queues a page-in for a paged node whose full content is not resident
    /// yet. Requests for non-paged nodes or pages already in flight are
    /// ignored.
    pub fn request(&self, lod: NodeRef, viewer: Weak<Viewer>) {
        let Node::PagedLod(paged) = &*lod else { return };
        if paged.is_resident() {
            return;
        }
        if paged.pending.swap(true, Ordering::SeqCst) {
            return; // already in flight
        }

        trace!("Paging in {}", paged.path);
        self.requests.add(PageRequest { lod, viewer });
    }

    fn service(context: &mut CompileContext, request: PageRequest) {
        let Node::PagedLod(paged) = &*request.lod else { return };

        let Some(viewer) = request.viewer.upgrade() else {
            debug!("Viewer is gone, dropping page {}", paged.path);
            paged.pending.store(false, Ordering::SeqCst);
            return;
        };
        if !viewer.active() {
            debug!("Viewer is shutting down, dropping page {}", paged.path);
            paged.pending.store(false, Ordering::SeqCst);
            return;
        }

        let options = &paged.options;
        let node = match options.loader.load(&paged.path, options) {
            Ok(node) => node,
            Err(error) => {
                warn!("Paging {} failed: {error:#}", paged.path);
                paged.pending.store(false, Ordering::SeqCst);
                return;
            }
        };

        let result = compile_with_context(context, &node);
        if !result.success() {
            warn!("Page {} failed to compile ({:?}), dropping", paged.path, result.status);
            paged.pending.store(false, Ordering::SeqCst);
            return;
        }

        // publication happens on the owning thread, after reconciliation
        viewer.add_update_operation(Operation::Merge(MergeTask {
            path: paged.path.clone(),
            viewer: request.viewer.clone(),
            attachment: request.lod.clone(),
            node,
            result,
        }));
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Poisons the request queue and joins the pager thread.
    pub fn shutdown(&self) {
        self.requests.shutdown();
        if let Some(worker) = self.worker.lock().expect("pager worker lock").take() {
            worker.join().expect("Pager thread to terminate normally");
        }
    }
}

/// Collects paged nodes that neither have their full page resident nor a
/// request in flight. The driver calls this where a real renderer's record
/// traversal would notice the missing detail level.
pub fn collect_unresolved_pages(node: &NodeRef, out: &mut Vec<NodeRef>) {
    match &**node {
        Node::Group(group) => {
            for child in group.children.read().expect("children read lock").iter() {
                collect_unresolved_pages(child, out);
            }
        }
        Node::Transform(transform) => {
            for child in transform.children.read().expect("children read lock").iter() {
                collect_unresolved_pages(child, out);
            }
        }
        Node::Geometry(_) => {}
        Node::PagedLod(paged) => {
            if let Some(page) = paged.page.load_full() {
                collect_unresolved_pages(&page, out);
            } else if !paged.pending.load(Ordering::SeqCst) {
                out.push(node.clone());
            }
        }
    }
}

/// True while any paged node in the subgraph misses its full page, including
/// pages whose request is still in flight.
pub fn has_nonresident_pages(node: &NodeRef) -> bool {
    match &**node {
        Node::Group(group) => group
            .children
            .read()
            .expect("children read lock")
            .iter()
            .any(has_nonresident_pages),
        Node::Transform(transform) => transform
            .children
            .read()
            .expect("children read lock")
            .iter()
            .any(has_nonresident_pages),
        Node::Geometry(_) => false,
        Node::PagedLod(paged) => match paged.page.load_full() {
            Some(page) => has_nonresident_pages(&page),
            None => true,
        },
    }
}
