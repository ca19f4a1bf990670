use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwapOption;
use glam::Affine3A;
use log::warn;

use crate::io::loader::LoadOptions;
use crate::rendering::types::{DeviceMaterial, DeviceMesh, DeviceObject, DeviceTexture, Material, Mesh, Texture};

pub type NodeRef = Arc<Node>;

/// The scene graph node variants. Background threads only ever build and read
/// detached subtrees; once a node is reachable from the shared root, it is
/// mutated exclusively by the owning thread.
#[derive(Debug)]
pub enum Node {
    Group(Group),
    Transform(Transform),
    Geometry(Geometry),
    PagedLod(PagedLod),
}

impl Node {
    pub fn group() -> NodeRef {
        Arc::new(Node::Group(Group::default()))
    }

    pub fn transform(matrix: Affine3A) -> NodeRef {
        Arc::new(Node::Transform(Transform::new(matrix)))
    }

    pub fn geometry(mesh: Mesh, material: Material, texture: Option<Texture>, render_bin: Option<i32>) -> NodeRef {
        Arc::new(Node::Geometry(Geometry::new(mesh, material, texture, render_bin)))
    }

    pub fn paged_lod(path: String, coarse: Option<NodeRef>, options: Arc<LoadOptions>) -> NodeRef {
        Arc::new(Node::PagedLod(PagedLod::new(path, coarse, options)))
    }

    /// Splices `child` under this node. For paged nodes this publishes the
    /// full-detail page and clears the in-flight marker.
    pub fn attach(&self, child: NodeRef) {
        match self {
            Node::Group(group) => group.add_child(child),
            Node::Transform(transform) => transform.add_child(child),
            Node::PagedLod(lod) => {
                lod.page.store(Some(child));
                lod.pending.store(false, Ordering::SeqCst);
            }
            Node::Geometry(_) => warn!("Cannot attach a child to a geometry node"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Group {
    pub children: RwLock<Vec<NodeRef>>,
}

impl Group {
    pub fn add_child(&self, child: NodeRef) {
        self.children.write().expect("children write lock").push(child);
    }
}

#[derive(Debug)]
pub struct Transform {
    pub matrix: Affine3A,
    pub children: RwLock<Vec<NodeRef>>,
}

impl Transform {
    pub fn new(matrix: Affine3A) -> Self {
        Self {
            matrix,
            children: RwLock::new(Vec::new()),
        }
    }

    pub fn add_child(&self, child: NodeRef) {
        self.children.write().expect("children write lock").push(child);
    }
}

/// A drawable leaf. The `DeviceObject` slots start out data-only; the compile
/// traversal fills in the handles while the subgraph is still detached (or,
/// for subgraphs shared between loads, guarded by the write lock).
#[derive(Debug)]
pub struct Geometry {
    pub mesh: RwLock<DeviceMesh>,
    pub material: RwLock<DeviceMaterial>,
    pub texture: Option<RwLock<DeviceTexture>>,
    pub render_bin: Option<i32>,
}

impl Geometry {
    pub fn new(mesh: Mesh, material: Material, texture: Option<Texture>, render_bin: Option<i32>) -> Self {
        Self {
            mesh: RwLock::new(DeviceObject::new(mesh)),
            material: RwLock::new(DeviceObject::new(material)),
            texture: texture.map(|texture| RwLock::new(DeviceObject::new(texture))),
            render_bin,
        }
    }
}

/// Level-of-detail content whose full version is paged in at render time by
/// the streaming subsystem. `coarse` is the always-resident stand-in.
pub struct PagedLod {
    pub path: String,
    pub coarse: Option<NodeRef>,
    pub options: Arc<LoadOptions>,
    pub page: ArcSwapOption<Node>,
    pub pending: AtomicBool,
}

impl PagedLod {
    pub fn new(path: String, coarse: Option<NodeRef>, options: Arc<LoadOptions>) -> Self {
        Self {
            path,
            coarse,
            options,
            page: ArcSwapOption::empty(),
            pending: AtomicBool::new(false),
        }
    }

    pub fn is_resident(&self) -> bool {
        self.page.load().is_some()
    }
}

impl Debug for PagedLod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PagedLod {{ path: {}, resident: {} }}", self.path, self.is_resident())
    }
}
