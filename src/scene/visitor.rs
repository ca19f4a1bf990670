use crate::scene::node::{Geometry, Node, PagedLod, Transform};

/// Traversal hooks over the node variants. Implementors only override what
/// they care about; recursion into children is handled by [`visit`].
pub trait NodeVisitor {
    fn enter_transform(&mut self, _transform: &Transform) {}
    fn leave_transform(&mut self, _transform: &Transform) {}
    fn visit_geometry(&mut self, _geometry: &Geometry) {}
    fn visit_paged_lod(&mut self, _lod: &PagedLod) {}
}

pub fn visit(node: &Node, visitor: &mut dyn NodeVisitor) {
    match node {
        Node::Group(group) => {
            for child in group.children.read().expect("children read lock").iter() {
                visit(child, visitor);
            }
        }
        Node::Transform(transform) => {
            visitor.enter_transform(transform);
            for child in transform.children.read().expect("children read lock").iter() {
                visit(child, visitor);
            }
            visitor.leave_transform(transform);
        }
        Node::Geometry(geometry) => visitor.visit_geometry(geometry),
        Node::PagedLod(lod) => {
            visitor.visit_paged_lod(lod);
            if let Some(coarse) = &lod.coarse {
                visit(coarse, visitor);
            }
            if let Some(page) = lod.page.load_full() {
                visit(&page, visitor);
            }
        }
    }
}

impl Node {
    pub fn accept(&self, visitor: &mut dyn NodeVisitor) {
        visit(self, visitor);
    }
}
