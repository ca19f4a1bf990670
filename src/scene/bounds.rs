use std::sync::Arc;

use glam::{Affine3A, Vec3};

use crate::scene::node::{Geometry, Node, NodeRef, Transform};
use crate::scene::visitor::NodeVisitor;

/// Accumulates the world-space bounding box of a subgraph. Read-only, so it
/// can run on detached subtrees from any thread.
pub struct ComputeBounds {
    pub min: Vec3,
    pub max: Vec3,
    stack: Vec<Affine3A>,
}

impl Default for ComputeBounds {
    fn default() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
            stack: vec![Affine3A::IDENTITY],
        }
    }
}

impl ComputeBounds {
    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x
    }

    pub fn centre(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn radius(&self) -> f32 {
        (self.max - self.min).length() * 0.5
    }
}

impl NodeVisitor for ComputeBounds {
    fn enter_transform(&mut self, transform: &Transform) {
        let top = *self.stack.last().expect("transform stack is never empty");
        self.stack.push(top * transform.matrix);
    }

    fn leave_transform(&mut self, _transform: &Transform) {
        self.stack.pop();
    }

    fn visit_geometry(&mut self, geometry: &Geometry) {
        let matrix = *self.stack.last().expect("transform stack is never empty");
        let mesh = geometry.mesh.read().expect("mesh read lock");
        for position in &mesh.data.positions {
            let world = matrix.transform_point3(*position);
            self.min = self.min.min(world);
            self.max = self.max.max(world);
        }
    }
}

/// Wraps `node` under a transform that centers it on the origin and scales it
/// into the unit sphere, so loaded models of arbitrary extent occupy one grid
/// slot each. Subgraphs without geometry are wrapped with the identity.
pub fn normalize_to_unit_sphere(node: NodeRef) -> NodeRef {
    let mut bounds = ComputeBounds::default();
    node.accept(&mut bounds);

    let matrix = if bounds.is_valid() && bounds.radius() > f32::EPSILON {
        let scale = 1.0 / bounds.radius();
        Affine3A::from_scale(Vec3::splat(scale)) * Affine3A::from_translation(-bounds.centre())
    } else {
        Affine3A::IDENTITY
    };

    let transform = Transform::new(matrix);
    transform.add_child(node);
    Arc::new(Node::Transform(transform))
}

#[cfg(test)]
mod tests {
    use glam::{Affine3A, Vec2, Vec3};

    use crate::rendering::types::{AlbedoType, Material, Mesh};
    use crate::scene::bounds::{ComputeBounds, normalize_to_unit_sphere};
    use crate::scene::node::Node;

    fn box_geometry(min: Vec3, max: Vec3) -> crate::scene::node::NodeRef {
        let mesh = Mesh {
            positions: vec![min, max],
            normals: vec![Vec3::Z, Vec3::Z],
            texcoords: vec![Vec2::ZERO, Vec2::ONE],
            indices: vec![0, 1],
        };
        let material = Material {
            slot: 0,
            albedo: AlbedoType::Value(glam::Vec4::ONE),
        };
        Node::geometry(mesh, material, None, None)
    }

    #[test]
    fn bounds_follow_nested_transforms() {
        let root = Node::transform(Affine3A::from_translation(Vec3::new(10.0, 0.0, 0.0)));
        match &*root {
            Node::Transform(transform) => {
                transform.add_child(box_geometry(Vec3::splat(-1.0), Vec3::splat(1.0)))
            }
            _ => unreachable!(),
        }

        let mut bounds = ComputeBounds::default();
        root.accept(&mut bounds);

        assert!(bounds.is_valid());
        assert_eq!(bounds.centre(), Vec3::new(10.0, 0.0, 0.0));
        assert!((bounds.radius() - Vec3::splat(1.0).length()).abs() < 1e-5);
    }

    #[test]
    fn normalization_centers_and_scales() {
        let node = box_geometry(Vec3::new(4.0, 4.0, 4.0), Vec3::new(6.0, 6.0, 6.0));
        let wrapped = normalize_to_unit_sphere(node);

        let mut bounds = ComputeBounds::default();
        wrapped.accept(&mut bounds);

        assert!(bounds.centre().length() < 1e-5);
        assert!((bounds.radius() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_subgraph_wraps_with_identity() {
        let wrapped = normalize_to_unit_sphere(Node::group());
        match &*wrapped {
            Node::Transform(transform) => {
                assert_eq!(transform.matrix, Affine3A::IDENTITY);
                assert_eq!(transform.children.read().expect("children read lock").len(), 1);
            }
            _ => panic!("normalization should wrap with a transform"),
        }
    }
}
