use std::sync::Arc;

use anyhow::bail;
use glam::{Vec2, Vec3, Vec4};

use crate::io::loader::{LoadOptions, NodeLoader};
use crate::rendering::types::{AlbedoType, Material, Mesh, Texture};
use crate::scene::node::{Node, NodeRef};

/// Loader for the demo driver: procedural stand-ins instead of real model
/// files, so the pipeline can be exercised without any assets on disk.
///
/// Recognized paths: `quad`, `cube`, `underlay` (bin -3), `overlay` (bin 5)
/// and `paged:<path>` which wraps any of the former in a paged node.
pub struct PrimitiveLoader;

impl NodeLoader for PrimitiveLoader {
    fn load(&self, path: &str, options: &Arc<LoadOptions>) -> Result<NodeRef, anyhow::Error> {
        if let Some(inner) = path.strip_prefix("paged:") {
            // coarse stand-in stays resident, the full page comes in via the pager
            let coarse = Node::geometry(quad_mesh(), flat_material(1), None, None);
            return Ok(Node::paged_lod(inner.to_owned(), Some(coarse), options.clone()));
        }

        match path {
            "quad" => Ok(Node::geometry(quad_mesh(), flat_material(1), None, None)),
            "cube" => Ok(Node::geometry(
                cube_mesh(),
                Material {
                    slot: 2,
                    albedo: AlbedoType::Textured,
                },
                Some(checker_texture(8, 8)),
                None,
            )),
            "underlay" => Ok(Node::geometry(quad_mesh(), flat_material(1), None, Some(-3))),
            "overlay" => Ok(Node::geometry(quad_mesh(), flat_material(3), None, Some(5))),
            other => bail!("No loader able to handle {}", other),
        }
    }
}

fn flat_material(slot: u32) -> Material {
    Material {
        slot,
        albedo: AlbedoType::Value(Vec4::new(0.8, 0.8, 0.8, 1.0)),
    }
}

pub fn quad_mesh() -> Mesh {
    Mesh {
        positions: vec![
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
        ],
        normals: vec![Vec3::Z; 4],
        texcoords: vec![Vec2::ZERO, Vec2::X, Vec2::ONE, Vec2::Y],
        indices: vec![0, 1, 2, 2, 3, 0],
    }
}

pub fn cube_mesh() -> Mesh {
    let positions: Vec<Vec3> = [
        (-1.0, -1.0, -1.0),
        (1.0, -1.0, -1.0),
        (1.0, 1.0, -1.0),
        (-1.0, 1.0, -1.0),
        (-1.0, -1.0, 1.0),
        (1.0, -1.0, 1.0),
        (1.0, 1.0, 1.0),
        (-1.0, 1.0, 1.0),
    ]
    .into_iter()
    .map(|(x, y, z)| Vec3::new(x, y, z))
    .collect();

    let normals = positions.iter().map(|position| position.normalize()).collect();
    let texcoords = positions.iter().map(|position| Vec2::new(position.x, position.y)).collect();

    Mesh {
        positions,
        normals,
        texcoords,
        indices: vec![
            0, 1, 2, 2, 3, 0, // back
            4, 6, 5, 6, 4, 7, // front
            0, 4, 5, 5, 1, 0, // bottom
            2, 6, 7, 7, 3, 2, // top
            0, 3, 7, 7, 4, 0, // left
            1, 5, 6, 6, 2, 1, // right
        ],
    }
}

pub fn checker_texture(width: u32, height: u32) -> Texture {
    let mut texels = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let value = if (x + y) % 2 == 0 { 0xFF } else { 0x20 };
            texels.extend_from_slice(&[value, value, value, 0xFF]);
        }
    }
    Texture { width, height, texels }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::PrimitiveLoader;
    use crate::io::loader::{LoadOptions, NodeLoader};
    use crate::scene::node::Node;

    fn options() -> Arc<LoadOptions> {
        Arc::new(LoadOptions {
            loader: Arc::new(PrimitiveLoader),
            shared: None,
        })
    }

    #[test]
    fn paged_paths_wrap_the_inner_primitive() {
        let options = options();
        let node = PrimitiveLoader.load("paged:cube", &options).expect("paged load");

        match &*node {
            Node::PagedLod(lod) => {
                assert_eq!(lod.path, "cube");
                assert!(lod.coarse.is_some());
                assert!(!lod.is_resident());
            }
            _ => panic!("expected a paged node"),
        }
    }

    #[test]
    fn unknown_paths_fail() {
        let options = options();
        assert!(PrimitiveLoader.load("teapot.obj", &options).is_err());
    }
}
