use std::fmt::{Debug, Formatter};

use glam::{Vec2, Vec3, Vec4};

use crate::rendering::device::{BufferHandle, DescriptorSetHandle, ImageHandle};

#[derive(Clone)]
pub struct Mesh {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub texcoords: Vec<Vec2>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Size of the staging upload for this mesh, vertex and index data combined.
    pub fn byte_size(&self) -> usize {
        self.positions.len() * size_of::<Vec3>()
            + self.normals.len() * size_of::<Vec3>()
            + self.texcoords.len() * size_of::<Vec2>()
            + self.indices.len() * size_of::<u32>()
    }
}

impl Debug for Mesh {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ positions: [{}], ", self.positions.len())?;
        write!(f, "normals: [{}], ", self.normals.len())?;
        write!(f, "texcoords: [{}], ", self.texcoords.len())?;
        write!(f, "indices: [{}] }}", self.indices.len())
    }
}

#[derive(Debug, Clone)]
pub enum AlbedoType {
    Value(Vec4),
    Textured,
}

#[derive(Debug, Clone)]
pub struct Material {
    /// Descriptor slot this material binds to; the highest slot in a subgraph
    /// has to be reconciled into the shared render state before the subgraph
    /// becomes visible.
    pub slot: u32,
    pub albedo: AlbedoType,
}

#[derive(Clone)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub texels: Vec<u8>,
}

impl Debug for Texture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ {}x{}, texels: [{}] }}", self.width, self.height, self.texels.len())
    }
}

/// CPU-side data paired with the device handle the compile traversal fills in.
#[derive(Debug)]
pub struct DeviceObject<T, H> {
    pub data: T,
    pub handle: Option<H>,
}

impl<T, H> DeviceObject<T, H> {
    pub fn new(data: T) -> Self {
        Self { data, handle: None }
    }
}

pub type DeviceMesh = DeviceObject<Mesh, BufferHandle>;
pub type DeviceMaterial = DeviceObject<Material, DescriptorSetHandle>;
pub type DeviceTexture = DeviceObject<Texture, ImageHandle>;
