use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::rendering::device::DescriptorPoolSizes;
use crate::scene::node::{Geometry, PagedLod};
use crate::scene::visitor::NodeVisitor;

/// De-duplicated render bin indices referenced by one subgraph, in ascending
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinDetails {
    pub indices: BTreeSet<i32>,
}

/// Aggregate resource needs of a subgraph, computed before any device resource
/// is allocated so the compile context can reserve capacity up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequirements {
    pub max_slot: u32,
    pub contains_paged_lod: bool,
    pub descriptors: DescriptorPoolSizes,
    pub bin_stack: Vec<BinDetails>,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            max_slot: 0,
            contains_paged_lod: false,
            descriptors: DescriptorPoolSizes::default(),
            bin_stack: vec![BinDetails::default()],
        }
    }
}

impl ResourceRequirements {
    pub fn bin_details(&self) -> &BinDetails {
        self.bin_stack.last().expect("bin stack is never empty")
    }
}

/// Read-only requirement collection pass. Side-effect free and idempotent, so
/// a failed compile attempt can rerun it safely.
#[derive(Default)]
pub struct CollectRequirements {
    pub requirements: ResourceRequirements,
}

impl NodeVisitor for CollectRequirements {
    fn visit_geometry(&mut self, geometry: &Geometry) {
        let requirements = &mut self.requirements;

        let material = geometry.material.read().expect("material read lock");
        requirements.max_slot = requirements.max_slot.max(material.data.slot);

        requirements.descriptors.sets += 1;
        if geometry.texture.is_some() {
            requirements.descriptors.combined_image_samplers += 1;
        } else {
            requirements.descriptors.uniform_buffers += 1;
        }

        if let Some(bin) = geometry.render_bin {
            requirements
                .bin_stack
                .last_mut()
                .expect("bin stack is never empty")
                .indices
                .insert(bin);
        }
    }

    fn visit_paged_lod(&mut self, _lod: &PagedLod) {
        self.requirements.contains_paged_lod = true;
    }
}

/// Minimum descriptor capacity to pre-size compile contexts with, so small
/// objects don't each end up creating their own descriptor pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceHints {
    pub num_descriptor_sets: u32,
    pub num_uniform_buffers: u32,
    pub num_combined_image_samplers: u32,
}

impl ResourceHints {
    pub fn from_file(path: &str) -> Result<Self, anyhow::Error> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn pool_sizes(&self) -> DescriptorPoolSizes {
        DescriptorPoolSizes {
            sets: self.num_descriptor_sets,
            uniform_buffers: self.num_uniform_buffers,
            combined_image_samplers: self.num_combined_image_samplers,
        }
    }
}
