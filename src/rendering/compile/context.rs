use std::sync::Arc;

use anyhow::anyhow;

use crate::rendering::device::{
    CopyCommand, DescriptorKind, DescriptorPoolHandle, DescriptorPoolSizes, GpuDevice, SubmissionHandle,
};
use crate::rendering::resources::{ResourceHints, ResourceRequirements};
use crate::scene::node::{Geometry, Node};
use crate::scene::visitor::NodeVisitor;
use crate::viewer::View;

/// A render target a compile context feeds: a device-only sink, or one bound
/// to a view whose bin usage needs to be reported back to the merge step.
#[derive(Clone)]
pub struct RenderSink {
    pub view: Option<Arc<View>>,
}

impl RenderSink {
    pub fn for_view(view: Arc<View>) -> Self {
        Self { view: Some(view) }
    }

    pub fn for_device() -> Self {
        Self { view: None }
    }
}

/// Reusable per-checkout unit of device-resource allocation and command
/// recording state. Held by at most one thread at a time; the pool in
/// [`crate::rendering::compile::manager::CompileManager`] enforces that.
pub struct CompileContext {
    device: Arc<dyn GpuDevice>,
    /// Remaining capacity of the active descriptor pool.
    budget: DescriptorPoolSizes,
    /// Pools only ever grow; descriptor sets handed out from earlier pools
    /// stay valid, so old pools are retained.
    pools: Vec<DescriptorPoolHandle>,
    commands: Vec<CopyCommand>,
    pending: Option<SubmissionHandle>,
    sinks: Vec<RenderSink>,
}

impl CompileContext {
    pub fn new(device: Arc<dyn GpuDevice>, hints: &ResourceHints) -> Result<Self, anyhow::Error> {
        let mut context = Self {
            device,
            budget: DescriptorPoolSizes::default(),
            pools: Vec::new(),
            commands: Vec::new(),
            pending: None,
            sinks: Vec::new(),
        };

        let sizes = hints.pool_sizes();
        if sizes.sets > 0 {
            context.grow(&sizes)?;
        }
        Ok(context)
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn add_sink(&mut self, sink: RenderSink) {
        self.sinks.push(sink);
    }

    pub fn sinks(&self) -> &[RenderSink] {
        &self.sinks
    }

    fn grow(&mut self, sizes: &DescriptorPoolSizes) -> Result<(), anyhow::Error> {
        let pool = self.device.create_descriptor_pool(sizes)?;
        self.pools.push(pool);
        self.budget = sizes.clone();
        Ok(())
    }

    fn active_pool(&self) -> Option<DescriptorPoolHandle> {
        self.pools.last().copied()
    }

    /// Grows descriptor capacity so the subsequent compile traversal never
    /// allocates mid-flight. Upward-only; a context that already covers the
    /// requirement is left untouched. Failure is recoverable, the previous
    /// capacity stays intact.
    pub fn reserve(&mut self, requirements: &ResourceRequirements) -> Result<(), anyhow::Error> {
        let needed = &requirements.descriptors;
        if needed.sets == 0 || self.budget.covers(needed) {
            return Ok(());
        }
        // Allocations never span pools, so the fresh pool covers the whole
        // requirement on its own.
        self.grow(&needed.max(&self.budget))
    }

    /// Walks a detached subgraph, creating device resources for every
    /// resource-bearing node and recording the upload commands.
    pub fn compile_subgraph(&mut self, node: &Node) -> Result<(), anyhow::Error> {
        let mut traversal = CompileTraversal {
            context: self,
            error: None,
        };
        node.accept(&mut traversal);
        match traversal.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn upload_geometry(&mut self, geometry: &Geometry) -> Result<(), anyhow::Error> {
        // Subgraphs shared between concurrent loads may race here; the
        // write-lock re-check makes the second uploader a no-op.
        if geometry.mesh.read().expect("mesh read lock").handle.is_none() {
            let mut mesh = geometry.mesh.write().expect("mesh write lock");
            if mesh.handle.is_none() {
                let bytes = mesh.data.byte_size();
                let buffer = self.device.create_buffer(bytes)?;
                self.commands.push(CopyCommand::UploadBuffer { target: buffer, bytes });
                mesh.handle = Some(buffer);
            }
        }

        if let Some(texture) = &geometry.texture {
            if texture.read().expect("texture read lock").handle.is_none() {
                let mut texture = texture.write().expect("texture write lock");
                if texture.handle.is_none() {
                    let bytes = texture.data.texels.len();
                    let image = self.device.create_image(texture.data.width, texture.data.height, bytes)?;
                    self.commands.push(CopyCommand::UploadImage { target: image, bytes });
                    texture.handle = Some(image);
                }
            }
        }

        if geometry.material.read().expect("material read lock").handle.is_none() {
            let mut material = geometry.material.write().expect("material write lock");
            if material.handle.is_none() {
                let pool = self
                    .active_pool()
                    .ok_or_else(|| anyhow!("no descriptor pool reserved before compilation"))?;
                let kind = if geometry.texture.is_some() {
                    DescriptorKind::CombinedImageSampler
                } else {
                    DescriptorKind::UniformBuffer
                };
                let set = self.device.allocate_descriptor_set(pool, kind)?;

                self.budget.sets = self.budget.sets.saturating_sub(1);
                match kind {
                    DescriptorKind::UniformBuffer => {
                        self.budget.uniform_buffers = self.budget.uniform_buffers.saturating_sub(1)
                    }
                    DescriptorKind::CombinedImageSampler => {
                        self.budget.combined_image_samplers = self.budget.combined_image_samplers.saturating_sub(1)
                    }
                }
                material.handle = Some(set);
            }
        }

        Ok(())
    }

    /// Finalizes the recorded commands and submits them; does not block.
    pub fn record(&mut self) -> Result<(), anyhow::Error> {
        if self.commands.is_empty() {
            return Ok(());
        }
        let commands = std::mem::take(&mut self.commands);
        self.pending = Some(self.device.submit(commands)?);
        Ok(())
    }

    /// Blocks until all submitted device work for this context completed.
    /// This is the designed suspension point; callers must not hold any lock
    /// other threads need while waiting.
    pub fn wait_for_completion(&mut self) -> Result<(), anyhow::Error> {
        if let Some(submission) = self.pending.take() {
            self.device.wait(submission)?;
        }
        Ok(())
    }

    /// Drops whatever an abandoned compile attempt left behind so the context
    /// can be checked back in clean.
    pub fn reset(&mut self) {
        self.commands.clear();
        self.pending = None;
    }
}

struct CompileTraversal<'a> {
    context: &'a mut CompileContext,
    error: Option<anyhow::Error>,
}

impl NodeVisitor for CompileTraversal<'_> {
    fn visit_geometry(&mut self, geometry: &Geometry) {
        if self.error.is_some() {
            return;
        }
        if let Err(error) = self.context.upload_geometry(geometry) {
            self.error = Some(error);
        }
    }
}
