// Screen pass - clears the swapchain image (plus a depth buffer) and leaves it
// ready for presentation.
//
// Framebuffers reference per-image views owned by the SwapchainManager, so
// they are rebuilt whenever the manager's generation moves.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use crate::backend::swapchain::{Frame, SwapchainManager};
use crate::backend::{DeviceContext, SwapchainDriver};

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// What `sync` has to rebuild to match the swapchain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPlan {
    Keep,
    /// Same format, new images or extent
    Targets,
    /// Color format changed, render pass must be recreated too
    All,
}

/// Compare the pass's last synced generation/format with the swapchain's.
pub fn plan_sync(
    synced: Option<(u64, vk::Format)>,
    generation: u64,
    format: vk::Format,
) -> SyncPlan {
    match synced {
        Some((_, synced_format)) if synced_format != format => SyncPlan::All,
        Some((synced_generation, _)) if synced_generation == generation => SyncPlan::Keep,
        _ => SyncPlan::Targets,
    }
}

pub fn clear_values(color: [f32; 4]) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

struct DepthTarget {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
}

pub struct ScreenPass {
    device: Arc<DeviceContext>,
    render_pass: vk::RenderPass,
    color_format: vk::Format,
    depth: Option<DepthTarget>,
    framebuffers: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
    /// Generation and format the targets were built for
    synced: Option<(u64, vk::Format)>,
}

impl ScreenPass {
    pub fn new(device: Arc<DeviceContext>, color_format: vk::Format) -> Result<Self> {
        let render_pass = create_render_pass(&device, color_format)?;

        Ok(Self {
            device,
            render_pass,
            color_format,
            depth: None,
            framebuffers: Vec::new(),
            extent: vk::Extent2D::default(),
            synced: None,
        })
    }

    /// Rebuild framebuffers (and the render pass on a format change) if the
    /// swapchain moved to a new generation since the last call.
    pub fn sync<D: SwapchainDriver>(&mut self, swapchain: &SwapchainManager<D>) -> Result<()> {
        let format = swapchain.format();
        let plan = plan_sync(self.synced, swapchain.generation(), format);
        if plan == SyncPlan::Keep || swapchain.resources().is_empty() {
            return Ok(());
        }

        self.destroy_targets();

        if plan == SyncPlan::All || format != self.color_format {
            unsafe {
                self.device
                    .device()
                    .destroy_render_pass(self.render_pass, None);
            }
            self.render_pass = vk::RenderPass::null();
            self.render_pass = create_render_pass(&self.device, format)?;
            self.color_format = format;
        }

        let extent = swapchain.extent();
        let depth = create_depth_target(&self.device, extent)?;
        let depth_view = depth.view;
        self.depth = Some(depth);

        for resource in swapchain.resources() {
            let attachments = [resource.image_view, depth_view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer = unsafe {
                self.device
                    .device()
                    .create_framebuffer(&framebuffer_info, None)
                    .context("Failed to create framebuffer")?
            };
            self.framebuffers.push(framebuffer);
        }

        self.extent = extent;
        self.synced = Some((swapchain.generation(), format));
        log::debug!(
            "Screen pass synced to swapchain generation {} ({} framebuffers)",
            swapchain.generation(),
            self.framebuffers.len()
        );
        Ok(())
    }

    /// Clear the frame's image to `clear_color` inside the render pass.
    pub fn record(&self, frame: &Frame, clear_color: [f32; 4]) -> Result<()> {
        let framebuffer = *self
            .framebuffers
            .get(frame.image_index as usize)
            .context("No framebuffer for swapchain image; call sync() first")?;

        if frame.extent != self.extent {
            anyhow::bail!(
                "Frame extent {}x{} does not match screen pass extent {}x{}",
                frame.extent.width,
                frame.extent.height,
                self.extent.width,
                self.extent.height
            );
        }

        let clears = clear_values(clear_color);
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            })
            .clear_values(&clears);

        let device = self.device.device();
        unsafe {
            device.cmd_begin_render_pass(
                frame.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
            device.cmd_end_render_pass(frame.command_buffer);
        }
        Ok(())
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    fn destroy_targets(&mut self) {
        let device = self.device.device();
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { device.destroy_framebuffer(framebuffer, None) };
        }

        if let Some(mut depth) = self.depth.take() {
            unsafe {
                device.destroy_image_view(depth.view, None);
                device.destroy_image(depth.image, None);
            }
            if let Some(allocation) = depth.allocation.take() {
                if let Err(e) = self.device.allocator().free(allocation) {
                    log::warn!("Failed to free depth buffer memory: {}", e);
                }
            }
        }
        self.synced = None;
    }

    /// Release framebuffers, depth buffer and render pass. Idempotent.
    pub fn destroy(&mut self) {
        self.destroy_targets();
        if self.render_pass != vk::RenderPass::null() {
            unsafe {
                self.device
                    .device()
                    .destroy_render_pass(self.render_pass, None);
            }
            self.render_pass = vk::RenderPass::null();
        }
    }
}

impl Drop for ScreenPass {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::warn!("vkDeviceWaitIdle failed before screen pass teardown: {}", e);
        }
        self.destroy();
    }
}

/// Color attachment in the swapchain format plus a depth attachment.
fn create_render_pass(device: &DeviceContext, format: vk::Format) -> Result<vk::RenderPass> {
    // Color attachment (the swapchain image)
    let color_attachment = vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let depth_attachment = vk::AttachmentDescription::default()
        .format(DEPTH_FORMAT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref)];

    // Wait for the acquire semaphore's stage before writing color/depth
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    let dependencies = [vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(stages)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )];

    let attachments = [color_attachment, depth_attachment];
    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = unsafe {
        device
            .device()
            .create_render_pass(&render_pass_info, None)
            .context("Failed to create render pass")?
    };
    Ok(render_pass)
}

fn create_depth_target(device: &DeviceContext, extent: vk::Extent2D) -> Result<DepthTarget> {
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(DEPTH_FORMAT)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let vk_device = device.device();
    let image = unsafe {
        vk_device
            .create_image(&image_info, None)
            .context("Failed to create depth image")?
    };

    let requirements = unsafe { vk_device.get_image_memory_requirements(image) };
    let allocation = device.allocator().allocate(&AllocationCreateDesc {
        name: "screen depth",
        requirements,
        location: MemoryLocation::GpuOnly,
        linear: false,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { vk_device.destroy_image(image, None) };
            return Err(e).context("Failed to allocate depth image memory");
        }
    };

    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(DEPTH_FORMAT)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::DEPTH,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let bound = unsafe { vk_device.bind_image_memory(image, allocation.memory(), allocation.offset()) };
    let view = bound.and_then(|()| unsafe { vk_device.create_image_view(&view_info, None) });
    match view {
        Ok(view) => Ok(DepthTarget {
            image,
            view,
            allocation: Some(allocation),
        }),
        Err(e) => {
            unsafe { vk_device.destroy_image(image, None) };
            if let Err(free_err) = device.allocator().free(allocation) {
                log::warn!("Failed to free depth buffer memory: {}", free_err);
            }
            Err(e).context("Failed to bind depth image memory or create its view")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sync_builds_targets() {
        assert_eq!(plan_sync(None, 1, vk::Format::B8G8R8A8_UNORM), SyncPlan::Targets);
    }

    #[test]
    fn test_same_generation_keeps_targets() {
        let synced = Some((3, vk::Format::B8G8R8A8_UNORM));
        assert_eq!(plan_sync(synced, 3, vk::Format::B8G8R8A8_UNORM), SyncPlan::Keep);
        assert_eq!(plan_sync(synced, 4, vk::Format::B8G8R8A8_UNORM), SyncPlan::Targets);
    }

    #[test]
    fn test_format_change_rebuilds_render_pass() {
        let synced = Some((3, vk::Format::B8G8R8A8_UNORM));
        assert_eq!(plan_sync(synced, 4, vk::Format::R8G8B8A8_UNORM), SyncPlan::All);
    }

    #[test]
    fn test_clear_values_color_then_depth() {
        let clears = clear_values([0.1, 0.2, 0.3, 1.0]);
        unsafe {
            assert_eq!(clears[0].color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(clears[1].depth_stencil.depth, 1.0);
            assert_eq!(clears[1].depth_stencil.stencil, 0);
        }
    }
}
