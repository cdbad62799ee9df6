// Swapchain driver - the GPU calls a swapchain manager is allowed to make
//
// The manager's state machine is written against this trait; VulkanDriver is
// the real implementation bound to one window surface.

use ash::prelude::VkResult;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

use super::error::{DriverError, VkContext};
use super::DeviceContext;

/// Parameters for one swapchain generation
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub min_image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
}

/// Surface, swapchain, command and sync operations on one window.
pub trait SwapchainDriver {
    fn surface_capabilities(&mut self) -> VkResult<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(&mut self) -> VkResult<Vec<vk::SurfaceFormatKHR>>;
    fn present_modes(&mut self) -> VkResult<Vec<vk::PresentModeKHR>>;

    fn create_swapchain(
        &mut self,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> VkResult<vk::SwapchainKHR>;
    fn swapchain_images(&mut self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR);

    fn create_image_view(&mut self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&mut self, view: vk::ImageView);

    fn create_command_pool(&mut self) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&mut self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &mut self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&mut self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);

    /// Reset `buffer` and begin a one-time-submit recording
    fn begin_command_buffer(&mut self, buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&mut self, buffer: vk::CommandBuffer) -> VkResult<()>;

    fn create_semaphore(&mut self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore);
    fn create_fence(&mut self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&mut self, fence: vk::Fence);
    fn wait_fence(&mut self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()>;

    fn acquire_next_image(
        &mut self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;

    /// Submit `buffer` to the graphics queue
    fn submit(
        &mut self,
        buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()>;

    /// Present `image_index`; `Ok(true)` means suboptimal
    fn present(
        &mut self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool>;

    fn wait_idle(&mut self) -> VkResult<()>;

    /// Release the window surface. Called last during teardown.
    fn destroy_surface(&mut self);
}

/// `SwapchainDriver` over ash for a real window surface
pub struct VulkanDriver {
    device: Arc<DeviceContext>,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    wait_stages: [vk::PipelineStageFlags; 1],
}

impl VulkanDriver {
    /// Create the window surface and check the graphics queue can present to it.
    pub fn new<W>(device: Arc<DeviceContext>, window: &W) -> Result<Self, DriverError>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let surface_loader = ash::khr::surface::Instance::new(device.entry(), device.instance());
        let swapchain_loader = ash::khr::swapchain::Device::new(device.instance(), device.device());

        let surface = unsafe {
            ash_window::create_surface(
                device.entry(),
                device.instance(),
                window.display_handle()?.as_raw(),
                window.window_handle()?.as_raw(),
                None,
            )
        }
        .vk_context::<DriverError>("vkCreateSurfaceKHR")?;

        let family = device.graphics_queue_family();
        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(device.physical_device(), family, surface)
        };

        match supported {
            Ok(true) => {}
            Ok(false) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(DriverError::PresentationUnsupported(family));
            }
            Err(result) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(DriverError::Vulkan {
                    op: "vkGetPhysicalDeviceSurfaceSupportKHR",
                    result,
                });
            }
        }

        log::debug!("Created window surface {:?}", surface);

        Ok(Self {
            device,
            surface_loader,
            swapchain_loader,
            surface,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
        })
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }
}

impl SwapchainDriver for VulkanDriver {
    fn surface_capabilities(&mut self) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.device.physical_device(), self.surface)
        }
    }

    fn surface_formats(&mut self) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.device.physical_device(), self.surface)
        }
    }

    fn present_modes(&mut self) -> VkResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.device.physical_device(), self.surface)
        }
    }

    fn create_swapchain(
        &mut self,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> VkResult<vk::SwapchainKHR> {
        let queue_families = [self.device.graphics_queue_family()];

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.surface_format.format)
            .image_color_space(desc.surface_format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(desc.transform)
            .composite_alpha(desc.composite_alpha)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
    }

    fn swapchain_images(&mut self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn create_image_view(&mut self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { self.device.device().create_image_view(&create_info, None) }
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        unsafe { self.device.device().destroy_image_view(view, None) }
    }

    fn create_command_pool(&mut self) -> VkResult<vk::CommandPool> {
        // RESET: per-image buffers are re-recorded every frame
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.device.graphics_queue_family())
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        unsafe { self.device.device().create_command_pool(&pool_info, None) }
    }

    fn destroy_command_pool(&mut self, pool: vk::CommandPool) {
        unsafe { self.device.device().destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffers(
        &mut self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device().allocate_command_buffers(&alloc_info) }
    }

    fn free_command_buffers(&mut self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            unsafe { self.device.device().free_command_buffers(pool, buffers) }
        }
    }

    fn begin_command_buffer(&mut self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .device()
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())?;
            self.device.device().begin_command_buffer(buffer, &begin_info)
        }
    }

    fn end_command_buffer(&mut self, buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.device().end_command_buffer(buffer) }
    }

    fn create_semaphore(&mut self) -> VkResult<vk::Semaphore> {
        unsafe {
            self.device
                .device()
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        unsafe { self.device.device().destroy_semaphore(semaphore, None) }
    }

    fn create_fence(&mut self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        unsafe {
            self.device
                .device()
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        unsafe { self.device.device().destroy_fence(fence, None) }
    }

    fn wait_fence(&mut self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        unsafe { self.device.device().wait_for_fences(&[fence], true, timeout) }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.device().reset_fences(&[fence]) }
    }

    fn acquire_next_image(
        &mut self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, signal, vk::Fence::null())
        }
    }

    fn submit(
        &mut self,
        buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let wait_semaphores = [wait];
        let signal_semaphores = [signal];
        let command_buffers = [buffer];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device()
                .queue_submit(self.device.graphics_queue(), &[submit_info], fence)
        }
    }

    fn present(
        &mut self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            self.swapchain_loader
                .queue_present(self.device.graphics_queue(), &present_info)
        }
    }

    fn wait_idle(&mut self) -> VkResult<()> {
        self.device.wait_idle()
    }

    fn destroy_surface(&mut self) {
        if self.surface != vk::SurfaceKHR::null() {
            unsafe { self.surface_loader.destroy_surface(self.surface, None) };
            self.surface = vk::SurfaceKHR::null();
        }
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        self.destroy_surface();
    }
}
