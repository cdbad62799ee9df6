// Swapchain - Window presentation
//
// Owns the surface (through its driver), the swapchain, the command pool and
// one {image, view, command buffer} bundle per swapchain image. Per-image
// resources are built and torn down as a unit; a resize rebuilds everything.

use ash::vk;

use super::driver::{SwapchainDesc, SwapchainDriver};
use super::error::{SwapchainError, VkContext};
use super::sync::{FrameSlots, FrameSync};

/// Buffered image count we ask for before clamping to the surface limits
pub const PREFERRED_IMAGE_COUNT: u32 = 3;

/// Surface formats in order of preference
pub const PREFERRED_FORMATS: [vk::Format; 5] = [
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::A2B10G10R10_UNORM_PACK32,
    vk::Format::A2R10G10B10_UNORM_PACK32,
    vk::Format::R16G16B16A16_SFLOAT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Ready,
    Destroyed,
}

/// Result of surface format selection
#[derive(Debug, Clone, Copy)]
pub struct FormatChoice {
    pub surface_format: vk::SurfaceFormatKHR,
    /// None of the preferred formats was offered; rendering may look wrong
    pub degraded: bool,
}

/// Pick the first preferred format the surface offers, else the surface's first format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<FormatChoice> {
    PREFERRED_FORMATS
        .iter()
        .find_map(|&preferred| formats.iter().find(|f| f.format == preferred))
        .map(|&surface_format| FormatChoice {
            surface_format,
            degraded: false,
        })
        .or_else(|| {
            formats.first().map(|&surface_format| FormatChoice {
                surface_format,
                degraded: true,
            })
        })
}

/// Clamp the preferred image count into the surface's range.
///
/// `max_image_count == 0` means the surface has no upper limit.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = PREFERRED_IMAGE_COUNT.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

pub fn choose_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

/// Use `preferred` when the surface supports it; FIFO is always available.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Current surface extent, or the drawable size clamped when the surface
/// lets the swapchain decide (`current_extent.width == u32::MAX`).
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, drawable: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    let clamp = |value: u32, min: u32, max: u32| value.max(min).min(max.max(min));
    vk::Extent2D {
        width: clamp(
            drawable.width,
            caps.min_image_extent.width,
            caps.max_image_extent.width,
        ),
        height: clamp(
            drawable.height,
            caps.min_image_extent.height,
            caps.max_image_extent.height,
        ),
    }
}

/// GPU objects bound to one swapchain image index
#[derive(Debug, Clone, Copy)]
pub struct PerImageResource {
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    pub command_buffer: vk::CommandBuffer,
    pub generation: u64,
}

/// Swapchain knobs the host may set
#[derive(Debug, Clone, Copy)]
pub struct SwapchainSettings {
    pub present_mode: vk::PresentModeKHR,
    pub frames_in_flight: usize,
}

impl Default for SwapchainSettings {
    fn default() -> Self {
        Self {
            present_mode: vk::PresentModeKHR::FIFO,
            frames_in_flight: 2,
        }
    }
}

/// A frame between `begin_frame` and `end_frame`.
///
/// The command buffer is already begun. Every `Frame` must be handed back to
/// `end_frame` or `abandon_frame`. A dropped frame keeps `begin_frame`
/// returning `FrameInProgress` until the next rebuild recycles its slot.
#[derive(Debug)]
pub struct Frame {
    pub image_index: u32,
    pub command_buffer: vk::CommandBuffer,
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    /// Acquire reported the swapchain as suboptimal
    pub suboptimal: bool,
    slot: usize,
    generation: u64,
}

#[derive(Debug)]
pub enum FrameStatus {
    Ready(Frame),
    /// Call `recreate()` and retry the frame
    OutOfDate,
    /// Nothing became available before the timeout; retry later
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Map a raw acquire result onto success / recoverable / fatal.
pub fn classify_acquire(
    result: ash::prelude::VkResult<(u32, bool)>,
) -> Result<AcquireStatus, SwapchainError> {
    match result {
        Ok((image_index, suboptimal)) => Ok(AcquireStatus::Acquired {
            image_index,
            suboptimal,
        }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireStatus::OutOfDate),
        Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Ok(AcquireStatus::Timeout),
        Err(e) => Err(SwapchainError::vulkan("vkAcquireNextImageKHR", e)),
    }
}

/// Map a raw present result onto success / recoverable / fatal.
pub fn classify_present(result: ash::prelude::VkResult<bool>) -> Result<PresentStatus, SwapchainError> {
    match result {
        Ok(false) => Ok(PresentStatus::Presented),
        Ok(true) => Ok(PresentStatus::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
        Err(e) => Err(SwapchainError::vulkan("vkQueuePresentKHR", e)),
    }
}

/// Per-window swapchain and its per-image resources
pub struct SwapchainManager<D: SwapchainDriver> {
    driver: D,
    settings: SwapchainSettings,
    state: SwapchainState,

    drawable: vk::Extent2D,
    stale: bool,

    command_pool: vk::CommandPool,
    swapchain: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    format_degraded: bool,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    generation: u64,

    resources: Vec<PerImageResource>,
    /// Fence of the submission that last used each image (null = none)
    image_fences: Vec<vk::Fence>,
    slots: FrameSlots,
    /// Slot of the frame handed out by `begin_frame` and not yet returned
    open_frame: Option<usize>,
}

impl<D: SwapchainDriver> SwapchainManager<D> {
    /// `drawable` is the window's current size in pixels.
    pub fn new(driver: D, settings: SwapchainSettings, drawable: vk::Extent2D) -> Self {
        Self {
            driver,
            settings,
            state: SwapchainState::Uninitialized,
            drawable,
            stale: false,
            command_pool: vk::CommandPool::null(),
            swapchain: vk::SwapchainKHR::null(),
            surface_format: vk::SurfaceFormatKHR::default(),
            format_degraded: false,
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            generation: 0,
            resources: Vec::new(),
            image_fences: Vec::new(),
            slots: FrameSlots::default(),
            open_frame: None,
        }
    }

    /// Create the command pool, frame slots, swapchain and per-image resources.
    pub fn initialize(&mut self) -> Result<(), SwapchainError> {
        self.expect_state(SwapchainState::Uninitialized)?;

        self.command_pool = self
            .driver
            .create_command_pool()
            .vk_context::<SwapchainError>("vkCreateCommandPool")?;
        self.state = SwapchainState::Ready;

        self.slots = FrameSlots::new(&mut self.driver, self.settings.frames_in_flight)
            .vk_context::<SwapchainError>("vkCreateSemaphore/vkCreateFence")?;

        if !self.build()? {
            log::info!("Window has no drawable area, swapchain creation deferred");
        }
        Ok(())
    }

    /// Tear down and rebuild the swapchain against the current surface.
    ///
    /// Returns `Ok(false)` without touching anything when the surface has a
    /// zero-sized extent (minimized window).
    pub fn recreate(&mut self) -> Result<bool, SwapchainError> {
        self.expect_state(SwapchainState::Ready)?;

        self.driver
            .wait_idle()
            .vk_context::<SwapchainError>("vkDeviceWaitIdle")?;

        let rebuilt = self.build()?;
        if rebuilt {
            self.stale = false;
        }
        Ok(rebuilt)
    }

    /// Record a new drawable size; the swapchain is stale until recreated.
    pub fn notify_resized(&mut self, width: u32, height: u32) {
        log::debug!("Drawable resized to {}x{}", width, height);
        self.drawable = vk::Extent2D { width, height };
        self.stale = true;
    }

    /// Stale, or Ready without usable per-image resources (deferred or failed build).
    pub fn needs_recreate(&self) -> bool {
        self.stale || (self.state == SwapchainState::Ready && self.resources.is_empty())
    }

    /// Replace the present-mode preference; applied on the next recreate.
    pub fn set_present_mode(&mut self, present_mode: vk::PresentModeKHR) {
        if self.settings.present_mode != present_mode {
            self.settings.present_mode = present_mode;
            self.stale = true;
        }
    }

    /// Build a swapchain generation. Returns false if the extent is zero.
    fn build(&mut self) -> Result<bool, SwapchainError> {
        let caps = self
            .driver
            .surface_capabilities()
            .vk_context::<SwapchainError>("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;

        let extent = choose_extent(&caps, self.drawable);
        if extent.width == 0 || extent.height == 0 {
            return Ok(false);
        }

        let formats = self
            .driver
            .surface_formats()
            .vk_context::<SwapchainError>("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        let choice = choose_surface_format(&formats).ok_or(SwapchainError::NoSurfaceFormat)?;
        if choice.degraded {
            log::warn!(
                "Can't find a preferred surface format, falling back to {:?}. Rendering may be incorrect.",
                choice.surface_format.format
            );
        }

        let modes = self
            .driver
            .present_modes()
            .vk_context::<SwapchainError>("vkGetPhysicalDeviceSurfacePresentModesKHR")?;
        let present_mode = choose_present_mode(&modes, self.settings.present_mode);
        if present_mode != self.settings.present_mode {
            log::warn!(
                "Present mode {:?} unsupported, using {:?}",
                self.settings.present_mode,
                present_mode
            );
        }

        let desc = SwapchainDesc {
            min_image_count: choose_image_count(&caps),
            surface_format: choice.surface_format,
            extent,
            transform: choose_transform(&caps),
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
        };

        // Old generation goes away as a unit before the new one is populated.
        // An open frame's command buffer dies with it, so its slot is rebuilt.
        if let Some(slot) = self.open_frame.take() {
            self.recycle_slot(slot)?;
        }
        self.generation += 1;
        self.release_resources();
        let old_swapchain = std::mem::replace(&mut self.swapchain, vk::SwapchainKHR::null());

        let created = self.driver.create_swapchain(&desc, old_swapchain);
        if old_swapchain != vk::SwapchainKHR::null() {
            self.driver.destroy_swapchain(old_swapchain);
        }
        let swapchain = created.vk_context::<SwapchainError>("vkCreateSwapchainKHR")?;
        self.swapchain = swapchain;

        self.resources = self.create_resources(swapchain, desc.surface_format.format)?;
        self.image_fences = vec![vk::Fence::null(); self.resources.len()];

        self.surface_format = desc.surface_format;
        self.format_degraded = choice.degraded;
        self.extent = extent;
        self.present_mode = present_mode;

        log::info!(
            "Created swapchain generation {}: {}x{}, {} images, {:?}, {:?}",
            self.generation,
            extent.width,
            extent.height,
            self.resources.len(),
            desc.surface_format.format,
            present_mode
        );

        Ok(true)
    }

    /// One view and one command buffer per swapchain image; all or nothing.
    fn create_resources(
        &mut self,
        swapchain: vk::SwapchainKHR,
        format: vk::Format,
    ) -> Result<Vec<PerImageResource>, SwapchainError> {
        let images = self
            .driver
            .swapchain_images(swapchain)
            .vk_context::<SwapchainError>("vkGetSwapchainImagesKHR")?;

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            match self.driver.create_image_view(image, format) {
                Ok(view) => views.push(view),
                Err(e) => {
                    for view in views {
                        self.driver.destroy_image_view(view);
                    }
                    return Err(SwapchainError::vulkan("vkCreateImageView", e));
                }
            }
        }

        let command_buffers = match self
            .driver
            .allocate_command_buffers(self.command_pool, images.len() as u32)
        {
            Ok(buffers) => buffers,
            Err(e) => {
                for view in views {
                    self.driver.destroy_image_view(view);
                }
                return Err(SwapchainError::vulkan("vkAllocateCommandBuffers", e));
            }
        };

        Ok(images
            .into_iter()
            .zip(views)
            .zip(command_buffers)
            .map(|((image, image_view), command_buffer)| PerImageResource {
                image,
                image_view,
                command_buffer,
                generation: self.generation,
            })
            .collect())
    }

    /// Free command buffers and views. Images belong to the swapchain.
    fn release_resources(&mut self) {
        if self.resources.is_empty() {
            return;
        }

        let buffers: Vec<vk::CommandBuffer> =
            self.resources.iter().map(|r| r.command_buffer).collect();
        self.driver.free_command_buffers(self.command_pool, &buffers);

        for resource in self.resources.drain(..) {
            self.driver.destroy_image_view(resource.image_view);
        }
        self.image_fences.clear();
    }

    /// Acquire the next image and begin recording its command buffer.
    pub fn begin_frame(&mut self, timeout: u64) -> Result<FrameStatus, SwapchainError> {
        self.expect_state(SwapchainState::Ready)?;

        if self.open_frame.is_some() {
            return Err(SwapchainError::FrameInProgress);
        }
        if self.swapchain == vk::SwapchainKHR::null() || self.resources.is_empty() {
            return Ok(FrameStatus::OutOfDate);
        }

        let slot = self.slots.current_index();
        let sync = *self.current_sync()?;

        // The slot's previous submission must retire before its semaphores are reused
        match self.driver.wait_fence(sync.in_flight_fence, timeout) {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => return Ok(FrameStatus::Timeout),
            Err(e) => return Err(SwapchainError::vulkan("vkWaitForFences", e)),
        }

        let acquired = classify_acquire(self.driver.acquire_next_image(
            self.swapchain,
            timeout,
            sync.image_available,
        ))?;

        let (image_index, suboptimal) = match acquired {
            AcquireStatus::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireStatus::OutOfDate => {
                self.stale = true;
                return Ok(FrameStatus::OutOfDate);
            }
            AcquireStatus::Timeout => return Ok(FrameStatus::Timeout),
        };

        if suboptimal {
            self.stale = true;
        }

        // From here on "image available" is signalled; any failure must recycle the slot
        self.open_frame = Some(slot);
        let resource = match self.prepare_image(image_index as usize, &sync) {
            Ok(resource) => resource,
            Err(e) => {
                self.discard_open_frame();
                return Err(e);
            }
        };

        Ok(FrameStatus::Ready(Frame {
            image_index,
            command_buffer: resource.command_buffer,
            image: resource.image,
            image_view: resource.image_view,
            format: self.surface_format.format,
            extent: self.extent,
            suboptimal,
            slot,
            generation: self.generation,
        }))
    }

    /// Wait out the image's previous submission, begin its command buffer,
    /// then reset the slot fence for the coming submit.
    fn prepare_image(
        &mut self,
        index: usize,
        sync: &FrameSync,
    ) -> Result<PerImageResource, SwapchainError> {
        let resource = *self.resources.get(index).ok_or(SwapchainError::Vulkan {
            op: "vkAcquireNextImageKHR",
            result: vk::Result::ERROR_UNKNOWN,
        })?;

        // Never re-record a command buffer the GPU may still be executing
        let previous = self.image_fences[index];
        if previous != vk::Fence::null() && previous != sync.in_flight_fence {
            self.driver
                .wait_fence(previous, u64::MAX)
                .vk_context::<SwapchainError>("vkWaitForFences")?;
        }
        self.image_fences[index] = sync.in_flight_fence;

        self.driver
            .begin_command_buffer(resource.command_buffer)
            .vk_context::<SwapchainError>("vkBeginCommandBuffer")?;
        self.driver
            .reset_fence(sync.in_flight_fence)
            .vk_context::<SwapchainError>("vkResetFences")?;

        Ok(resource)
    }

    /// Finish recording, submit, and present the frame's image.
    pub fn end_frame(&mut self, frame: Frame) -> Result<PresentStatus, SwapchainError> {
        let sync = self.claim_frame(&frame)?;

        let submitted = self
            .driver
            .end_command_buffer(frame.command_buffer)
            .vk_context::<SwapchainError>("vkEndCommandBuffer")
            .and_then(|()| {
                self.driver
                    .submit(
                        frame.command_buffer,
                        sync.image_available,
                        sync.render_finished,
                        sync.in_flight_fence,
                    )
                    .vk_context::<SwapchainError>("vkQueueSubmit")
            });
        if let Err(e) = submitted {
            self.discard_open_frame();
            return Err(e);
        }
        self.open_frame = None;

        let status = classify_present(self.driver.present(
            self.swapchain,
            frame.image_index,
            sync.render_finished,
        ))?;

        if status != PresentStatus::Presented {
            self.stale = true;
        }

        self.slots.advance();
        Ok(status)
    }

    /// Give a begun frame back without submitting or presenting it.
    ///
    /// The recording is dropped and the slot's sync objects are replaced. The
    /// acquired image stays unpresented, so the swapchain is marked stale and
    /// rebuilt before the next frame.
    pub fn abandon_frame(&mut self, frame: Frame) -> Result<(), SwapchainError> {
        match self.claim_frame(&frame) {
            Ok(_) => {}
            // The rebuild that made it stale already recycled the slot
            Err(SwapchainError::StaleFrame { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }

        log::debug!("Abandoning frame for image {}", frame.image_index);
        self.stale = true;
        self.open_frame = None;
        self.recycle_slot(frame.slot)
    }

    /// Check `frame` is the open frame of the current generation.
    fn claim_frame(&self, frame: &Frame) -> Result<FrameSync, SwapchainError> {
        self.expect_state(SwapchainState::Ready)?;

        if frame.generation != self.generation {
            return Err(SwapchainError::StaleFrame {
                frame: frame.generation,
                current: self.generation,
            });
        }
        if self.open_frame != Some(frame.slot) {
            return Err(SwapchainError::ForeignFrame);
        }
        self.slots
            .get(frame.slot)
            .copied()
            .ok_or(SwapchainError::ForeignFrame)
    }

    /// Recycle the open frame's slot after a failure, keeping the original error.
    fn discard_open_frame(&mut self) {
        if let Some(slot) = self.open_frame.take() {
            if let Err(e) = self.recycle_slot(slot) {
                log::warn!("Failed to recycle frame slot {}: {}", slot, e);
            }
        }
    }

    /// Replace a slot whose fence was reset or whose "image available"
    /// semaphore was signalled without a matching submit.
    fn recycle_slot(&mut self, slot: usize) -> Result<(), SwapchainError> {
        self.driver
            .wait_idle()
            .vk_context::<SwapchainError>("vkDeviceWaitIdle")?;

        let fresh = FrameSync::new(&mut self.driver)
            .vk_context::<SwapchainError>("vkCreateSemaphore/vkCreateFence")?;

        match self.slots.replace(slot, fresh) {
            Some(old) => {
                for fence in &mut self.image_fences {
                    if *fence == old.in_flight_fence {
                        *fence = vk::Fence::null();
                    }
                }
                old.destroy(&mut self.driver);
                log::debug!("Recycled frame slot {}", slot);
            }
            None => fresh.destroy(&mut self.driver),
        }
        Ok(())
    }

    /// Release swapchain, command pool and surface, in that order.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn destroy(&mut self) {
        if self.state == SwapchainState::Destroyed {
            return;
        }

        if let Err(e) = self.driver.wait_idle() {
            log::warn!("vkDeviceWaitIdle failed during swapchain teardown: {}", e);
        }

        self.release_resources();

        if self.swapchain != vk::SwapchainKHR::null() {
            self.driver.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }

        self.open_frame = None;
        self.slots.destroy(&mut self.driver);

        if self.command_pool != vk::CommandPool::null() {
            self.driver.destroy_command_pool(self.command_pool);
            self.command_pool = vk::CommandPool::null();
        }

        self.driver.destroy_surface();

        self.state = SwapchainState::Destroyed;
        log::debug!("Swapchain destroyed");
    }

    fn expect_state(&self, expected: SwapchainState) -> Result<(), SwapchainError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SwapchainError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn current_sync(&self) -> Result<&FrameSync, SwapchainError> {
        self.slots.current().ok_or(SwapchainError::InvalidState {
            expected: SwapchainState::Ready,
            actual: self.state,
        })
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn image_count(&self) -> u32 {
        self.resources.len() as u32
    }

    pub fn resources(&self) -> &[PerImageResource] {
        &self.resources
    }

    pub fn image_view(&self, index: u32) -> Option<vk::ImageView> {
        self.resources.get(index as usize).map(|r| r.image_view)
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.surface_format.color_space
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// True when no preferred surface format was available
    pub fn surface_format_degraded(&self) -> bool {
        self.format_degraded
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    #[cfg(test)]
    pub(crate) fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

impl<D: SwapchainDriver> Drop for SwapchainManager<D> {
    fn drop(&mut self) {
        self.destroy();
    }
}
