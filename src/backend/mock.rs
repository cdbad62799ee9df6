// Recording SwapchainDriver for tests: fabricated handles, scripted results.

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use std::collections::{HashMap, HashSet, VecDeque};

use super::driver::{SwapchainDesc, SwapchainDriver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateSwapchain { handle: u64, old: u64, min_image_count: u32 },
    DestroySwapchain(u64),
    CreateView(u64),
    DestroyView(u64),
    CreatePool(u64),
    DestroyPool(u64),
    AllocateBuffers(Vec<u64>),
    FreeBuffers(Vec<u64>),
    BeginBuffer(u64),
    EndBuffer(u64),
    CreateSemaphore(u64),
    DestroySemaphore(u64),
    CreateFence(u64),
    DestroyFence(u64),
    WaitFence(u64),
    ResetFence(u64),
    Acquire { semaphore: u64 },
    Submit { buffer: u64, wait: u64, signal: u64, fence: u64 },
    Present { image_index: u32, wait: u64 },
    WaitIdle,
    DestroySurface,
}

pub struct MockDriver {
    pub caps: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    /// Images handed out beyond the requested minimum
    pub extra_images: u32,
    /// Scripted acquire results; round-robin success once empty
    pub acquire_results: VecDeque<VkResult<(u32, bool)>>,
    pub present_results: VecDeque<VkResult<bool>>,
    /// Scripted fence waits, consumed before the signal state is consulted
    pub wait_fence_results: VecDeque<VkResult<()>>,
    pub begin_results: VecDeque<VkResult<()>>,
    pub fail_view_after: Option<usize>,
    pub calls: Vec<Call>,
    /// Handles created and not yet destroyed
    pub live: HashSet<u64>,
    pub surface_alive: bool,
    /// Fence handle -> signalled
    pub fences: HashMap<u64, bool>,
    /// Semaphores with a signal operation nobody has waited on yet
    pub signalled: HashSet<u64>,
    images: HashMap<u64, Vec<u64>>,
    views_created: usize,
    acquire_cursor: u32,
    next_handle: u64,
}

pub fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
    vk::SurfaceFormatKHR {
        format,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            caps: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 8,
                current_extent: vk::Extent2D {
                    width: 1280,
                    height: 720,
                },
                min_image_extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
                supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![
                surface_format(vk::Format::B8G8R8A8_SRGB),
                surface_format(vk::Format::B8G8R8A8_UNORM),
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            extra_images: 0,
            acquire_results: VecDeque::new(),
            present_results: VecDeque::new(),
            wait_fence_results: VecDeque::new(),
            begin_results: VecDeque::new(),
            fail_view_after: None,
            calls: Vec::new(),
            live: HashSet::new(),
            surface_alive: true,
            fences: HashMap::new(),
            signalled: HashSet::new(),
            images: HashMap::new(),
            views_created: 0,
            acquire_cursor: 0,
            // Start high so handles never collide with small test constants
            next_handle: 0x1000,
        }
    }

    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.live.insert(self.next_handle);
        self.next_handle
    }

    fn release(&mut self, raw: u64) {
        assert!(self.live.remove(&raw), "double destroy of handle {:#x}", raw);
    }

    fn assert_live(&self, raw: u64) {
        assert!(self.live.contains(&raw), "use of destroyed handle {:#x}", raw);
    }

    fn signal(&mut self, semaphore: u64) {
        assert!(
            self.signalled.insert(semaphore),
            "semaphore {:#x} signalled again before anything waited on it",
            semaphore
        );
    }

    fn consume(&mut self, semaphore: u64) {
        assert!(
            self.signalled.remove(&semaphore),
            "wait on semaphore {:#x} that has no pending signal",
            semaphore
        );
    }

    /// Position of the first call matching `pred`
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls.iter().position(pred)
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }
}

impl SwapchainDriver for MockDriver {
    fn surface_capabilities(&mut self) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        Ok(self.caps)
    }

    fn surface_formats(&mut self) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.formats.clone())
    }

    fn present_modes(&mut self) -> VkResult<Vec<vk::PresentModeKHR>> {
        Ok(self.present_modes.clone())
    }

    fn create_swapchain(
        &mut self,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> VkResult<vk::SwapchainKHR> {
        let handle = self.handle();
        let count = desc.min_image_count + self.extra_images;
        // Swapchain images are owned by the swapchain, not tracked as live
        let images = (0..count)
            .map(|_| {
                self.next_handle += 1;
                self.next_handle
            })
            .collect();
        self.images.insert(handle, images);
        self.acquire_cursor = 0;
        self.calls.push(Call::CreateSwapchain {
            handle,
            old: old_swapchain.as_raw(),
            min_image_count: desc.min_image_count,
        });
        Ok(vk::SwapchainKHR::from_raw(handle))
    }

    fn swapchain_images(&mut self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let images = self
            .images
            .get(&swapchain.as_raw())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        Ok(images.iter().map(|&raw| vk::Image::from_raw(raw)).collect())
    }

    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        self.release(swapchain.as_raw());
        self.images.remove(&swapchain.as_raw());
        self.calls.push(Call::DestroySwapchain(swapchain.as_raw()));
    }

    fn create_image_view(&mut self, _image: vk::Image, _format: vk::Format) -> VkResult<vk::ImageView> {
        if self.fail_view_after == Some(self.views_created) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        self.views_created += 1;
        let handle = self.handle();
        self.calls.push(Call::CreateView(handle));
        Ok(vk::ImageView::from_raw(handle))
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        self.release(view.as_raw());
        self.calls.push(Call::DestroyView(view.as_raw()));
    }

    fn create_command_pool(&mut self) -> VkResult<vk::CommandPool> {
        let handle = self.handle();
        self.calls.push(Call::CreatePool(handle));
        Ok(vk::CommandPool::from_raw(handle))
    }

    fn destroy_command_pool(&mut self, pool: vk::CommandPool) {
        self.release(pool.as_raw());
        self.calls.push(Call::DestroyPool(pool.as_raw()));
    }

    fn allocate_command_buffers(
        &mut self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let raw: Vec<u64> = (0..count).map(|_| self.handle()).collect();
        self.calls.push(Call::AllocateBuffers(raw.clone()));
        Ok(raw.into_iter().map(vk::CommandBuffer::from_raw).collect())
    }

    fn free_command_buffers(&mut self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let raw: Vec<u64> = buffers.iter().map(|b| b.as_raw()).collect();
        for &handle in &raw {
            self.release(handle);
        }
        self.calls.push(Call::FreeBuffers(raw));
    }

    fn begin_command_buffer(&mut self, buffer: vk::CommandBuffer) -> VkResult<()> {
        self.assert_live(buffer.as_raw());
        self.calls.push(Call::BeginBuffer(buffer.as_raw()));
        self.begin_results.pop_front().unwrap_or(Ok(()))
    }

    fn end_command_buffer(&mut self, buffer: vk::CommandBuffer) -> VkResult<()> {
        self.calls.push(Call::EndBuffer(buffer.as_raw()));
        Ok(())
    }

    fn create_semaphore(&mut self) -> VkResult<vk::Semaphore> {
        let handle = self.handle();
        self.calls.push(Call::CreateSemaphore(handle));
        Ok(vk::Semaphore::from_raw(handle))
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.release(semaphore.as_raw());
        self.signalled.remove(&semaphore.as_raw());
        self.calls.push(Call::DestroySemaphore(semaphore.as_raw()));
    }

    fn create_fence(&mut self, signaled: bool) -> VkResult<vk::Fence> {
        let handle = self.handle();
        self.fences.insert(handle, signaled);
        self.calls.push(Call::CreateFence(handle));
        Ok(vk::Fence::from_raw(handle))
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        self.release(fence.as_raw());
        self.fences.remove(&fence.as_raw());
        self.calls.push(Call::DestroyFence(fence.as_raw()));
    }

    /// An unsignalled fence never completes: reported as TIMEOUT instead of hanging.
    fn wait_fence(&mut self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        self.assert_live(fence.as_raw());
        self.calls.push(Call::WaitFence(fence.as_raw()));
        if let Some(result) = self.wait_fence_results.pop_front() {
            return result;
        }
        match self.fences.get(&fence.as_raw()) {
            Some(true) => Ok(()),
            _ => Err(vk::Result::TIMEOUT),
        }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        self.assert_live(fence.as_raw());
        self.calls.push(Call::ResetFence(fence.as_raw()));
        self.fences.insert(fence.as_raw(), false);
        Ok(())
    }

    fn acquire_next_image(
        &mut self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        self.calls.push(Call::Acquire {
            semaphore: signal.as_raw(),
        });
        let result = match self.acquire_results.pop_front() {
            Some(result) => result,
            None => {
                let count = self
                    .images
                    .get(&swapchain.as_raw())
                    .map_or(0, |images| images.len() as u32);
                if count == 0 {
                    Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
                } else {
                    let index = self.acquire_cursor % count;
                    self.acquire_cursor += 1;
                    Ok((index, false))
                }
            }
        };
        // Only a successful acquire signals the semaphore
        if result.is_ok() {
            self.signal(signal.as_raw());
        }
        result
    }

    fn submit(
        &mut self,
        buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()> {
        self.assert_live(buffer.as_raw());
        self.calls.push(Call::Submit {
            buffer: buffer.as_raw(),
            wait: wait.as_raw(),
            signal: signal.as_raw(),
            fence: fence.as_raw(),
        });
        self.consume(wait.as_raw());
        self.signal(signal.as_raw());
        assert_eq!(
            self.fences.insert(fence.as_raw(), true),
            Some(false),
            "submit with a fence that was not reset"
        );
        Ok(())
    }

    fn present(
        &mut self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        self.calls.push(Call::Present {
            image_index,
            wait: wait.as_raw(),
        });
        self.consume(wait.as_raw());
        self.present_results.pop_front().unwrap_or(Ok(false))
    }

    fn wait_idle(&mut self) -> VkResult<()> {
        self.calls.push(Call::WaitIdle);
        Ok(())
    }

    fn destroy_surface(&mut self) {
        assert!(self.surface_alive, "surface destroyed twice");
        self.surface_alive = false;
        self.calls.push(Call::DestroySurface);
    }
}
