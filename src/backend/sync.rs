// Synchronization primitives
//
// Semaphores order acquire -> render -> present on the GPU; the fence tells
// the CPU when a slot's submission has retired.

use ash::prelude::VkResult;
use ash::vk;

use super::driver::SwapchainDriver;

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new<D: SwapchainDriver>(driver: &mut D) -> VkResult<Self> {
        let image_available = driver.create_semaphore()?;

        let render_finished = match driver.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                driver.destroy_semaphore(image_available);
                return Err(e);
            }
        };

        // Start signaled so the first wait on this slot returns immediately
        let in_flight_fence = match driver.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                driver.destroy_semaphore(image_available);
                driver.destroy_semaphore(render_finished);
                return Err(e);
            }
        };

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }

    pub fn destroy<D: SwapchainDriver>(&self, driver: &mut D) {
        driver.destroy_semaphore(self.image_available);
        driver.destroy_semaphore(self.render_finished);
        driver.destroy_fence(self.in_flight_fence);
    }
}

/// Ring of in-flight frame slots
#[derive(Debug, Default)]
pub struct FrameSlots {
    slots: Vec<FrameSync>,
    current: usize,
}

impl FrameSlots {
    /// Create `count` slots (at least one).
    pub fn new<D: SwapchainDriver>(driver: &mut D, count: usize) -> VkResult<Self> {
        let mut slots = Vec::with_capacity(count.max(1));

        for _ in 0..count.max(1) {
            match FrameSync::new(driver) {
                Ok(sync) => slots.push(sync),
                Err(e) => {
                    for sync in &slots {
                        sync.destroy(driver);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self { slots, current: 0 })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn get(&self, index: usize) -> Option<&FrameSync> {
        self.slots.get(index)
    }

    pub fn current(&self) -> Option<&FrameSync> {
        self.slots.get(self.current)
    }

    /// Swap in `sync` for slot `index`, returning the old objects.
    pub fn replace(&mut self, index: usize, sync: FrameSync) -> Option<FrameSync> {
        self.slots
            .get_mut(index)
            .map(|slot| std::mem::replace(slot, sync))
    }

    pub fn advance(&mut self) {
        if !self.slots.is_empty() {
            self.current = (self.current + 1) % self.slots.len();
        }
    }

    /// Destroy every slot; the ring is empty afterwards.
    pub fn destroy<D: SwapchainDriver>(&mut self, driver: &mut D) {
        for sync in self.slots.drain(..) {
            sync.destroy(driver);
        }
        self.current = 0;
    }
}
