// Backend module - Vulkan abstraction layer
//
// DeviceContext owns instance/device/allocator. SwapchainManager owns one
// window's presentation state and talks to Vulkan through a SwapchainDriver.

pub mod device;
pub mod driver;
pub mod error;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub(crate) mod mock;

pub use device::{DeviceContext, DeviceOptions};
pub use driver::{SwapchainDriver, VulkanDriver};
pub use error::{DeviceError, DriverError, SwapchainError};
pub use swapchain::{
    Frame, FrameStatus, PresentStatus, SwapchainManager, SwapchainSettings, SwapchainState,
};
