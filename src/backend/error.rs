// Error types for the Vulkan backend
//
// Creation failures come back as typed errors instead of aborting; the host
// decides whether a missing GPU capability is fatal. Out-of-date swapchains are
// NOT errors: they surface as FrameStatus / PresentStatus values.

use ash::vk;
use thiserror::Error;

/// Failures while building the device context
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error("no Vulkan-capable GPU found")]
    NoPhysicalDevice,

    #[error("no GPU exposes a queue family with both graphics and present support")]
    NoPresentableQueueFamily,

    #[error("failed to create GPU memory allocator: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),

    #[error("{op} failed: {result}")]
    Vulkan {
        op: &'static str,
        result: vk::Result,
    },
}

/// Failures while binding a driver to a window surface
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error("queue family {0} cannot present to this surface")]
    PresentationUnsupported(u32),

    #[error("{op} failed: {result}")]
    Vulkan {
        op: &'static str,
        result: vk::Result,
    },
}

/// Failures of the swapchain manager
#[derive(Debug, Error)]
pub enum SwapchainError {
    #[error("swapchain manager is {actual:?}, operation requires {expected:?}")]
    InvalidState {
        expected: super::swapchain::SwapchainState,
        actual: super::swapchain::SwapchainState,
    },

    #[error("surface reports no formats")]
    NoSurfaceFormat,

    #[error("frame belongs to swapchain generation {frame}, current is {current}")]
    StaleFrame { frame: u64, current: u64 },

    #[error("a frame is still open; hand it to end_frame or abandon_frame first")]
    FrameInProgress,

    #[error("frame was not issued by this swapchain manager")]
    ForeignFrame,

    #[error("GPU device lost")]
    DeviceLost,

    #[error("{op} failed: {result}")]
    Vulkan {
        op: &'static str,
        result: vk::Result,
    },
}

impl SwapchainError {
    /// Wrap a raw Vulkan status, singling out device loss.
    pub fn vulkan(op: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => SwapchainError::DeviceLost,
            result => SwapchainError::Vulkan { op, result },
        }
    }

    /// Misuse of the frame protocol is recoverable; GPU failures are not.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SwapchainError::InvalidState { .. }
                | SwapchainError::StaleFrame { .. }
                | SwapchainError::FrameInProgress
                | SwapchainError::ForeignFrame
        )
    }
}

/// Attach the failing operation name to a raw `VkResult`.
pub(crate) trait VkContext<T> {
    fn vk_context<E>(self, op: &'static str) -> Result<T, E>
    where
        E: From<(&'static str, vk::Result)>;
}

impl<T> VkContext<T> for ash::prelude::VkResult<T> {
    fn vk_context<E>(self, op: &'static str) -> Result<T, E>
    where
        E: From<(&'static str, vk::Result)>,
    {
        self.map_err(|result| E::from((op, result)))
    }
}

impl From<(&'static str, vk::Result)> for DeviceError {
    fn from((op, result): (&'static str, vk::Result)) -> Self {
        DeviceError::Vulkan { op, result }
    }
}

impl From<(&'static str, vk::Result)> for DriverError {
    fn from((op, result): (&'static str, vk::Result)) -> Self {
        DriverError::Vulkan { op, result }
    }
}

impl From<(&'static str, vk::Result)> for SwapchainError {
    fn from((op, result): (&'static str, vk::Result)) -> Self {
        SwapchainError::vulkan(op, result)
    }
}
