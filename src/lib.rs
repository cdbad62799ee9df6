//! Vulkan device context and per-window swapchain management.
//!
//! [`backend::DeviceContext`] is created once per process.
//! [`backend::SwapchainManager`] is created per window and hands out
//! [`backend::Frame`]s through `begin_frame` / `end_frame`. Render stages such
//! as [`render::ScreenPass`] record into those frames and own whatever
//! framebuffers they need.

pub mod backend;
pub mod config;
pub mod render;
