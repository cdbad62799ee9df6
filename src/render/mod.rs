// Render stages that draw into swapchain images

pub mod screen;

pub use screen::ScreenPass;
