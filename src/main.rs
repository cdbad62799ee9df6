// =============================================================================
// PORTABLE ENGINE - Vulkan device + swapchain core
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, config, hot reload)                     │
// │    └── DeviceContext (instance, GPU, device, queue, allocator)  │
// │          └── SwapchainManager<VulkanDriver> (per window)        │
// │                └── ScreenPass (render pass + framebuffers)      │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Recreate the swapchain if a resize or out-of-date status marked it stale
// 2. begin_frame: wait slot fence, acquire image, begin its command buffer
// 3. ScreenPass records a clear into the image (abandon_frame if that fails)
// 4. end_frame: submit (wait image-available, signal render-finished), present
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use portable_engine::backend::{
    DeviceContext, DeviceOptions, FrameStatus, PresentStatus, SwapchainError, SwapchainManager,
    SwapchainSettings, VulkanDriver,
};
use portable_engine::config::{self, Config, ConfigWatcher};
use portable_engine::render::ScreenPass;
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting portable engine");
    log::info!(
        "Window: {}x{}, present mode: {}",
        config.window.width,
        config.window.height,
        config.graphics.present_mode
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Creation failures and device loss end the loop; report them as the exit status
    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// `RUST_LOG` wins over the configured level
fn init_logging(config: &Config) {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        builder.parse_filters(&config.debug.log_level);
    }
    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Everything the loop thread owns.
///
/// Teardown order is explicit in `Drop`: screen pass, swapchain (which
/// destroys the surface), then the device context, then the window.
struct App {
    // ─────────────────────────────────────────────────────────────────────────
    // CONFIGURATION
    // ─────────────────────────────────────────────────────────────────────────
    config: Config,
    config_watcher: Option<ConfigWatcher>,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,
    is_minimized: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // VULKAN
    // ─────────────────────────────────────────────────────────────────────────
    device: Option<Arc<DeviceContext>>,
    swapchain: Option<SwapchainManager<VulkanDriver>>,
    screen: Option<ScreenPass>,

    fatal: Option<anyhow::Error>,
    frame_count: u64,
}

impl App {
    fn new(config: Config) -> Self {
        let config_watcher = if config.debug.watch_config {
            ConfigWatcher::new(config::DEFAULT_PATH)
                .map_err(|e| log::warn!("Config hot reload disabled: {:#}", e))
                .ok()
        } else {
            None
        };

        Self {
            config,
            config_watcher,
            window: None,
            is_minimized: false,
            device: None,
            swapchain: None,
            screen: None,
            fatal: None,
            frame_count: 0,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        // ─────────────────────────────────────────────────────────────────────
        // Device context
        // ─────────────────────────────────────────────────────────────────────
        let options = DeviceOptions {
            app_name: self.config.window.title.clone(),
            enable_validation: self.config.debug.validation_layers,
        };
        let device =
            DeviceContext::new(window, &options).context("Failed to create device context")?;

        // ─────────────────────────────────────────────────────────────────────
        // Swapchain for this window
        // ─────────────────────────────────────────────────────────────────────
        let driver = VulkanDriver::new(device.clone(), window)
            .context("Failed to bind Vulkan to the window surface")?;

        let settings = SwapchainSettings {
            present_mode: self.config.present_mode(),
            frames_in_flight: self.config.graphics.frames_in_flight.max(1),
        };
        let size = window.inner_size();
        let mut swapchain = SwapchainManager::new(
            driver,
            settings,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
        );
        swapchain
            .initialize()
            .context("Failed to initialize swapchain")?;

        self.swapchain = Some(swapchain);
        self.device = Some(device);
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// One acquire -> record -> submit -> present cycle.
    ///
    /// Returns `Ok(false)` when no frame was presented (minimized, out of
    /// date or timed out); the next redraw retries.
    fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        let (Some(device), Some(swapchain)) = (self.device.as_ref(), self.swapchain.as_mut())
        else {
            return Ok(false);
        };

        // ─────────────────────────────────────────────────────────────────────
        // Step 1: Rebuild stale swapchain
        // ─────────────────────────────────────────────────────────────────────
        if swapchain.needs_recreate() && !swapchain.recreate()? {
            return Ok(false);
        }

        // Created before acquiring so a failure here never strands a begun frame
        if self.screen.is_none() {
            self.screen = Some(ScreenPass::new(device.clone(), swapchain.format())?);
        }

        // ─────────────────────────────────────────────────────────────────────
        // Step 2: Acquire
        // ─────────────────────────────────────────────────────────────────────
        let frame = match swapchain.begin_frame(self.config.acquire_timeout_ns())? {
            FrameStatus::Ready(frame) => frame,
            FrameStatus::OutOfDate => {
                log::debug!("Swapchain out of date on acquire");
                return Ok(false);
            }
            FrameStatus::Timeout => {
                log::warn!("Timed out waiting for a swapchain image");
                return Ok(false);
            }
        };

        // ─────────────────────────────────────────────────────────────────────
        // Step 3: Record
        // ─────────────────────────────────────────────────────────────────────
        let clear_color = self.config.graphics.clear_color;
        let recorded = match self.screen.as_mut() {
            Some(screen) => screen
                .sync(swapchain)
                .and_then(|()| screen.record(&frame, clear_color)),
            None => Ok(()),
        };

        // Framebuffer or depth allocation failed: nothing valid to present.
        // The error is not a SwapchainError, so the loop stops on it.
        if let Err(e) = recorded {
            swapchain.abandon_frame(frame)?;
            return Err(e.context("Failed to record frame"));
        }

        // ─────────────────────────────────────────────────────────────────────
        // Step 4: Submit + present
        // ─────────────────────────────────────────────────────────────────────
        let status = swapchain.end_frame(frame)?;

        if status != PresentStatus::Presented {
            log::debug!("Present returned {:?}, recreating next frame", status);
        }
        self.frame_count += 1;
        Ok(true)
    }

    /// Re-read config.toml and apply what can change at runtime.
    fn reload_config(&mut self) {
        let Some(watcher) = self.config_watcher.as_ref() else {
            return;
        };
        if !watcher.changed() {
            return;
        }

        let config = match Config::load_from_path(watcher.path()) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring config change: {:#}", e);
                return;
            }
        };

        log::info!("Config reloaded");
        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.set_present_mode(config.present_mode());
        }
        self.config.graphics.clear_color = config.graphics.clear_color;
        self.config.graphics.present_mode = config.graphics.present_mode;
        self.config.graphics.acquire_timeout_ms = config.graphics.acquire_timeout_ms;
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.fatal = Some(error);
        event_loop.exit();
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            self.fail(event_loop, e);
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                log::info!("Close requested after {} frames", self.frame_count);
                event_loop.exit();
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::Resized(size) => {
                self.is_minimized = size.width == 0 || size.height == 0;
                if let Some(swapchain) = self.swapchain.as_mut() {
                    swapchain.notify_resized(size.width, size.height);
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // REDRAW REQUESTED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    let fatal = e
                        .downcast_ref::<SwapchainError>()
                        .map_or(true, SwapchainError::is_fatal);
                    if fatal {
                        self.fail(event_loop, e.context("Render loop stopped"));
                    } else {
                        log::warn!("Frame skipped: {:#}", e);
                    }
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        self.reload_config();

        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // 1. Framebuffers, depth buffer, render pass (waits for the GPU)
        self.screen = None;

        // 2. Per-image resources, swapchain, sync objects, command pool, surface
        if let Some(mut swapchain) = self.swapchain.take() {
            swapchain.destroy();
        }

        // 3. Allocator, device, instance once the last Arc goes
        self.device = None;

        log::info!("Cleanup complete");
    }
}
