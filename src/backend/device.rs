// Device Context - Core GPU interface
//
// Responsibilities:
// - Instance creation with the window system's surface extensions
// - Physical device selection (prefer discrete GPU that can present)
// - Graphics + present queue discovery
// - Logical device + queue creation
// - Memory allocator setup for render stages

use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::error::{DeviceError, VkContext};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Settings for device creation
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub app_name: String,
    pub enable_validation: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            app_name: "PortableEngine".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

/// What device selection needs to know about one enumerated GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuCandidate {
    pub device_type: vk::PhysicalDeviceType,
    /// First queue family with graphics + present support, if any
    pub present_family: Option<u32>,
}

/// Instance, GPU, logical device and graphics queue for the process.
///
/// Created once and shared (via `Arc`) with every swapchain and render stage.
/// Handles are exposed read-only; only this type destroys them.
pub struct DeviceContext {
    // Vulkan handles (order matters for drop!)
    allocator: ManuallyDrop<Mutex<Allocator>>,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    instance: ash::Instance,
    entry: Entry,

    // Queue handles
    graphics_queue: vk::Queue,
    graphics_queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    properties: vk::PhysicalDeviceProperties,
}

impl DeviceContext {
    /// Create the device context for the GPU that can present to `window`.
    ///
    /// A transient probe surface is created for `window` to test presentation
    /// support and destroyed again before returning; the swapchain driver
    /// creates its own surface later.
    pub fn new<W>(window: &W, options: &DeviceOptions) -> Result<Arc<Self>, DeviceError>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        log::info!("Creating Vulkan device context: {}", options.app_name);

        let display_handle = window.display_handle()?.as_raw();
        let window_handle = window.window_handle()?.as_raw();

        let entry = unsafe { Entry::load() }?;

        let instance = Self::create_instance(&entry, display_handle, options)?;

        let debug_utils = if options.enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(debug_utils) => Some(debug_utils),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        let selected = Self::select_physical_device(&entry, &instance, display_handle, window_handle)
            .and_then(|(physical_device, family)| {
                let device = Self::create_logical_device(&instance, physical_device, family)?;
                Ok((physical_device, family, device))
            });

        let (physical_device, graphics_queue_family, device) = match selected {
            Ok(selected) => selected,
            Err(e) => {
                unsafe {
                    if let Some((debug_utils, messenger)) = &debug_utils {
                        debug_utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {} ({:?})",
            properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy())
                .unwrap_or_default(),
            properties.device_type
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::debug!("Graphics/present queue family: {}", graphics_queue_family);

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    device.destroy_device(None);
                    if let Some((debug_utils, messenger)) = &debug_utils {
                        debug_utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e.into());
            }
        };

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            entry,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
            properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        display_handle: RawDisplayHandle,
        options: &DeviceOptions,
    ) -> Result<ash::Instance, DeviceError> {
        let app_name = CString::new(options.app_name.as_str()).unwrap_or_default();

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"PortableEngine")
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_3);

        // Surface extensions for whatever window system the handle belongs to
        let mut extensions: Vec<*const c_char> =
            ash_window::enumerate_required_extensions(display_handle)
                .vk_context::<DeviceError>("vkEnumerateInstanceExtensionProperties")?
                .to_vec();

        if options.enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let mut flags = vk::InstanceCreateFlags::empty();
        if cfg!(any(target_os = "macos", target_os = "ios")) {
            extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
            extensions.push(ash::khr::get_physical_device_properties2::NAME.as_ptr());
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let layer_names = if options.enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .vk_context::<DeviceError>("vkCreateInstance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT), DeviceError> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .vk_context::<DeviceError>("vkCreateDebugUtilsMessengerEXT")?;

        Ok((debug_utils, messenger))
    }

    /// Enumerate GPUs and pick one against a transient probe surface.
    fn select_physical_device(
        entry: &Entry,
        instance: &ash::Instance,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<(vk::PhysicalDevice, u32), DeviceError> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .vk_context::<DeviceError>("vkEnumeratePhysicalDevices")?;

        if devices.is_empty() {
            return Err(DeviceError::NoPhysicalDevice);
        }

        let surface_loader = ash::khr::surface::Instance::new(entry, instance);
        let probe = unsafe {
            ash_window::create_surface(entry, instance, display_handle, window_handle, None)
        }
        .vk_context::<DeviceError>("vkCreateSurfaceKHR")?;

        let candidates: Result<Vec<GpuCandidate>, DeviceError> = devices
            .iter()
            .map(|&device| {
                let props = unsafe { instance.get_physical_device_properties(device) };
                let families =
                    unsafe { instance.get_physical_device_queue_family_properties(device) };
                let present_family = find_queue_family(&families, |family| unsafe {
                    surface_loader.get_physical_device_surface_support(device, family, probe)
                })
                .vk_context::<DeviceError>("vkGetPhysicalDeviceSurfaceSupportKHR")?;

                log::debug!(
                    "GPU {:?} ({:?}): present family {:?}",
                    props.device_name_as_c_str().unwrap_or_default(),
                    props.device_type,
                    present_family
                );

                Ok(GpuCandidate {
                    device_type: props.device_type,
                    present_family,
                })
            })
            .collect();

        unsafe { surface_loader.destroy_surface(probe, None) };

        let (index, family) = select_gpu(&candidates?)?;
        Ok((devices[index], family))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<ash::Device, DeviceError> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities);

        let mut extensions = vec![ash::khr::swapchain::NAME.as_ptr()];

        // Portability drivers (MoltenVK) require the subset extension when they expose it
        let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .vk_context::<DeviceError>("vkEnumerateDeviceExtensionProperties")?;
        if available.iter().any(|ext| {
            ext.extension_name_as_c_str()
                .is_ok_and(|name| name == ash::khr::portability_subset::NAME)
        }) {
            extensions.push(ash::khr::portability_subset::NAME.as_ptr());
        }

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .vk_context::<DeviceError>("vkCreateDevice")?;

        Ok(device)
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Lock the GPU memory allocator
    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> ash::prelude::VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device context...");

        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// First queue family that supports graphics and can present.
///
/// `present` is only asked about families that already support graphics.
pub fn find_queue_family<F>(
    families: &[vk::QueueFamilyProperties],
    mut present: F,
) -> ash::prelude::VkResult<Option<u32>>
where
    F: FnMut(u32) -> ash::prelude::VkResult<bool>,
{
    for (index, props) in families.iter().enumerate() {
        let index = index as u32;
        if props.queue_flags.contains(vk::QueueFlags::GRAPHICS) && present(index)? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Pick a GPU: the first discrete GPU that can present, otherwise the first
/// GPU that can present. Returns the candidate index and its queue family.
pub fn select_gpu(candidates: &[GpuCandidate]) -> Result<(usize, u32), DeviceError> {
    if candidates.is_empty() {
        return Err(DeviceError::NoPhysicalDevice);
    }

    let presentable = || {
        candidates
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.present_family.map(|family| (i, family, c.device_type)))
    };

    presentable()
        .find(|&(_, _, ty)| ty == vk::PhysicalDeviceType::DISCRETE_GPU)
        .or_else(|| presentable().next())
        .map(|(i, family, _)| (i, family))
        .ok_or(DeviceError::NoPresentableQueueFamily)
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn candidate(device_type: vk::PhysicalDeviceType, family: Option<u32>) -> GpuCandidate {
        GpuCandidate {
            device_type,
            present_family: family,
        }
    }

    #[test]
    fn test_find_queue_family_needs_graphics_and_present() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];

        // Family 1 has graphics but cannot present, family 2 can
        let found = find_queue_family(&families, |i| Ok(i == 2)).unwrap();
        assert_eq!(found, Some(2));
    }

    #[test]
    fn test_find_queue_family_skips_present_query_without_graphics() {
        let families = [family(vk::QueueFlags::COMPUTE), family(vk::QueueFlags::GRAPHICS)];
        let mut asked = Vec::new();

        let found = find_queue_family(&families, |i| {
            asked.push(i);
            Ok(true)
        })
        .unwrap();

        assert_eq!(found, Some(1));
        assert_eq!(asked, vec![1]);
    }

    #[test]
    fn test_find_queue_family_none_and_error() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(find_queue_family(&families, |_| Ok(false)).unwrap(), None);

        let err = find_queue_family(&families, |_| Err(vk::Result::ERROR_SURFACE_LOST_KHR));
        assert_eq!(err, Err(vk::Result::ERROR_SURFACE_LOST_KHR));
    }

    #[test]
    fn test_select_gpu_prefers_first_discrete() {
        let candidates = [
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, Some(0)),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, Some(2)),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, Some(0)),
        ];
        assert_eq!(select_gpu(&candidates).unwrap(), (1, 2));
    }

    #[test]
    fn test_select_gpu_falls_back_to_first_presentable() {
        let candidates = [
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, None),
            candidate(vk::PhysicalDeviceType::CPU, Some(1)),
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, Some(0)),
        ];
        assert_eq!(select_gpu(&candidates).unwrap(), (1, 1));
    }

    #[test]
    fn test_select_gpu_errors() {
        assert!(matches!(select_gpu(&[]), Err(DeviceError::NoPhysicalDevice)));

        let candidates = [candidate(vk::PhysicalDeviceType::DISCRETE_GPU, None)];
        assert!(matches!(
            select_gpu(&candidates),
            Err(DeviceError::NoPresentableQueueFamily)
        ));
    }
}
