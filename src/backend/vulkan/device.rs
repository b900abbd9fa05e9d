//! Vulkan physical and logical device management.

use ash::vk;

use crate::backend::{BackendError, BackendResult};

use super::instance::REQUIRED_API_VERSION;

/// Physical device chosen for rendering, with the queue family used for
/// graphics, compute and present.
pub(super) struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
    /// Largest descriptor array the bindless set may declare.
    pub max_bindless_descriptors: u32,
    /// Largest one-dimensional compute group the device can launch.
    pub max_compute_group_size: u32,
}

/// Select the best physical device that can present to `surface`.
///
/// Prefers discrete GPUs over integrated GPUs.
pub(super) fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> BackendResult<SelectedDevice> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        BackendError::DeviceCreationFailed(format!(
            "Failed to enumerate physical devices: {:?}",
            e
        ))
    })?;

    if devices.is_empty() {
        return Err(BackendError::DeviceCreationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(u32, SelectedDevice)> = None;

    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        if properties.api_version < REQUIRED_API_VERSION {
            log::info!("Skipping GPU {name}: Vulkan 1.3 not supported");
            continue;
        }
        if !supports_bindless(instance, device) {
            log::info!("Skipping GPU {name}: descriptor indexing not supported");
            continue;
        }
        let Some(queue_family) = find_queue_family(instance, device, surface_loader, surface)
        else {
            log::info!("Skipping GPU {name}: no graphics queue can present");
            continue;
        };

        let mut score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 0,
        };
        score += properties.limits.max_image_dimension2_d / 1024;

        log::info!(
            "Found GPU: {} (type: {:?}, score: {})",
            name,
            properties.device_type,
            score
        );

        if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
            best = Some((
                score,
                SelectedDevice {
                    physical_device: device,
                    queue_family,
                    max_bindless_descriptors: max_bindless_descriptors(instance, device),
                    max_compute_group_size: properties.limits.max_compute_work_group_size[0]
                        .min(properties.limits.max_compute_work_group_invocations),
                },
            ));
        }
    }

    best.map(|(_, selected)| selected)
        .ok_or_else(|| BackendError::DeviceCreationFailed("No suitable GPU found".to_string()))
}

fn supports_bindless(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_12)
        .push_next(&mut vulkan_13);
    unsafe { instance.get_physical_device_features2(device, &mut features) };

    vulkan_12.timeline_semaphore == vk::TRUE
        && vulkan_12.runtime_descriptor_array == vk::TRUE
        && vulkan_12.descriptor_binding_partially_bound == vk::TRUE
        && vulkan_12.descriptor_binding_storage_buffer_update_after_bind == vk::TRUE
        && vulkan_12.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
        && vulkan_12.shader_sampled_image_array_non_uniform_indexing == vk::TRUE
        && vulkan_13.dynamic_rendering == vk::TRUE
        && vulkan_13.synchronization2 == vk::TRUE
}

fn max_bindless_descriptors(instance: &ash::Instance, device: vk::PhysicalDevice) -> u32 {
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Properties::default();
    let mut properties = vk::PhysicalDeviceProperties2::default().push_next(&mut vulkan_12);
    unsafe { instance.get_physical_device_properties2(device, &mut properties) };

    vulkan_12
        .max_descriptor_set_update_after_bind_storage_buffers
        .min(vulkan_12.max_descriptor_set_update_after_bind_sampled_images)
        .min(vulkan_12.max_per_stage_descriptor_update_after_bind_storage_buffers)
        .min(vulkan_12.max_per_stage_descriptor_update_after_bind_sampled_images)
}

/// Find a queue family that supports graphics, compute and present.
fn find_queue_family(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Option<u32> {
    let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    queue_families
        .iter()
        .enumerate()
        .find(|(index, family)| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                && unsafe {
                    surface_loader.get_physical_device_surface_support(
                        device,
                        *index as u32,
                        surface,
                    )
                }
                .unwrap_or(false)
        })
        .map(|(index, _)| index as u32)
}

/// Create a logical device with the features the bindless sprite pipeline
/// relies on.
pub(super) fn create_logical_device(
    instance: &ash::Instance,
    selected: &SelectedDevice,
) -> BackendResult<ash::Device> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(selected.queue_family)
        .queue_priorities(&queue_priorities)];

    let device_extensions = [ash::khr::swapchain::NAME.as_ptr()];

    let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_storage_buffer_update_after_bind(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .shader_sampled_image_array_non_uniform_indexing(true);

    let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .push_next(&mut vulkan_12_features)
        .push_next(&mut vulkan_13_features);

    unsafe { instance.create_device(selected.physical_device, &create_info, None) }.map_err(|e| {
        BackendError::DeviceCreationFailed(format!("Failed to create logical device: {:?}", e))
    })
}

/// Command pool whose buffers are reset together, one per command list.
pub(super) fn create_command_pool(
    device: &ash::Device,
    queue_family_index: u32,
    flags: vk::CommandPoolCreateFlags,
) -> BackendResult<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family_index)
        .flags(flags);

    unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
        BackendError::RecordingFailed(format!("Failed to create command pool: {:?}", e))
    })
}
