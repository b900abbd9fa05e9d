//! Vulkan swapchain and presentation engine plumbing.
//!
//! The renderer addresses `M` virtual backbuffers. Whichever swapchain image
//! was acquired last stands in for all of them while a frame is recorded, so
//! the acquired image index never has to match the renderer's present slot.

use ash::vk;

use crate::backend::{BackendError, BackendResult};

use super::conversion::texture_format_from_vk;

/// Swapchain creation parameters.
pub(super) struct SwapchainParams {
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub width: u32,
    pub height: u32,
    pub image_count: u32,
    pub vsync: bool,
}

/// The image currently handed out by the presentation engine.
#[derive(Debug, Clone, Copy)]
struct Acquired {
    index: u32,
    semaphore: vk::Semaphore,
    /// Whether a submission already waits on `semaphore`.
    waited: bool,
}

pub(super) struct Swapchain {
    loader: ash::khr::swapchain::Device,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    /// Images that were transitioned out of `UNDEFINED` at least once.
    initialized: Vec<bool>,
    format: vk::Format,
    extent: vk::Extent2D,
    vsync: bool,
    /// One more than the image count, rotated per acquire.
    acquire_semaphores: Vec<vk::Semaphore>,
    /// Indexed by image.
    render_finished: Vec<vk::Semaphore>,
    next_acquire: usize,
    acquired: Option<Acquired>,
}

impl Swapchain {
    pub fn new(
        device: &ash::Device,
        loader: &ash::khr::swapchain::Device,
        surface_loader: &ash::khr::surface::Instance,
        params: &SwapchainParams,
        old_swapchain: vk::SwapchainKHR,
    ) -> BackendResult<Self> {
        let capabilities = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(params.physical_device, params.surface)
        }
        .map_err(|e| {
            BackendError::SwapchainCreationFailed(format!(
                "Failed to query surface capabilities: {:?}",
                e
            ))
        })?;

        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(params.physical_device, params.surface)
        }
        .map_err(|e| {
            BackendError::SwapchainCreationFailed(format!(
                "Failed to query surface formats: {:?}",
                e
            ))
        })?;
        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM || f.format == vk::Format::R8G8B8A8_UNORM
            })
            .or_else(|| {
                formats
                    .iter()
                    .find(|f| texture_format_from_vk(f.format).is_some())
            })
            .copied()
            .ok_or_else(|| {
                BackendError::SwapchainCreationFailed(
                    "Surface offers no 8-bit RGBA or BGRA format".to_string(),
                )
            })?;

        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(params.physical_device, params.surface)
        }
        .map_err(|e| {
            BackendError::SwapchainCreationFailed(format!(
                "Failed to query present modes: {:?}",
                e
            ))
        })?;
        let present_mode = if params.vsync {
            vk::PresentModeKHR::FIFO
        } else {
            [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
                .into_iter()
                .find(|mode| present_modes.contains(mode))
                .unwrap_or(vk::PresentModeKHR::FIFO)
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: params.width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: params.height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };

        let mut image_count = params.image_count.max(capabilities.min_image_count);
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(params.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = unsafe { loader.create_swapchain(&create_info, None) }.map_err(|e| {
            BackendError::SwapchainCreationFailed(format!("Failed to create swapchain: {:?}", e))
        })?;

        let mut swapchain = Self {
            loader: loader.clone(),
            handle,
            images: Vec::new(),
            views: Vec::new(),
            initialized: Vec::new(),
            format: surface_format.format,
            extent,
            vsync: params.vsync,
            acquire_semaphores: Vec::new(),
            render_finished: Vec::new(),
            next_acquire: 0,
            acquired: None,
        };
        // From here on `destroy` releases whatever was created.
        if let Err(e) = swapchain.create_images(device) {
            swapchain.destroy(device);
            return Err(e);
        }

        log::info!(
            "Created swapchain: {}x{} with {} images ({:?}, {:?})",
            extent.width,
            extent.height,
            swapchain.images.len(),
            surface_format.format,
            present_mode
        );

        Ok(swapchain)
    }

    fn create_images(&mut self, device: &ash::Device) -> BackendResult<()> {
        self.images = unsafe { self.loader.get_swapchain_images(self.handle) }.map_err(|e| {
            BackendError::SwapchainCreationFailed(format!(
                "Failed to get swapchain images: {:?}",
                e
            ))
        })?;
        self.initialized = vec![false; self.images.len()];

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .subresource_range(color_subresource_range());
            let view = unsafe { device.create_image_view(&view_info, None) }.map_err(|e| {
                BackendError::SwapchainCreationFailed(format!(
                    "Failed to create swapchain image view: {:?}",
                    e
                ))
            })?;
            self.views.push(view);
        }

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        for i in 0..=self.images.len() {
            let acquire = unsafe { device.create_semaphore(&semaphore_info, None) }
                .map_err(|e| semaphore_error("acquire", e))?;
            self.acquire_semaphores.push(acquire);
            if i < self.images.len() {
                let finished = unsafe { device.create_semaphore(&semaphore_info, None) }
                    .map_err(|e| semaphore_error("render finished", e))?;
                self.render_finished.push(finished);
            }
        }

        Ok(())
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn vsync(&self) -> bool {
        self.vsync
    }

    /// Acquire the next image. Returns `false` when the swapchain no longer
    /// matches the surface and must be recreated.
    pub fn acquire(&mut self) -> BackendResult<bool> {
        let semaphore = self.acquire_semaphores[self.next_acquire];
        let result = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => {
                self.next_acquire = (self.next_acquire + 1) % self.acquire_semaphores.len();
                self.acquired = Some(Acquired {
                    index,
                    semaphore,
                    waited: false,
                });
                if suboptimal {
                    log::debug!("Swapchain suboptimal");
                }
                Ok(true)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain out of date, needs recreation");
                Ok(false)
            }
            Err(e) => Err(BackendError::PresentFailed(format!(
                "Failed to acquire swapchain image: {:?}",
                e
            ))),
        }
    }

    /// Image and view standing in for every virtual backbuffer.
    pub fn current(&self) -> Option<(vk::Image, vk::ImageView)> {
        self.acquired.map(|acquired| {
            let index = acquired.index as usize;
            (self.images[index], self.views[index])
        })
    }

    /// Whether the current image still has undefined contents. Marks it as
    /// initialized, so only the first caller sees `true`.
    pub fn first_use(&mut self) -> bool {
        let Some(acquired) = self.acquired else {
            return false;
        };
        let initialized = &mut self.initialized[acquired.index as usize];
        !std::mem::replace(initialized, true)
    }

    /// Acquire semaphore the next submission has to wait on, once per image.
    pub fn take_acquire_wait(&mut self) -> Option<vk::Semaphore> {
        let acquired = self.acquired.as_mut()?;
        if acquired.waited {
            return None;
        }
        acquired.waited = true;
        Some(acquired.semaphore)
    }

    /// Semaphore presentation waits on for the current image.
    pub fn render_finished(&self) -> Option<vk::Semaphore> {
        self.acquired
            .map(|acquired| self.render_finished[acquired.index as usize])
    }

    /// Queue the current image for presentation. Returns `false` when the
    /// swapchain must be recreated.
    pub fn present(&mut self, queue: vk::Queue) -> BackendResult<bool> {
        let Some(acquired) = self.acquired.take() else {
            return Err(BackendError::PresentFailed(
                "No swapchain image acquired".to_string(),
            ));
        };

        let wait_semaphores = [self.render_finished[acquired.index as usize]];
        let swapchains = [self.handle];
        let image_indices = [acquired.index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => {
                log::trace!("Presented swapchain image {}", acquired.index);
                Ok(true)
            }
            Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                log::debug!("Swapchain suboptimal after present");
                Ok(false)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain out of date, needs recreation");
                Ok(false)
            }
            Err(e) => Err(BackendError::PresentFailed(format!(
                "Failed to present swapchain image: {:?}",
                e
            ))),
        }
    }

    /// Destroy the swapchain and its views and semaphores. The caller waits
    /// for the device to go idle first.
    pub fn destroy(&mut self, device: &ash::Device) {
        if self.handle == vk::SwapchainKHR::null() {
            return;
        }

        unsafe {
            for semaphore in self
                .acquire_semaphores
                .drain(..)
                .chain(self.render_finished.drain(..))
            {
                device.destroy_semaphore(semaphore, None);
            }
            for view in self.views.drain(..) {
                device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.handle, None);
        }
        self.handle = vk::SwapchainKHR::null();
        self.images.clear();
        self.acquired = None;
    }
}

/// Single mip, single layer color subresource.
pub(super) fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn semaphore_error(what: &str, e: vk::Result) -> BackendError {
    BackendError::SwapchainCreationFailed(format!("Failed to create {what} semaphore: {:?}", e))
}
