//! Native Vulkan backend implementation using ash.
//!
//! - Vulkan 1.3 with dynamic rendering and synchronization2
//! - gpu-allocator for memory management
//! - timeline semaphores as fences
//! - one bindless descriptor set as the shader-visible descriptor heap
//!
//! Resource states map to pipeline stages, access masks and image layouts in
//! [`conversion`]. Barriers recorded by the renderer become a single
//! `vkCmdPipelineBarrier2` each.

mod conversion;
mod debug;
mod descriptors;
mod device;
mod instance;
mod pipeline;
mod swapchain;

use std::collections::HashMap;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::shader::ShaderBlob;
use crate::RendererConfig;

use self::conversion::{
    convert_buffer_usage, convert_heap_location, convert_load_op, convert_texture_format,
    state_layout, state_scope, texture_format_from_vk,
};
use self::descriptors::{
    BindlessSet, PASS_CONSTANTS_OFFSET, PUSH_CONSTANT_SIZE, PUSH_CONSTANT_STAGES,
};
use self::swapchain::{color_subresource_range, Swapchain, SwapchainParams};

/// Parameters of [`VulkanBackend::new`].
#[derive(Debug, Clone)]
pub struct VulkanConfig {
    pub width: u32,
    pub height: u32,
    /// Virtual backbuffers the renderer cycles through.
    pub backbuffer_count: usize,
    pub validation: bool,
    pub vsync: bool,
}

impl VulkanConfig {
    /// Settings matching a renderer configuration, presenting with vsync.
    pub fn for_renderer(config: &RendererConfig, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            backbuffer_count: config.backbuffer_count,
            validation: config.validation,
            vsync: true,
        }
    }
}

struct VkBuffer {
    label: String,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    heap: HeapLocation,
}

struct VkTexture {
    label: String,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    width: u32,
    height: u32,
    format: TextureFormat,
}

struct VkPipeline {
    pipeline: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
}

struct VkCommandList {
    label: String,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    recording: bool,
}

/// One-shot command buffer for work done at resource creation.
struct ImmediateContext {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

/// Vulkan-based GPU backend using ash.
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    device: ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    allocator: Option<Allocator>,
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: Swapchain,
    swapchain_params: SwapchainParams,
    max_bindless_descriptors: u32,
    max_compute_group_size: u32,
    bindless: Option<BindlessSet>,
    immediate: ImmediateContext,

    buffers: HashMap<u64, VkBuffer>,
    textures: HashMap<u64, VkTexture>,
    pipelines: HashMap<u64, VkPipeline>,
    command_lists: HashMap<u64, VkCommandList>,
    fences: HashMap<u64, vk::Semaphore>,
    /// Virtual backbuffer handles, all resolving to the acquired image.
    backbuffers: Vec<TextureId>,
    next_id: u64,
}

impl VulkanBackend {
    /// Create a backend presenting to `window`.
    ///
    /// Initializes the instance, surface, device, allocator and swapchain and
    /// acquires the first swapchain image.
    pub fn new<W>(window: &W, config: &VulkanConfig) -> BackendResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        if config.backbuffer_count == 0 {
            return Err(BackendError::InitializationFailed(
                "backbuffer_count must be at least 1".to_string(),
            ));
        }

        let display = window
            .display_handle()
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?
            .as_raw();

        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            BackendError::InitializationFailed(format!("Failed to load Vulkan: {}", e))
        })?;

        let bundle = instance::create_instance(&entry, display, config.validation)?;
        let instance = bundle.instance;

        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display, window_handle, None)
        }
        .map_err(|e| {
            BackendError::SurfaceCreationFailed(format!("Failed to create surface: {:?}", e))
        })?;
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        let selected = device::select_physical_device(&instance, &surface_loader, surface)?;
        let device = device::create_logical_device(&instance, &selected)?;
        let queue = unsafe { device.get_device_queue(selected.queue_family, 0) };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device: selected.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| {
            BackendError::InitializationFailed(format!("Failed to create memory allocator: {}", e))
        })?;

        let immediate = create_immediate_context(&device, selected.queue_family)?;

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);
        let swapchain_params = SwapchainParams {
            surface,
            physical_device: selected.physical_device,
            width: config.width,
            height: config.height,
            image_count: config.backbuffer_count as u32,
            vsync: config.vsync,
        };
        let swapchain = Swapchain::new(
            &device,
            &swapchain_loader,
            &surface_loader,
            &swapchain_params,
            vk::SwapchainKHR::null(),
        )?;

        let mut backend = Self {
            _entry: entry,
            instance,
            debug_utils: bundle.debug_utils,
            debug_messenger: bundle.debug_messenger,
            surface_loader,
            surface,
            device,
            queue,
            queue_family: selected.queue_family,
            allocator: Some(allocator),
            swapchain_loader,
            swapchain,
            swapchain_params,
            max_bindless_descriptors: selected.max_bindless_descriptors,
            max_compute_group_size: selected.max_compute_group_size,
            bindless: None,
            immediate,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            pipelines: HashMap::new(),
            command_lists: HashMap::new(),
            fences: HashMap::new(),
            backbuffers: Vec::new(),
            next_id: 1,
        };
        let backbuffers = (0..config.backbuffer_count)
            .map(|_| TextureId(backend.allocate_id()))
            .collect();
        backend.backbuffers = backbuffers;
        backend.acquire_next_image()?;

        log::info!(
            "Vulkan backend initialized (validation: {}, {} backbuffers)",
            config.validation,
            config.backbuffer_count
        );

        Ok(backend)
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocator(&mut self) -> BackendResult<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| BackendError::InitializationFailed("Allocator already dropped".into()))
    }

    fn is_backbuffer(&self, texture: TextureId) -> bool {
        self.backbuffers.contains(&texture)
    }

    /// Record `record` into the immediate command buffer, submit it and wait
    /// for completion.
    fn submit_immediate(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> BackendResult<()> {
        let cmd = self.immediate.buffer;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .and_then(|_| self.device.begin_command_buffer(cmd, &begin_info))
        }
        .map_err(|e| {
            BackendError::RecordingFailed(format!("Failed to begin immediate commands: {:?}", e))
        })?;

        record(&self.device, cmd);

        unsafe { self.device.end_command_buffer(cmd) }.map_err(|e| {
            BackendError::RecordingFailed(format!("Failed to end immediate commands: {:?}", e))
        })?;

        let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&command_buffers);
        unsafe {
            self.device
                .queue_submit2(self.queue, &[submit], self.immediate.fence)
                .and_then(|_| {
                    self.device
                        .wait_for_fences(&[self.immediate.fence], true, u64::MAX)
                })
                .and_then(|_| self.device.reset_fences(&[self.immediate.fence]))
        }
        .map_err(|e| {
            BackendError::SubmitFailed(format!("Failed to run immediate commands: {:?}", e))
        })
    }

    fn queue_submit(
        &self,
        waits: &[vk::SemaphoreSubmitInfo],
        command_buffers: &[vk::CommandBufferSubmitInfo],
        signals: &[vk::SemaphoreSubmitInfo],
    ) -> BackendResult<()> {
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(waits)
            .command_buffer_infos(command_buffers)
            .signal_semaphore_infos(signals);
        unsafe {
            self.device
                .queue_submit2(self.queue, &[submit], vk::Fence::null())
        }
        .map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            e => BackendError::SubmitFailed(format!("Failed to submit: {:?}", e)),
        })
    }

    /// Acquire wait for the first submission touching the new image.
    fn acquire_waits(&mut self) -> Vec<vk::SemaphoreSubmitInfo<'static>> {
        self.swapchain
            .take_acquire_wait()
            .map(|semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            })
            .into_iter()
            .collect()
    }

    fn acquire_next_image(&mut self) -> BackendResult<()> {
        if self.swapchain.acquire()? {
            return Ok(());
        }
        let vsync = self.swapchain.vsync();
        self.recreate_swapchain(vsync)?;
        if self.swapchain.acquire()? {
            Ok(())
        } else {
            Err(BackendError::PresentFailed(
                "Swapchain out of date right after recreation".to_string(),
            ))
        }
    }

    fn recreate_swapchain(&mut self, vsync: bool) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(|e| {
            BackendError::SwapchainCreationFailed(format!("Failed to wait for idle: {:?}", e))
        })?;

        self.swapchain_params.vsync = vsync;
        let replacement = Swapchain::new(
            &self.device,
            &self.swapchain_loader,
            &self.surface_loader,
            &self.swapchain_params,
            self.swapchain.handle(),
        )?;
        let mut old = std::mem::replace(&mut self.swapchain, replacement);
        old.destroy(&self.device);
        Ok(())
    }

    fn recording_buffer(&self, list: CommandListId) -> Option<vk::CommandBuffer> {
        match self.command_lists.get(&list.0) {
            Some(entry) if entry.recording => Some(entry.buffer),
            Some(entry) => {
                log::error!("Command list {} is not open for recording", entry.label);
                None
            }
            None => {
                log::error!("Unknown command list {}", list.0);
                None
            }
        }
    }

    fn buffer_handle(&self, buffer: BufferId) -> Option<vk::Buffer> {
        let handle = self.buffers.get(&buffer.0).map(|b| b.buffer);
        if handle.is_none() {
            log::error!("Unknown buffer {}", buffer.0);
        }
        handle
    }

    /// Image and view of `texture`, with backbuffers resolved to the
    /// acquired swapchain image.
    fn image_target(&self, texture: TextureId) -> Option<(vk::Image, vk::ImageView, vk::Extent2D)> {
        if self.is_backbuffer(texture) {
            return self
                .swapchain
                .current()
                .map(|(image, view)| (image, view, self.swapchain.extent()));
        }
        let target = self.textures.get(&texture.0).map(|t| {
            (
                t.image,
                t.view,
                vk::Extent2D {
                    width: t.width,
                    height: t.height,
                },
            )
        });
        if target.is_none() {
            log::error!("Unknown texture {}", texture.0);
        }
        target
    }

    fn free_allocation(&mut self, label: &str, allocation: Option<Allocation>) {
        let Some(allocation) = allocation else {
            return;
        };
        match self.allocator() {
            Ok(allocator) => {
                if let Err(e) = allocator.free(allocation) {
                    log::error!("Failed to free memory of {label}: {e}");
                }
            }
            Err(e) => log::error!("Failed to free memory of {label}: {e}"),
        }
    }

    fn allocate_memory(
        &mut self,
        label: &str,
        requirements: vk::MemoryRequirements,
        location: gpu_allocator::MemoryLocation,
        linear: bool,
    ) -> BackendResult<Allocation> {
        self.allocator()?
            .allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| match e {
                gpu_allocator::AllocationError::OutOfMemory => BackendError::OutOfMemory,
                e => BackendError::BufferCreationFailed(format!(
                    "Failed to allocate memory for {label}: {e}"
                )),
            })
    }
}

fn create_immediate_context(
    device: &ash::Device,
    queue_family: u32,
) -> BackendResult<ImmediateContext> {
    let pool = device::create_command_pool(
        device,
        queue_family,
        vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
    )?;
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
        .map_err(|e| {
            BackendError::InitializationFailed(format!(
                "Failed to allocate immediate command buffer: {:?}",
                e
            ))
        })?[0];
    let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }.map_err(
        |e| BackendError::InitializationFailed(format!("Failed to create fence: {:?}", e)),
    )?;
    Ok(ImmediateContext {
        pool,
        buffer,
        fence,
    })
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn viewport(&self) -> (u32, u32) {
        let extent = self.swapchain.extent();
        (extent.width, extent.height)
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> BackendResult<BufferId> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size.max(1))
            .usage(convert_buffer_usage(desc.heap, desc.flags))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }.map_err(|e| {
            BackendError::BufferCreationFailed(format!(
                "Failed to create buffer {}: {:?}",
                desc.label, e
            ))
        })?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let mut allocation = match self.allocate_memory(
            &desc.label,
            requirements,
            convert_heap_location(desc.heap),
            true,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free_allocation(&desc.label, Some(allocation));
            return Err(BackendError::BufferCreationFailed(format!(
                "Failed to bind buffer memory: {:?}",
                e
            )));
        }

        let zeroed = !desc.flags.contains(BufferFlags::NOT_ZEROED);
        if zeroed {
            match desc.heap {
                HeapLocation::Upload => {
                    if let Some(bytes) = allocation.mapped_slice_mut() {
                        bytes.fill(0);
                    }
                }
                HeapLocation::Default => {
                    self.submit_immediate(|device, cmd| unsafe {
                        device.cmd_fill_buffer(cmd, buffer, 0, vk::WHOLE_SIZE, 0);
                        let barriers = [vk::MemoryBarrier2::default()
                            .src_stage_mask(vk::PipelineStageFlags2::CLEAR)
                            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                            .dst_access_mask(
                                vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
                            )];
                        let dependency = vk::DependencyInfo::default().memory_barriers(&barriers);
                        device.cmd_pipeline_barrier2(cmd, &dependency);
                    })?;
                }
            }
        }

        let id = self.allocate_id();
        log::trace!(
            "Created buffer {} ({} bytes, {:?}, zeroed: {})",
            desc.label,
            desc.size,
            desc.heap,
            zeroed
        );
        self.buffers.insert(
            id,
            VkBuffer {
                label: desc.label.clone(),
                buffer,
                allocation: Some(allocation),
                heap: desc.heap,
            },
        );
        Ok(BufferId(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        let Some(mut entry) = self.buffers.remove(&buffer.0) else {
            log::warn!("Destroying unknown buffer {}", buffer.0);
            return;
        };
        unsafe { self.device.destroy_buffer(entry.buffer, None) };
        let allocation = entry.allocation.take();
        self.free_allocation(&entry.label, allocation);
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> BackendResult<()> {
        let target = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                id: buffer.0,
            })?;
        if target.heap != HeapLocation::Upload {
            return Err(BackendError::RecordingFailed(format!(
                "{} is not CPU visible",
                target.label
            )));
        }

        let label = &target.label;
        let bytes = target
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or_else(|| {
                BackendError::RecordingFailed(format!("{label} is not mapped for CPU access"))
            })?;
        let start = offset as usize;
        let range = bytes.get_mut(start..start + data.len()).ok_or_else(|| {
            BackendError::RecordingFailed(format!(
                "write of {} bytes at {} overruns {}",
                data.len(),
                offset,
                label
            ))
        })?;
        range.copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> BackendResult<TextureId> {
        let format = convert_texture_format(desc.format);
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: desc.width.max(1),
                height: desc.height.max(1),
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None) }.map_err(|e| {
            BackendError::TextureCreationFailed(format!(
                "Failed to create image {}: {:?}",
                desc.label, e
            ))
        })?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = match self.allocate_memory(
            &desc.label,
            requirements,
            gpu_allocator::MemoryLocation::GpuOnly,
            false,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(color_subresource_range());
        let view = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .and_then(|_| self.device.create_image_view(&view_info, None))
        };
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                self.free_allocation(&desc.label, Some(allocation));
                return Err(BackendError::TextureCreationFailed(format!(
                    "Failed to bind image {}: {:?}",
                    desc.label, e
                )));
            }
        };

        // Images start undefined; move them once into the layout of their
        // initial state.
        let (dst_stage, dst_access) = state_scope(desc.initial_state);
        let new_layout = state_layout(desc.initial_state);
        self.submit_immediate(|device, cmd| unsafe {
            let barriers = [vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::NONE)
                .src_access_mask(vk::AccessFlags2::NONE)
                .dst_stage_mask(dst_stage)
                .dst_access_mask(dst_access)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(new_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(color_subresource_range())];
            let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
            device.cmd_pipeline_barrier2(cmd, &dependency);
        })?;

        let id = self.allocate_id();
        log::trace!(
            "Created texture {} ({}x{} {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        self.textures.insert(
            id,
            VkTexture {
                label: desc.label.clone(),
                image,
                view,
                allocation: Some(allocation),
                width: desc.width,
                height: desc.height,
                format: desc.format,
            },
        );
        Ok(TextureId(id))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if self.is_backbuffer(texture) {
            log::warn!("Backbuffers are owned by the swapchain");
            return;
        }
        let Some(mut entry) = self.textures.remove(&texture.0) else {
            log::warn!("Destroying unknown texture {}", texture.0);
            return;
        };
        unsafe {
            self.device.destroy_image_view(entry.view, None);
            self.device.destroy_image(entry.image, None);
        }
        let allocation = entry.allocation.take();
        self.free_allocation(&entry.label, allocation);
    }

    fn texture_footprint(&self, texture: TextureId) -> BackendResult<TextureFootprint> {
        let entry = self
            .textures
            .get(&texture.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "texture",
                id: texture.0,
            })?;
        Ok(TextureFootprint::for_texture(
            entry.width,
            entry.height,
            entry.format,
        ))
    }

    fn backbuffer_count(&self) -> usize {
        self.backbuffers.len()
    }

    fn backbuffer(&self, index: usize) -> TextureId {
        self.backbuffers[index % self.backbuffers.len()]
    }

    fn backbuffer_format(&self) -> TextureFormat {
        texture_format_from_vk(self.swapchain.format()).unwrap_or(TextureFormat::Bgra8Unorm)
    }

    fn create_descriptor_heap(&mut self, capacity: u32) -> BackendResult<DescriptorHeapInfo> {
        if self.bindless.is_some() {
            return Err(BackendError::DescriptorHeapCreationFailed(
                "Only one shader-visible descriptor heap is supported".to_string(),
            ));
        }
        if capacity > self.max_bindless_descriptors {
            return Err(BackendError::DescriptorHeapCreationFailed(format!(
                "{} descriptors requested, device supports {}",
                capacity, self.max_bindless_descriptors
            )));
        }

        self.bindless = Some(BindlessSet::new(&self.device, capacity)?);
        Ok(DescriptorHeapInfo {
            cpu_start: CpuDescriptorHandle(0),
            gpu_start: GpuDescriptorHandle(0),
            increment: 1,
            capacity,
        })
    }

    fn write_descriptor(
        &mut self,
        slot: CpuDescriptorHandle,
        view: DescriptorView,
    ) -> BackendResult<()> {
        let bindless = self.bindless.as_ref().ok_or_else(|| {
            BackendError::DescriptorHeapCreationFailed("No descriptor heap created".to_string())
        })?;
        let index = u32::try_from(slot.0)
            .ok()
            .filter(|index| *index < bindless.capacity)
            .ok_or(BackendError::InvalidHandle {
                kind: "descriptor",
                id: slot.0,
            })?;

        match view {
            DescriptorView::StorageBuffer {
                buffer,
                offset,
                size,
            } => {
                let entry = self
                    .buffers
                    .get(&buffer.0)
                    .ok_or(BackendError::InvalidHandle {
                        kind: "buffer",
                        id: buffer.0,
                    })?;
                bindless.write_storage_buffer(&self.device, index, entry.buffer, offset, size);
            }
            DescriptorView::Texture(texture) => {
                let entry = self
                    .textures
                    .get(&texture.0)
                    .ok_or(BackendError::InvalidHandle {
                        kind: "texture",
                        id: texture.0,
                    })?;
                bindless.write_sampled_image(&self.device, index, entry.view);
            }
        }
        Ok(())
    }

    fn create_compute_pipeline(
        &mut self,
        shader: &ShaderBlob,
        group_size: u32,
    ) -> BackendResult<PipelineId> {
        if group_size == 0 || group_size > self.max_compute_group_size {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{}: group size {} outside 1..={}",
                shader.name, group_size, self.max_compute_group_size
            )));
        }
        let layout = self.pipeline_layout()?;
        let pipeline =
            pipeline::create_compute_pipeline(&self.device, layout, shader, group_size)?;
        let id = self.allocate_id();
        log::debug!(
            "Created compute pipeline {} ({} threads per group)",
            shader.name,
            group_size
        );
        self.pipelines.insert(
            id,
            VkPipeline {
                pipeline,
                bind_point: vk::PipelineBindPoint::COMPUTE,
            },
        );
        Ok(PipelineId(id))
    }

    fn create_render_pipeline(&mut self, desc: &RenderPipelineDesc) -> BackendResult<PipelineId> {
        let layout = self.pipeline_layout()?;
        let pipeline = pipeline::create_render_pipeline(&self.device, layout, desc)?;
        let id = self.allocate_id();
        log::debug!("Created render pipeline {}", desc.label);
        self.pipelines.insert(
            id,
            VkPipeline {
                pipeline,
                bind_point: vk::PipelineBindPoint::GRAPHICS,
            },
        );
        Ok(PipelineId(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        if let Some(entry) = self.pipelines.remove(&pipeline.0) {
            unsafe { self.device.destroy_pipeline(entry.pipeline, None) };
        }
    }

    fn create_command_list(&mut self, label: &str) -> BackendResult<CommandListId> {
        let pool = device::create_command_pool(
            &self.device,
            self.queue_family,
            vk::CommandPoolCreateFlags::empty(),
        )?;
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = match unsafe { self.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                return Err(BackendError::RecordingFailed(format!(
                    "Failed to allocate command buffer {}: {:?}",
                    label, e
                )));
            }
        };

        let id = self.allocate_id();
        self.command_lists.insert(
            id,
            VkCommandList {
                label: label.to_string(),
                pool,
                buffer,
                recording: false,
            },
        );
        Ok(CommandListId(id))
    }

    fn reset_command_list(&mut self, list: CommandListId) -> BackendResult<()> {
        let entry = self
            .command_lists
            .get_mut(&list.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "command list",
                id: list.0,
            })?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .reset_command_pool(entry.pool, vk::CommandPoolResetFlags::empty())
                .and_then(|_| self.device.begin_command_buffer(entry.buffer, &begin_info))
        }
        .map_err(|e| {
            BackendError::RecordingFailed(format!("Failed to reset {}: {:?}", entry.label, e))
        })?;
        entry.recording = true;
        Ok(())
    }

    fn close_command_list(&mut self, list: CommandListId) -> BackendResult<()> {
        let entry = self
            .command_lists
            .get_mut(&list.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "command list",
                id: list.0,
            })?;
        if !entry.recording {
            return Err(BackendError::RecordingFailed(format!(
                "{} is already closed",
                entry.label
            )));
        }
        unsafe { self.device.end_command_buffer(entry.buffer) }.map_err(|e| {
            BackendError::RecordingFailed(format!("Failed to close {}: {:?}", entry.label, e))
        })?;
        entry.recording = false;
        Ok(())
    }

    fn cmd_barriers(&mut self, list: CommandListId, barriers: &[Barrier]) {
        let Some(cmd) = self.recording_buffer(list) else {
            return;
        };

        let mut memory_barriers = Vec::new();
        let mut buffer_barriers = Vec::new();
        let mut image_barriers = Vec::new();

        for barrier in barriers {
            match *barrier {
                Barrier::Transition {
                    resource: ResourceId::Buffer(buffer),
                    before,
                    after,
                } => {
                    let Some(handle) = self.buffer_handle(buffer) else {
                        continue;
                    };
                    let (src_stage, src_access) = state_scope(before);
                    let (dst_stage, dst_access) = state_scope(after);
                    buffer_barriers.push(
                        vk::BufferMemoryBarrier2::default()
                            .src_stage_mask(src_stage)
                            .src_access_mask(src_access)
                            .dst_stage_mask(dst_stage)
                            .dst_access_mask(dst_access)
                            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .buffer(handle)
                            .offset(0)
                            .size(vk::WHOLE_SIZE),
                    );
                }
                Barrier::Transition {
                    resource: ResourceId::Texture(texture),
                    before,
                    after,
                } => {
                    let Some((image, _, _)) = self.image_target(texture) else {
                        continue;
                    };
                    // A swapchain image leaving Present for the first time has
                    // never been written.
                    let old_layout = if before == ResourceState::Present
                        && self.is_backbuffer(texture)
                        && self.swapchain.first_use()
                    {
                        vk::ImageLayout::UNDEFINED
                    } else {
                        state_layout(before)
                    };
                    let (src_stage, src_access) = state_scope(before);
                    let (dst_stage, dst_access) = state_scope(after);
                    image_barriers.push(
                        vk::ImageMemoryBarrier2::default()
                            .src_stage_mask(src_stage)
                            .src_access_mask(src_access)
                            .dst_stage_mask(dst_stage)
                            .dst_access_mask(dst_access)
                            .old_layout(old_layout)
                            .new_layout(state_layout(after))
                            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .image(image)
                            .subresource_range(color_subresource_range()),
                    );
                }
                Barrier::UnorderedAccess { .. } => {
                    memory_barriers.push(
                        vk::MemoryBarrier2::default()
                            .src_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
                            .src_access_mask(vk::AccessFlags2::SHADER_STORAGE_WRITE)
                            .dst_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
                            .dst_access_mask(
                                vk::AccessFlags2::SHADER_STORAGE_READ
                                    | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                            ),
                    );
                }
            }
        }

        let dependency = vk::DependencyInfo::default()
            .memory_barriers(&memory_barriers)
            .buffer_memory_barriers(&buffer_barriers)
            .image_memory_barriers(&image_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency) };
    }

    fn cmd_copy_buffer(
        &mut self,
        list: CommandListId,
        dst: BufferId,
        dst_offset: u64,
        src: BufferId,
        src_offset: u64,
        size: u64,
    ) {
        let Some(cmd) = self.recording_buffer(list) else {
            return;
        };
        let (Some(dst), Some(src)) = (self.buffer_handle(dst), self.buffer_handle(src)) else {
            return;
        };
        let regions = [vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        }];
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, &regions) };
    }

    fn cmd_copy_buffer_to_texture(
        &mut self,
        list: CommandListId,
        dst: TextureId,
        src: BufferId,
        footprint: TextureFootprint,
    ) {
        let Some(cmd) = self.recording_buffer(list) else {
            return;
        };
        let Some(src) = self.buffer_handle(src) else {
            return;
        };
        let Some(texture) = self.textures.get(&dst.0) else {
            log::error!("Copy into unknown texture {}", dst.0);
            return;
        };

        let bytes_per_pixel = texture.format.bytes_per_pixel() as u64;
        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length((footprint.row_pitch / bytes_per_pixel) as u32)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: texture.width,
                height: footprint.row_count,
                depth: 1,
            });

        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd,
                src,
                texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn cmd_set_descriptor_table(&mut self, list: CommandListId, base: GpuDescriptorHandle) {
        let Some(cmd) = self.recording_buffer(list) else {
            return;
        };
        let Some(bindless) = self.bindless.as_ref() else {
            log::error!("Descriptor table bound before a heap was created");
            return;
        };

        let sets = [bindless.set];
        let table_base = base.0 as u32;
        unsafe {
            for bind_point in [vk::PipelineBindPoint::COMPUTE, vk::PipelineBindPoint::GRAPHICS] {
                self.device.cmd_bind_descriptor_sets(
                    cmd,
                    bind_point,
                    bindless.pipeline_layout,
                    0,
                    &sets,
                    &[],
                );
            }
            self.device.cmd_push_constants(
                cmd,
                bindless.pipeline_layout,
                PUSH_CONSTANT_STAGES,
                0,
                bytemuck::bytes_of(&table_base),
            );
        }
    }

    fn cmd_set_compute_pipeline(&mut self, list: CommandListId, pipeline: PipelineId) {
        self.bind_pipeline(list, pipeline, vk::PipelineBindPoint::COMPUTE);
    }

    fn cmd_set_constants(&mut self, list: CommandListId, constants: &[u32]) {
        let Some(cmd) = self.recording_buffer(list) else {
            return;
        };
        let Some(bindless) = self.bindless.as_ref() else {
            log::error!("Constants set before a heap was created");
            return;
        };
        let bytes: &[u8] = bytemuck::cast_slice(constants);
        if bytes.len() as u32 > PUSH_CONSTANT_SIZE - PASS_CONSTANTS_OFFSET {
            log::error!("{} constants exceed the push constant block", constants.len());
            return;
        }
        unsafe {
            self.device.cmd_push_constants(
                cmd,
                bindless.pipeline_layout,
                PUSH_CONSTANT_STAGES,
                PASS_CONSTANTS_OFFSET,
                bytes,
            );
        }
    }

    fn cmd_dispatch(&mut self, list: CommandListId, groups_x: u32, groups_y: u32, groups_z: u32) {
        if let Some(cmd) = self.recording_buffer(list) {
            unsafe { self.device.cmd_dispatch(cmd, groups_x, groups_y, groups_z) };
        }
    }

    fn cmd_begin_render_pass(
        &mut self,
        list: CommandListId,
        target: TextureId,
        clear: Option<[f32; 4]>,
    ) {
        let Some(cmd) = self.recording_buffer(list) else {
            return;
        };
        if !self.is_backbuffer(target) {
            log::error!("Only backbuffers can be rendered to");
            return;
        }
        let Some((_, view, extent)) = self.image_target(target) else {
            return;
        };

        let (load_op, clear_value) = convert_load_op(clear);
        let color_attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(clear_value)];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.device.cmd_begin_rendering(cmd, &rendering_info);
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[render_area]);
        }
    }

    fn cmd_end_render_pass(&mut self, list: CommandListId) {
        if let Some(cmd) = self.recording_buffer(list) {
            unsafe { self.device.cmd_end_rendering(cmd) };
        }
    }

    fn cmd_set_render_pipeline(&mut self, list: CommandListId, pipeline: PipelineId) {
        self.bind_pipeline(list, pipeline, vk::PipelineBindPoint::GRAPHICS);
    }

    fn cmd_set_vertex_buffer(&mut self, list: CommandListId, buffer: BufferId, _stride: u32) {
        let Some(cmd) = self.recording_buffer(list) else {
            return;
        };
        if let Some(handle) = self.buffer_handle(buffer) {
            unsafe { self.device.cmd_bind_vertex_buffers(cmd, 0, &[handle], &[0]) };
        }
    }

    fn cmd_draw_indirect(&mut self, list: CommandListId, args: BufferId, offset: u64) {
        let Some(cmd) = self.recording_buffer(list) else {
            return;
        };
        if let Some(handle) = self.buffer_handle(args) {
            unsafe {
                self.device.cmd_draw_indirect(
                    cmd,
                    handle,
                    offset,
                    1,
                    INDIRECT_DRAW_ARGS_SIZE as u32,
                );
            }
        }
    }

    fn create_fence(&mut self, label: &str) -> BackendResult<FenceId> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { self.device.create_semaphore(&create_info, None) }.map_err(|e| {
            BackendError::InitializationFailed(format!(
                "Failed to create timeline semaphore {}: {:?}",
                label, e
            ))
        })?;

        let id = self.allocate_id();
        self.fences.insert(id, semaphore);
        Ok(FenceId(id))
    }

    fn submit(&mut self, list: CommandListId) -> BackendResult<()> {
        let entry = self
            .command_lists
            .get(&list.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "command list",
                id: list.0,
            })?;
        if entry.recording {
            return Err(BackendError::SubmitFailed(format!(
                "{} is still open",
                entry.label
            )));
        }
        let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(entry.buffer)];
        let waits = self.acquire_waits();
        self.queue_submit(&waits, &command_buffers, &[])
    }

    fn signal(&mut self, fence: FenceId, value: u64) -> BackendResult<()> {
        let semaphore = *self.fences.get(&fence.0).ok_or(BackendError::InvalidHandle {
            kind: "fence",
            id: fence.0,
        })?;
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        self.queue_submit(&[], &[], &signals)
    }

    fn completed_value(&self, fence: FenceId) -> u64 {
        let Some(&semaphore) = self.fences.get(&fence.0) else {
            log::error!("Unknown fence {}", fence.0);
            return 0;
        };
        unsafe { self.device.get_semaphore_counter_value(semaphore) }.unwrap_or_else(|e| {
            log::error!("Failed to read fence {}: {:?}", fence.0, e);
            0
        })
    }

    fn wait_fence(&self, fence: FenceId, value: u64) -> BackendResult<()> {
        let semaphore = *self.fences.get(&fence.0).ok_or(BackendError::InvalidHandle {
            kind: "fence",
            id: fence.0,
        })?;
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait_info, u64::MAX) }.map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            e => BackendError::FenceWaitFailed(format!("{:?}", e)),
        })
    }

    fn present(&mut self, vsync: bool) -> BackendResult<()> {
        let render_finished = self.swapchain.render_finished().ok_or_else(|| {
            BackendError::PresentFailed("No swapchain image acquired".to_string())
        })?;

        // Empty submission ordering presentation after all prior work.
        let waits = self.acquire_waits();
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(render_finished)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        self.queue_submit(&waits, &[], &signals)?;

        let healthy = self.swapchain.present(self.queue)?;
        if !healthy || vsync != self.swapchain.vsync() {
            self.recreate_swapchain(vsync)?;
        }
        self.acquire_next_image()
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            e => BackendError::FenceWaitFailed(format!("Failed to wait for idle: {:?}", e)),
        })
    }
}

impl VulkanBackend {
    fn pipeline_layout(&self) -> BackendResult<vk::PipelineLayout> {
        self.bindless
            .as_ref()
            .map(|bindless| bindless.pipeline_layout)
            .ok_or_else(|| {
                BackendError::PipelineCreationFailed(
                    "The descriptor heap must be created before pipelines".to_string(),
                )
            })
    }

    fn bind_pipeline(
        &mut self,
        list: CommandListId,
        pipeline: PipelineId,
        bind_point: vk::PipelineBindPoint,
    ) {
        let Some(cmd) = self.recording_buffer(list) else {
            return;
        };
        match self.pipelines.get(&pipeline.0) {
            Some(entry) if entry.bind_point == bind_point => unsafe {
                self.device.cmd_bind_pipeline(cmd, bind_point, entry.pipeline);
            },
            Some(_) => log::error!("Pipeline {} bound at the wrong bind point", pipeline.0),
            None => log::error!("Unknown pipeline {}", pipeline.0),
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for (_, entry) in self.command_lists.drain() {
                self.device.destroy_command_pool(entry.pool, None);
            }
            for (_, semaphore) in self.fences.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }
            for (_, entry) in self.pipelines.drain() {
                self.device.destroy_pipeline(entry.pipeline, None);
            }
            if let Some(mut bindless) = self.bindless.take() {
                bindless.destroy(&self.device);
            }

            let mut allocations = Vec::new();
            for (_, mut entry) in self.buffers.drain() {
                self.device.destroy_buffer(entry.buffer, None);
                allocations.extend(entry.allocation.take());
            }
            for (_, mut entry) in self.textures.drain() {
                self.device.destroy_image_view(entry.view, None);
                self.device.destroy_image(entry.image, None);
                allocations.extend(entry.allocation.take());
            }
            if let Some(mut allocator) = self.allocator.take() {
                for allocation in allocations {
                    if let Err(e) = allocator.free(allocation) {
                        log::error!("Failed to free allocation: {e}");
                    }
                }
            }

            self.device.destroy_fence(self.immediate.fence, None);
            self.device.destroy_command_pool(self.immediate.pool, None);
            self.swapchain.destroy(&self.device);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let (Some(debug_utils), Some(messenger)) =
                (self.debug_utils.as_ref(), self.debug_messenger.take())
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        log::info!("Vulkan backend destroyed");
    }
}
