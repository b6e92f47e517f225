//! The injected driver context.
//!
//! The graphics driver is an opaque native library reached through loaded
//! function tables; this crate never links it and never consults ambient
//! global state to find it. Everything the presentation backend needs from
//! the driver - image create/destroy, memory allocate/import/free/bind,
//! the completion-fence primitive - goes through a `DeviceContext` the
//! embedder constructs from its own instance/device handles.
//!
//! The context borrows the driver objects; it never destroys the instance
//! or device on drop (the embedder owns those).

use ash::vk;
use tracing::debug;

use crate::error::WsiError;

/// Per-device driver access for one or more swapchains.
pub struct DeviceContext {
    instance: ash::Instance,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    external_memory_fd: ash::khr::external_memory_fd::Device,
    memory_props: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceContext {
    /// Wrap already-loaded dispatch tables.
    ///
    /// # Safety
    ///
    /// - `physical_device` must belong to `instance`
    /// - `device` must have been created from `physical_device` with
    ///   `VK_KHR_external_memory_fd` and
    ///   `VK_EXT_image_drm_format_modifier` enabled for the dma-buf path
    pub unsafe fn new(
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        let external_memory_fd = ash::khr::external_memory_fd::Device::new(&instance, &device);
        let memory_props = instance.get_physical_device_memory_properties(physical_device);
        debug!(
            memory_types = memory_props.memory_type_count,
            memory_heaps = memory_props.memory_heap_count,
            "device context created"
        );
        Self {
            instance,
            device,
            physical_device,
            external_memory_fd,
            memory_props,
        }
    }

    /// Load dispatch tables from raw handles.
    ///
    /// # Safety
    ///
    /// The handles must be valid, alive for the lifetime of the context,
    /// and satisfy the requirements of [`new`](Self::new).
    pub unsafe fn from_raw_handles(
        entry: &ash::Entry,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
        device: vk::Device,
    ) -> Self {
        let instance = ash::Instance::load(entry.static_fn(), instance);
        let device = ash::Device::load(instance.fp_v1_0(), device);
        Self::new(instance, physical_device, device)
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_props
    }

    /// Find a memory type matching `type_bits` and the property mask.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..self.memory_props.memory_type_count).find(|&index| {
            (type_bits & (1 << index)) != 0
                && self.memory_props.memory_types[index as usize]
                    .property_flags
                    .contains(properties)
        })
    }

    /// Query which memory types can import this dma-buf fd.
    pub fn memory_fd_properties(
        &self,
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        fd: i32,
    ) -> Result<vk::MemoryFdPropertiesKHR<'static>, WsiError> {
        let mut props = vk::MemoryFdPropertiesKHR::default();
        // SAFETY: fd is a live file descriptor owned by the caller; the
        // query does not retain it.
        unsafe {
            self.external_memory_fd
                .get_memory_fd_properties(handle_type, fd, &mut props)?;
        }
        Ok(props)
    }

    pub fn create_image(&self, info: &vk::ImageCreateInfo) -> Result<vk::Image, WsiError> {
        // SAFETY: info is a fully initialized create-info chain.
        let image = unsafe { self.device.create_image(info, None)? };
        Ok(image)
    }

    pub fn destroy_image(&self, image: vk::Image) {
        if image != vk::Image::null() {
            // SAFETY: the caller guarantees the image is idle and ours.
            unsafe { self.device.destroy_image(image, None) };
        }
    }

    pub fn allocate_memory(
        &self,
        info: &vk::MemoryAllocateInfo,
    ) -> Result<vk::DeviceMemory, WsiError> {
        // SAFETY: info is fully initialized; import chains transfer fd
        // ownership only on success (checked by the caller).
        let memory = unsafe { self.device.allocate_memory(info, None)? };
        Ok(memory)
    }

    pub fn free_memory(&self, memory: vk::DeviceMemory) {
        if memory != vk::DeviceMemory::null() {
            // SAFETY: the caller guarantees no resource still binds this.
            unsafe { self.device.free_memory(memory, None) };
        }
    }

    pub fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), WsiError> {
        // SAFETY: image and memory come from this device.
        unsafe { self.device.bind_image_memory(image, memory, offset)? };
        Ok(())
    }

    pub fn bind_image_memory2(&self, infos: &[vk::BindImageMemoryInfo]) -> Result<(), WsiError> {
        // SAFETY: every info references handles from this device.
        unsafe { self.device.bind_image_memory2(infos)? };
        Ok(())
    }

    pub fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        // SAFETY: image comes from this device.
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    pub fn image_subresource_layout(
        &self,
        image: vk::Image,
        subresource: vk::ImageSubresource,
    ) -> vk::SubresourceLayout {
        // SAFETY: image comes from this device and is linear or
        // modifier-tiled, as required for this query.
        unsafe { self.device.get_image_subresource_layout(image, subresource) }
    }

    pub fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
    ) -> Result<*mut std::ffi::c_void, WsiError> {
        // SAFETY: memory is host-visible and not already mapped.
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())?
        };
        Ok(ptr)
    }

    pub fn unmap_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: memory is currently mapped.
        unsafe { self.device.unmap_memory(memory) };
    }

    pub fn create_fence(&self) -> Result<vk::Fence, WsiError> {
        let info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        // SAFETY: plain fence creation.
        let fence = unsafe { self.device.create_fence(&info, None)? };
        Ok(fence)
    }

    pub fn destroy_fence(&self, fence: vk::Fence) {
        if fence != vk::Fence::null() {
            // SAFETY: the caller guarantees no submission still signals it.
            unsafe { self.device.destroy_fence(fence, None) };
        }
    }

    pub fn reset_fence(&self, fence: vk::Fence) -> Result<(), WsiError> {
        // SAFETY: fence comes from this device.
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    /// `true` when the fence has signalled.
    pub fn fence_status(&self, fence: vk::Fence) -> Result<bool, WsiError> {
        // SAFETY: fence comes from this device.
        let signalled = unsafe { self.device.get_fence_status(fence)? };
        Ok(signalled)
    }

    /// Bounded wait; `Ok(false)` on timeout.
    pub fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool, WsiError> {
        // SAFETY: fence comes from this device.
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Submit an empty batch that waits on `wait_semaphores` and signals
    /// `fence` - the completion-fence primitive behind every present.
    pub fn queue_submit_signal_fence(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<(), WsiError> {
        let wait_stages =
            vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);
        // SAFETY: queue, semaphores and fence all come from this device;
        // external synchronization of the queue is the caller's contract.
        unsafe { self.device.queue_submit(queue, &[submit], fence)? };
        Ok(())
    }
}
