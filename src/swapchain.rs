//! The swapchain: image pool construction, acquire/present entry points
//! and the presentation dispatch between the zero-copy bridge path and
//! the shared-memory fallback.
//!
//! # Locking
//!
//! Two locks exist per swapchain. The lifecycle status lock (inside
//! [`FrameLifecycle`]) guards statuses, pending completions and the
//! release queue. The structural lock here guards the image resources
//! (driver handles, memory, fences) during creation, presentation and
//! teardown. The structural lock is never acquired while the status lock
//! is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;
use drm_fourcc::DrmFourcc;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{BridgeAvailability, BridgeClient, FramePlane};
use crate::config::{BridgeConfig, ENV_ALLOW_MAILBOX};
use crate::device::DeviceContext;
use crate::engine::{CompletionPoller, PresentEngine};
use crate::error::{AcquireResult, PresentOutcome, WsiError};
use crate::fence::PresentFence;
use crate::formats::{self, drm_mod, fourcc_plane_count, ImageRequirements};
use crate::lifecycle::{AcquireTimeout, FrameLifecycle};
use crate::memory::{
    AllocationRequest, AllocationResult, AllocatorFormat, DmaBufAllocator, ExternalMemory,
};
use crate::pacing::FramePacer;
use crate::surface::{HostFrame, ShmPresenter, SurfaceProvider};

/// Hard bound on images per swapchain; bridge mode raises the image count
/// to this for safer dma-buf reuse.
pub const MAX_SWAPCHAIN_IMAGES: usize = 6;

/// How many candidate formats to enumerate in the log before eliding.
const MAX_LOGGED_CANDIDATES: usize = 8;

/// The application-facing present modes this backend distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentMode {
    Fifo,
    Mailbox,
    Immediate,
}

/// Parameters for swapchain creation.
#[derive(Debug, Clone)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub min_image_count: u32,
    pub present_mode: PresentMode,
}

/// One application present call for one image.
pub struct PresentRequest<'a> {
    pub image_index: u32,
    /// Application-supplied ordering token; 0 when unused.
    pub present_id: u64,
    /// Semaphores the completion fence must wait on.
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Application fence to signal once the presented image's rendering
    /// has drained from the queue.
    pub release_fence: Option<vk::Fence>,
    /// Per-present mode override; recorded, and irrelevant to bridge
    /// pacing which is bounded independently of the present mode.
    pub present_mode_override: Option<PresentMode>,
}

/// Image creation parameters fixed once per swapchain by format
/// negotiation and reused for every image.
struct ImageTemplate {
    fourcc: DrmFourcc,
    modifier: u64,
    require_non_disjoint: bool,
    /// Memory plane count of the selected modifier.
    memory_plane_count: u32,
    plane_layouts: Vec<vk::SubresourceLayout>,
}

struct ImageResources {
    image: vk::Image,
    memory: ExternalMemory,
    fence: PresentFence,
}

/// State shared with the background engine.
struct SwapchainShared {
    device: Arc<DeviceContext>,
    lifecycle: Arc<FrameLifecycle>,
    images: Mutex<Vec<ImageResources>>,
}

struct FencePoller {
    shared: Arc<SwapchainShared>,
}

impl CompletionPoller for FencePoller {
    fn poll_retired(&self, image_index: usize) -> bool {
        let images = self.shared.images.lock().expect("image lock poisoned");
        match images.get(image_index) {
            // A fence error must not wedge the engine; treat as retired
            // and let the next present surface the failure.
            Some(resources) => resources.fence.is_signalled().unwrap_or(true),
            None => true,
        }
    }
}

pub struct Swapchain {
    shared: Arc<SwapchainShared>,
    surface: Arc<dyn SurfaceProvider>,
    engine: Option<PresentEngine>,
    use_bridge: bool,
    bridge: Option<Mutex<BridgeClient>>,
    availability: BridgeAvailability,
    pacer: Mutex<FramePacer>,
    shm: Option<Mutex<Box<dyn ShmPresenter>>>,
    present_mode: PresentMode,
    width: u32,
    height: u32,
    release_lag_logged: AtomicBool,
}

impl Swapchain {
    /// Create the swapchain: negotiate buffers, build the image pool and
    /// start the presentation engine.
    pub fn new(
        device: Arc<DeviceContext>,
        surface: Arc<dyn SurfaceProvider>,
        mut allocator: Box<dyn DmaBufAllocator>,
        shm: Option<Box<dyn ShmPresenter>>,
        desc: &SwapchainDesc,
        config: &BridgeConfig,
        availability: BridgeAvailability,
    ) -> Result<Self, WsiError> {
        let bridge_client = BridgeClient::from_config(config);
        let bridge_requested = bridge_client.is_some();
        let runtime_disabled = availability.is_disabled();
        let use_bridge = bridge_requested && !runtime_disabled;

        let mut present_mode = desc.present_mode;
        if use_bridge
            && matches!(present_mode, PresentMode::Mailbox | PresentMode::Immediate)
            && !config.allow_mailbox
        {
            warn!(
                "forcing FIFO present mode for bridge safety (set {}=1 to keep the requested mode)",
                ENV_ALLOW_MAILBOX
            );
            present_mode = PresentMode::Fifo;
        }

        let mut image_count = (desc.min_image_count.max(1) as usize).min(MAX_SWAPCHAIN_IMAGES);
        if use_bridge && image_count < MAX_SWAPCHAIN_IMAGES {
            image_count = MAX_SWAPCHAIN_IMAGES;
            info!(
                "bridge mode: raising swapchain image count to {} for safer dma-buf reuse",
                image_count
            );
        }

        let lifecycle = Arc::new(FrameLifecycle::new(image_count));
        let shared = Arc::new(SwapchainShared {
            device: Arc::clone(&device),
            lifecycle: Arc::clone(&lifecycle),
            images: Mutex::new(Vec::with_capacity(image_count)),
        });

        let mut shm = shm;
        let pacer;
        if use_bridge {
            info!("bridge socket configured: using dma-buf bridge presentation path");
            let template = negotiate_bridge_template(&device, allocator.as_mut(), desc, config)?;
            if let Err(err) =
                build_bridge_images(&shared, allocator.as_mut(), &template, desc, image_count)
            {
                destroy_images(&shared);
                return Err(err);
            }
            pacer = FramePacer::for_bridge(config.effective_bridge_fps(), config.has_fps_override());
        } else {
            if bridge_requested && runtime_disabled {
                warn!(
                    "bridge disabled after a previous runtime failure; \
                     using the shared-memory path for this swapchain"
                );
            }
            let presenter = shm.as_mut().ok_or_else(|| {
                error!("no shared-memory presenter supplied and the bridge path is unavailable");
                WsiError::InitializationFailed("no presentation path available".into())
            })?;
            if !presenter.is_available(surface.as_ref()) {
                error!("shared-memory presenter is not available for this surface");
                return Err(WsiError::InitializationFailed(
                    "shared-memory presenter unavailable".into(),
                ));
            }
            presenter.init(surface.as_ref())?;
            if let Err(err) = build_host_visible_images(&shared, &surface, desc, image_count) {
                destroy_images(&shared);
                return Err(err);
            }
            pacer = FramePacer::disabled();
        }

        let poller = Box::new(FencePoller {
            shared: Arc::clone(&shared),
        });
        let engine = match PresentEngine::spawn(Arc::clone(&lifecycle), poller) {
            Ok(engine) => engine,
            Err(err) => {
                error!("failed to spawn the presentation engine: {}", err);
                destroy_images(&shared);
                return Err(WsiError::InitializationFailed(
                    "presentation engine thread".into(),
                ));
            }
        };

        Ok(Self {
            shared,
            surface,
            engine: Some(engine),
            use_bridge,
            bridge: if use_bridge {
                bridge_client.map(Mutex::new)
            } else {
                None
            },
            availability,
            pacer: Mutex::new(pacer),
            shm: shm.map(Mutex::new),
            present_mode,
            width: desc.width,
            height: desc.height,
            release_lag_logged: AtomicBool::new(false),
        })
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn present_mode(&self) -> PresentMode {
        self.present_mode
    }

    pub fn is_bridge_active(&self) -> bool {
        self.use_bridge
    }

    pub fn image_count(&self) -> usize {
        self.shared.lifecycle.image_count()
    }

    /// The driver image handles, index-aligned with acquire results.
    pub fn images(&self) -> Vec<vk::Image> {
        self.shared
            .images
            .lock()
            .expect("image lock poisoned")
            .iter()
            .map(|resources| resources.image)
            .collect()
    }

    /// Highest present id whose completion has been confirmed.
    pub fn last_completed_present_id(&self) -> u64 {
        self.shared.lifecycle.last_completed_present_id()
    }

    /// Acquire the next free image.
    ///
    /// `timeout_ns` of 0 polls, `u64::MAX` waits indefinitely, anything
    /// else is a deadline in nanoseconds. Not-ready and timeout are
    /// distinct, retryable outcomes, never errors.
    pub fn acquire_next_image(&self, timeout_ns: u64) -> Result<AcquireResult, WsiError> {
        self.shared
            .lifecycle
            .acquire(AcquireTimeout::from_ns(timeout_ns))
    }

    /// Present an acquired image.
    pub fn queue_present(
        &self,
        queue: vk::Queue,
        request: &PresentRequest<'_>,
    ) -> Result<PresentOutcome, WsiError> {
        if let Some(err) = self.shared.lifecycle.error() {
            return Err(err);
        }
        let index = request.image_index as usize;
        if index >= self.image_count() {
            return Err(WsiError::InitializationFailed(format!(
                "present of out-of-range image index {}",
                index
            )));
        }
        if let Some(mode) = request.present_mode_override {
            trace!(?mode, "per-present mode override");
        }

        // Arm the completion fence behind the application's rendering.
        {
            let mut images = self.shared.images.lock().expect("image lock poisoned");
            images[index]
                .fence
                .set_payload(queue, request.wait_semaphores)?;
        }
        // Queue ordering makes the release fence signal after the same
        // rendering the completion fence guards.
        if let Some(release_fence) = request.release_fence {
            self.shared
                .device
                .queue_submit_signal_fence(queue, &[], release_fence)?;
        }

        let Some(serial) = self
            .shared
            .lifecycle
            .begin_present(index, request.present_id)
        else {
            // Engine stopped while we were backpressured; the image was
            // already released.
            return Err(WsiError::OutOfDate);
        };

        // The frame must be fully rendered before it leaves the process.
        {
            let images = self.shared.images.lock().expect("image lock poisoned");
            images[index].fence.wait(u64::MAX)?;
        }

        let result = if self.use_bridge {
            self.present_via_bridge(index)
        } else {
            self.present_via_shm(index, serial)
        };
        result?;

        if self.surface_size_changed() {
            Ok(PresentOutcome::Suboptimal)
        } else {
            Ok(PresentOutcome::Success)
        }
    }

    fn present_via_bridge(&self, index: usize) -> Result<(), WsiError> {
        let xid = self.surface.window();

        let submitted = {
            let images = self.shared.images.lock().expect("image lock poisoned");
            let memory = &images[index].memory;
            let fourcc = formats::strip_alpha(memory.fourcc());
            let planes: Vec<FramePlane<'_>> = memory
                .planes()
                .iter()
                .map(|plane| FramePlane {
                    fd: plane.fd(),
                    offset: plane.offset,
                    stride: plane.stride,
                })
                .collect();

            let Some(bridge) = &self.bridge else {
                return Err(WsiError::OutOfDate);
            };
            let mut bridge = bridge.lock().expect("bridge lock poisoned");
            bridge.present_frame(
                xid,
                self.width,
                self.height,
                fourcc as u32,
                memory.modifier(),
                &planes,
            )
        };

        if !submitted {
            warn!("bridge submit failed: window={:#x} image={}", xid, index);
            self.shared.lifecycle.set_error(WsiError::OutOfDate);
            if !self.availability.disable() {
                warn!(
                    "disabling the bridge for this process after a runtime failure; \
                     recreate the swapchain to continue on the shared-memory path"
                );
            }
            // Failure drains the whole lag queue at once, then the failed
            // image itself.
            self.shared.lifecycle.drain_deferred();
            self.shared.lifecycle.release_now(index);
            return Err(WsiError::OutOfDate);
        }

        // Keep buffers unavailable for reuse until pacing has been
        // applied, then hold the just-submitted image behind the lag.
        self.pacer.lock().expect("pacer lock poisoned").throttle();

        let image_count = self.image_count();
        let release_lag = if image_count > 1 { image_count - 1 } else { 1 };
        if !self.release_lag_logged.swap(true, Ordering::Relaxed) {
            info!(
                "bridge: delayed image release enabled (lag={} frame{}, swapchain_images={})",
                release_lag,
                if release_lag == 1 { "" } else { "s" },
                image_count
            );
        }
        self.shared.lifecycle.defer_release(index, release_lag);
        Ok(())
    }

    fn present_via_shm(&self, index: usize, serial: u64) -> Result<(), WsiError> {
        let result = {
            let mut images = self.shared.images.lock().expect("image lock poisoned");
            let resources = &mut images[index];
            let layout = resources
                .memory
                .host_layout()
                .copied()
                .ok_or(WsiError::OutOfDate)?;
            let pixels = resources.memory.map_host_memory()?;
            let frame = HostFrame {
                image_index: index as u32,
                width: self.width,
                height: self.height,
                row_pitch: layout.row_pitch,
                pixels,
            };
            let Some(shm) = &self.shm else {
                return Err(WsiError::OutOfDate);
            };
            let mut shm = shm.lock().expect("presenter lock poisoned");
            shm.present(&frame, serial as u32)
        };

        match result {
            Ok(()) => {
                // No in-flight compositor lag on this path; the buffer is
                // immediately reusable.
                self.shared.lifecycle.release_now(index);
                Ok(())
            }
            Err(err) => {
                error!("shared-memory present failed: {}", err);
                self.shared.lifecycle.set_error(WsiError::OutOfDate);
                self.shared.lifecycle.release_now(index);
                Err(WsiError::OutOfDate)
            }
        }
    }

    fn surface_size_changed(&self) -> bool {
        match self.surface.size_and_depth() {
            Some((width, height, _)) => width != self.width || height != self.height,
            None => false,
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Stop and join the engine before touching image state; this also
        // unblocks anything stuck in acquire or backpressure.
        self.engine.take();

        // Release whatever the bridge lag still holds.
        self.shared.lifecycle.drain_deferred();

        // Announce the end of the stream, then drop the connection,
        // before destroying the buffers it referenced.
        if let Some(bridge) = &self.bridge {
            bridge
                .lock()
                .expect("bridge lock poisoned")
                .stop_stream(self.surface.window());
        }
        self.bridge = None;

        destroy_images(&self.shared);
        debug!("swapchain torn down");
    }
}

/// Negotiate the fourcc + modifier every image of this swapchain will
/// use, without allocating backing memory yet.
fn negotiate_bridge_template(
    device: &Arc<DeviceContext>,
    allocator: &mut dyn DmaBufAllocator,
    desc: &SwapchainDesc,
    config: &BridgeConfig,
) -> Result<ImageTemplate, WsiError> {
    let requirements = ImageRequirements {
        format: desc.format,
        width: desc.width,
        height: desc.height,
        usage: desc.usage,
        flags: vk::ImageCreateFlags::empty(),
    };

    // SAFETY: the device context guarantees valid instance and physical
    // device handles.
    let compatible = unsafe {
        formats::surface_compatible_formats(
            device.instance(),
            device.physical_device(),
            &requirements,
        )
    }
    .ok_or_else(|| {
        error!("no dma-buf fourcc mapping for {:?}", desc.format);
        WsiError::FormatNotSupported
    })?;

    if compatible.importable.is_empty() {
        error!("no importable dma-buf formats available for the bridge path");
        return Err(WsiError::InitializationFailed(
            "no importable dma-buf formats".into(),
        ));
    }

    info!(
        "bridge: importable dma-buf candidates={}",
        compatible.importable.len()
    );
    for (index, (format, _)) in compatible
        .importable
        .iter()
        .take(MAX_LOGGED_CANDIDATES)
        .enumerate()
    {
        info!(
            "bridge: candidate[{}] fourcc={:?} modifier={:#x}",
            index, format.fourcc, format.modifier
        );
    }
    if compatible.importable.len() > MAX_LOGGED_CANDIDATES {
        info!(
            "bridge: ... {} more candidates not shown",
            compatible.importable.len() - MAX_LOGGED_CANDIDATES
        );
    }

    let candidates: Vec<AllocatorFormat> = compatible
        .importable
        .iter()
        .map(|(format, require_non_disjoint)| AllocatorFormat {
            format: *format,
            require_non_disjoint: *require_non_disjoint,
        })
        .collect();

    // Modifier preference: tiled layouts by default for bandwidth, linear
    // on request for maximum cross-device compatibility.
    let selection: Vec<AllocatorFormat> = if config.prefer_linear {
        let linear: Vec<AllocatorFormat> = candidates
            .iter()
            .copied()
            .filter(|candidate| candidate.format.modifier == drm_mod::LINEAR)
            .collect();
        if linear.is_empty() {
            warn!("bridge: linear layout unavailable, falling back to allocator default");
            candidates.clone()
        } else {
            linear
        }
    } else {
        let non_linear: Vec<AllocatorFormat> = candidates
            .iter()
            .copied()
            .filter(|candidate| candidate.format.modifier != drm_mod::LINEAR)
            .collect();
        if non_linear.is_empty() {
            warn!(
                "bridge: non-linear layouts unavailable, \
                 falling back to allocator default (may pick linear)"
            );
            candidates.clone()
        } else {
            non_linear
        }
    };

    let request = AllocationRequest {
        candidates: &selection,
        width: desc.width,
        height: desc.height,
        no_memory: true,
    };
    let template_alloc = allocator.allocate(&request).map_err(|err| {
        error!("format selection allocation failed: {}", err);
        WsiError::from(err)
    })?;

    info!(
        "bridge: selected dma-buf fourcc={:?} modifier={:#x}",
        template_alloc.format.fourcc, template_alloc.format.modifier
    );
    let stripped = formats::strip_alpha(template_alloc.format.fourcc);
    if stripped != template_alloc.format.fourcc {
        info!(
            "bridge: presentation fourcc remap enabled {:?} -> {:?}",
            template_alloc.format.fourcc, stripped
        );
    }

    let memory_plane_count = compatible
        .modifier_props
        .iter()
        .find(|props| props.modifier == template_alloc.format.modifier)
        .map(|props| props.plane_count)
        .unwrap_or(1);
    let require_non_disjoint = selection
        .iter()
        .find(|candidate| candidate.format == template_alloc.format)
        .map(|candidate| candidate.require_non_disjoint)
        .unwrap_or(false);

    Ok(ImageTemplate {
        fourcc: template_alloc.format.fourcc,
        modifier: template_alloc.format.modifier,
        require_non_disjoint,
        memory_plane_count,
        plane_layouts: template_plane_layouts(&template_alloc),
    })
}

fn template_plane_layouts(allocation: &AllocationResult) -> Vec<vk::SubresourceLayout> {
    let num_planes = fourcc_plane_count(allocation.format.fourcc) as usize;
    (0..num_planes)
        .map(|plane| vk::SubresourceLayout {
            offset: u64::from(allocation.offsets[plane]),
            size: 0,
            row_pitch: allocation.strides[plane].max(0) as u64,
            array_pitch: 0,
            depth_pitch: 0,
        })
        .collect()
}

fn create_modifier_image(
    device: &DeviceContext,
    desc: &SwapchainDesc,
    template: &ImageTemplate,
) -> Result<vk::Image, WsiError> {
    let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
    let mut drm_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
        .drm_format_modifier(template.modifier)
        .plane_layouts(&template.plane_layouts);

    let mut flags = vk::ImageCreateFlags::empty();
    if template.memory_plane_count > 1 {
        flags |= vk::ImageCreateFlags::DISJOINT;
    }

    let info = vk::ImageCreateInfo::default()
        .flags(flags)
        .image_type(vk::ImageType::TYPE_2D)
        .format(desc.format)
        .extent(vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
        .usage(desc.usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .push_next(&mut drm_info)
        .push_next(&mut external_info);

    device.create_image(&info)
}

fn build_bridge_images(
    shared: &Arc<SwapchainShared>,
    allocator: &mut dyn DmaBufAllocator,
    template: &ImageTemplate,
    desc: &SwapchainDesc,
    image_count: usize,
) -> Result<(), WsiError> {
    let candidate = AllocatorFormat {
        format: formats::DrmFormat {
            fourcc: template.fourcc,
            modifier: template.modifier,
        },
        require_non_disjoint: template.require_non_disjoint,
    };

    for index in 0..image_count {
        let request = AllocationRequest {
            candidates: std::slice::from_ref(&candidate),
            width: desc.width,
            height: desc.height,
            no_memory: false,
        };
        let allocation = allocator.allocate(&request).map_err(|err| {
            error!("dma-buf allocation for image {} failed: {}", index, err);
            WsiError::from(err)
        })?;

        let mut memory = ExternalMemory::from_allocation(Arc::clone(&shared.device), &allocation)?;
        let image = create_modifier_image(&shared.device, desc, template)?;
        if let Err(err) = memory.import_and_bind(image) {
            shared.device.destroy_image(image);
            return Err(err);
        }
        let fence = match PresentFence::new(Arc::clone(&shared.device)) {
            Ok(fence) => fence,
            Err(err) => {
                shared.device.destroy_image(image);
                return Err(err);
            }
        };

        shared
            .images
            .lock()
            .expect("image lock poisoned")
            .push(ImageResources {
                image,
                memory,
                fence,
            });
        shared.lifecycle.mark_free(index);
    }
    Ok(())
}

fn build_host_visible_images(
    shared: &Arc<SwapchainShared>,
    surface: &Arc<dyn SurfaceProvider>,
    desc: &SwapchainDesc,
    image_count: usize,
) -> Result<(), WsiError> {
    let fourcc =
        formats::vk_to_drm_fourcc(desc.format).unwrap_or(DrmFourcc::Xrgb8888);
    if surface.size_and_depth().is_none() {
        warn!("could not query surface size and depth, proceeding with swapchain extent");
    }

    let optimal = vk::MemoryPropertyFlags::HOST_VISIBLE
        | vk::MemoryPropertyFlags::HOST_COHERENT
        | vk::MemoryPropertyFlags::HOST_CACHED;
    let required = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

    for index in 0..image_count {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::PREINITIALIZED);
        let image = shared.device.create_image(&info)?;

        let mut memory = ExternalMemory::host_visible(
            Arc::clone(&shared.device),
            fourcc,
            required,
            optimal,
        );
        if let Err(err) = memory.allocate_host_visible_and_bind(image) {
            shared.device.destroy_image(image);
            return Err(err);
        }
        let fence = match PresentFence::new(Arc::clone(&shared.device)) {
            Ok(fence) => fence,
            Err(err) => {
                shared.device.destroy_image(image);
                return Err(err);
            }
        };

        shared
            .images
            .lock()
            .expect("image lock poisoned")
            .push(ImageResources {
                image,
                memory,
                fence,
            });
        shared.lifecycle.mark_free(index);
    }
    Ok(())
}

fn destroy_images(shared: &Arc<SwapchainShared>) {
    let mut images = shared.images.lock().expect("image lock poisoned");
    for (index, resources) in images.drain(..).enumerate() {
        shared.lifecycle.invalidate(index);
        shared.device.destroy_image(resources.image);
        // Memory and fence clean up in their own Drop impls, after the
        // image that referenced them is gone.
        drop(resources);
    }
}
