//! External memory management for swapchain images.
//!
//! Turns an abstract image request into concrete, importable multi-plane
//! dma-buf memory (or a host-visible allocation for the shared-memory
//! path) and binds it to the driver image exactly once.
//!
//! # File descriptor ownership
//!
//! The allocator hands over raw plane fds, where a non-disjoint buffer
//! repeats the same fd for every plane. Each distinct fd is adopted into
//! one `Arc<OwnedFd>` shared by the planes that reference it, so closing
//! happens exactly once, in `Drop`, with no "seen earlier" bookkeeping.
//! Imports duplicate the fd first; the driver owns the duplicate only
//! after a successful import, and the original stays here for the
//! lifetime of the image (the bridge sends borrowed copies of it).

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use ash::vk;
use drm_fourcc::DrmFourcc;
use tracing::{error, trace};

use crate::device::DeviceContext;
use crate::error::{AllocError, WsiError};
use crate::formats::{fourcc_plane_count, DrmFormat};

/// Upper bound on planes per allocation, matching the wire protocol.
pub const MAX_PLANES: usize = crate::protocol::MAX_PLANES;

/// Aspect flags for disjoint per-plane binds of modifier-tiled images.
const MEMORY_PLANE_ASPECTS: [vk::ImageAspectFlags; MAX_PLANES] = [
    vk::ImageAspectFlags::MEMORY_PLANE_0_EXT,
    vk::ImageAspectFlags::MEMORY_PLANE_1_EXT,
    vk::ImageAspectFlags::MEMORY_PLANE_2_EXT,
    vk::ImageAspectFlags::MEMORY_PLANE_3_EXT,
];

/// A fourcc + modifier candidate handed to the allocator.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorFormat {
    pub format: DrmFormat,
    /// The driver cannot use disjoint images with this modifier; all
    /// planes must share one backing allocation.
    pub require_non_disjoint: bool,
}

/// One allocation request.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest<'a> {
    /// Acceptable formats, in preference order.
    pub candidates: &'a [AllocatorFormat],
    pub width: u32,
    pub height: u32,
    /// Select a format and report its layout without backing it with
    /// memory. Used once per swapchain to fix the image template.
    pub no_memory: bool,
}

/// What the allocator produced. Plane fds are transferred to the caller;
/// a non-disjoint buffer repeats one fd across its planes. In `no_memory`
/// mode all fds are `-1`.
#[derive(Debug, Clone, Copy)]
pub struct AllocationResult {
    pub format: DrmFormat,
    pub plane_fds: [RawFd; MAX_PLANES],
    pub strides: [i32; MAX_PLANES],
    pub offsets: [u32; MAX_PLANES],
}

impl AllocationResult {
    /// A result with every plane slot cleared.
    pub fn empty(format: DrmFormat) -> Self {
        Self {
            format,
            plane_fds: [-1; MAX_PLANES],
            strides: [-1; MAX_PLANES],
            offsets: [0; MAX_PLANES],
        }
    }
}

/// Platform buffer allocator producing dma-buf backed buffers constrained
/// to a candidate format list.
pub trait DmaBufAllocator: Send {
    fn allocate(&mut self, request: &AllocationRequest<'_>) -> Result<AllocationResult, AllocError>;
}

/// Count the distinct backing allocations among plane fds.
///
/// `[5, 5, 6, 6]` has two, `[5, 5, 5, 5]` has one.
pub fn distinct_backing_count(fds: &[RawFd]) -> u32 {
    let mut count = 0;
    for (index, fd) in fds.iter().enumerate() {
        if !fds[..index].contains(fd) {
            count += 1;
        }
    }
    count
}

/// Adopt ownership of raw plane fds, sharing one `OwnedFd` between planes
/// that name the same descriptor. Returns the per-plane handles and the
/// distinct backing count.
fn adopt_plane_fds(fds: &[RawFd]) -> (Vec<Arc<OwnedFd>>, u32) {
    let mut owners: Vec<(RawFd, Arc<OwnedFd>)> = Vec::with_capacity(fds.len());
    let mut planes = Vec::with_capacity(fds.len());
    for &fd in fds {
        let owner = match owners.iter().find(|(raw, _)| *raw == fd) {
            Some((_, owner)) => Arc::clone(owner),
            None => {
                // SAFETY: the allocator transferred this fd to us and each
                // distinct value is adopted exactly once.
                let owner = Arc::new(unsafe { OwnedFd::from_raw_fd(fd) });
                owners.push((fd, Arc::clone(&owner)));
                owner
            }
        };
        planes.push(owner);
    }
    (planes, owners.len() as u32)
}

/// One plane of a dma-buf backed image.
pub struct DmaBufPlane {
    fd: Arc<OwnedFd>,
    pub offset: u32,
    pub stride: i32,
}

impl DmaBufPlane {
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Send-safe wrapper for the host mapping pointer. The mapping is only
/// dereferenced by the presenting thread while holding the structural
/// image lock.
struct HostMapping(*mut u8);
// SAFETY: see HostMapping docs; access is externally serialized.
unsafe impl Send for HostMapping {}

enum Backing {
    DmaBuf {
        planes: Vec<DmaBufPlane>,
        num_memories: u32,
        memories: Vec<vk::DeviceMemory>,
    },
    HostVisible {
        required_props: vk::MemoryPropertyFlags,
        optimal_props: vk::MemoryPropertyFlags,
        memory: vk::DeviceMemory,
        layout: vk::SubresourceLayout,
        size: vk::DeviceSize,
        mapped: Option<HostMapping>,
    },
}

/// Per-image memory binding.
pub struct ExternalMemory {
    device: Arc<DeviceContext>,
    fourcc: DrmFourcc,
    modifier: u64,
    backing: Backing,
}

impl ExternalMemory {
    /// Wrap a fresh dma-buf allocation, deriving disjointness from the
    /// allocator's repeated plane fds.
    pub fn from_allocation(
        device: Arc<DeviceContext>,
        allocation: &AllocationResult,
    ) -> Result<Self, WsiError> {
        let num_planes = fourcc_plane_count(allocation.format.fourcc) as usize;
        debug_assert!(num_planes <= MAX_PLANES);

        let invalid = (0..num_planes)
            .any(|plane| allocation.plane_fds[plane] < 0 || allocation.strides[plane] < 0);
        if invalid {
            error!(
                "allocator returned an invalid plane (fds={:?} strides={:?})",
                &allocation.plane_fds[..num_planes],
                &allocation.strides[..num_planes]
            );
            // Adopt whatever is valid so nothing leaks.
            let valid: Vec<RawFd> = allocation.plane_fds[..num_planes]
                .iter()
                .copied()
                .filter(|&fd| fd >= 0)
                .collect();
            let _owned = adopt_plane_fds(&valid);
            return Err(WsiError::OutOfHostMemory);
        }

        let (owners, num_memories) = adopt_plane_fds(&allocation.plane_fds[..num_planes]);
        debug_assert_eq!(
            num_memories,
            distinct_backing_count(&allocation.plane_fds[..num_planes])
        );
        let planes = owners
            .into_iter()
            .enumerate()
            .map(|(plane, fd)| DmaBufPlane {
                fd,
                offset: allocation.offsets[plane],
                stride: allocation.strides[plane],
            })
            .collect();

        trace!(
            "adopted dma-buf allocation: fourcc={:?} modifier={:#x} planes={} memories={}",
            allocation.format.fourcc, allocation.format.modifier, num_planes, num_memories
        );

        Ok(Self {
            device,
            fourcc: allocation.format.fourcc,
            modifier: allocation.format.modifier,
            backing: Backing::DmaBuf {
                planes,
                num_memories,
                memories: Vec::new(),
            },
        })
    }

    /// A host-visible binding for the shared-memory path.
    pub fn host_visible(
        device: Arc<DeviceContext>,
        fourcc: DrmFourcc,
        required_props: vk::MemoryPropertyFlags,
        optimal_props: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            device,
            fourcc,
            modifier: crate::formats::drm_mod::LINEAR,
            backing: Backing::HostVisible {
                required_props,
                optimal_props,
                memory: vk::DeviceMemory::null(),
                layout: vk::SubresourceLayout::default(),
                size: 0,
                mapped: None,
            },
        }
    }

    pub fn fourcc(&self) -> DrmFourcc {
        self.fourcc
    }

    pub fn modifier(&self) -> u64 {
        self.modifier
    }

    pub fn is_host_visible(&self) -> bool {
        matches!(self.backing, Backing::HostVisible { .. })
    }

    pub fn num_planes(&self) -> u32 {
        match &self.backing {
            Backing::DmaBuf { planes, .. } => planes.len() as u32,
            Backing::HostVisible { .. } => 1,
        }
    }

    pub fn num_memories(&self) -> u32 {
        match &self.backing {
            Backing::DmaBuf { num_memories, .. } => *num_memories,
            Backing::HostVisible { .. } => 1,
        }
    }

    /// Planes sharing no single backing allocation need disjoint import
    /// and per-plane binds.
    pub fn is_disjoint(&self) -> bool {
        self.num_memories() != 1
    }

    pub fn planes(&self) -> &[DmaBufPlane] {
        match &self.backing {
            Backing::DmaBuf { planes, .. } => planes,
            Backing::HostVisible { .. } => &[],
        }
    }

    /// Subresource layouts for explicit-modifier image creation.
    pub fn plane_layouts(&self) -> Vec<vk::SubresourceLayout> {
        self.planes()
            .iter()
            .map(|plane| vk::SubresourceLayout {
                offset: u64::from(plane.offset),
                size: 0,
                row_pitch: plane.stride as u64,
                array_pitch: 0,
                depth_pitch: 0,
            })
            .collect()
    }

    /// Import the backing dma-bufs and bind them to `image`. Must be
    /// called exactly once per image.
    pub fn import_and_bind(&mut self, image: vk::Image) -> Result<(), WsiError> {
        self.import_plane_memories()?;
        self.bind_image_memory(image)
    }

    fn import_plane_memories(&mut self) -> Result<(), WsiError> {
        let device = Arc::clone(&self.device);
        let Backing::DmaBuf {
            planes, memories, ..
        } = &mut self.backing
        else {
            return Err(WsiError::InitializationFailed(
                "dma-buf import on a host-visible binding".into(),
            ));
        };

        // Import each distinct backing fd once, in plane order.
        for (index, plane) in planes.iter().enumerate() {
            let first_use = !planes[..index]
                .iter()
                .any(|prev| Arc::ptr_eq(&prev.fd, &plane.fd));
            if first_use {
                let memory = import_plane_memory(&device, &plane.fd)?;
                memories.push(memory);
            }
        }
        Ok(())
    }

    fn bind_image_memory(&self, image: vk::Image) -> Result<(), WsiError> {
        let Backing::DmaBuf {
            planes, memories, ..
        } = &self.backing
        else {
            return Err(WsiError::InitializationFailed(
                "dma-buf bind on a host-visible binding".into(),
            ));
        };

        if !self.is_disjoint() {
            let memory = *memories.first().ok_or(WsiError::OutOfDeviceMemory)?;
            return self
                .device
                .bind_image_memory(image, memory, u64::from(planes[0].offset));
        }

        // The planes that introduced each distinct fd, in order; memory k
        // was imported from the k-th of these.
        let introducing: Vec<usize> = (0..planes.len())
            .filter(|&index| {
                !planes[..index]
                    .iter()
                    .any(|prev| Arc::ptr_eq(&prev.fd, &planes[index].fd))
            })
            .collect();
        debug_assert_eq!(introducing.len(), memories.len());

        let mut plane_infos: Vec<vk::BindImagePlaneMemoryInfo> = (0..memories.len())
            .map(|k| vk::BindImagePlaneMemoryInfo::default().plane_aspect(MEMORY_PLANE_ASPECTS[k]))
            .collect();

        let bind_infos: Vec<vk::BindImageMemoryInfo> = plane_infos
            .iter_mut()
            .zip(memories.iter().zip(introducing.iter()))
            .map(|(plane_info, (&memory, &plane))| {
                vk::BindImageMemoryInfo::default()
                    .image(image)
                    .memory(memory)
                    .memory_offset(u64::from(planes[plane].offset))
                    .push_next(plane_info)
            })
            .collect();

        self.device.bind_image_memory2(&bind_infos)
    }

    /// Allocate host-visible memory for `image`, bind it and record the
    /// linear layout. Must be called exactly once per image.
    pub fn allocate_host_visible_and_bind(&mut self, image: vk::Image) -> Result<(), WsiError> {
        let device = Arc::clone(&self.device);
        let Backing::HostVisible {
            required_props,
            optimal_props,
            memory,
            layout,
            size,
            ..
        } = &mut self.backing
        else {
            return Err(WsiError::InitializationFailed(
                "host-visible allocation on a dma-buf binding".into(),
            ));
        };

        let requirements = device.image_memory_requirements(image);
        let type_index = device
            .find_memory_type(requirements.memory_type_bits, *optimal_props)
            .or_else(|| device.find_memory_type(requirements.memory_type_bits, *required_props))
            .ok_or(WsiError::FormatNotSupported)?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        *memory = device.allocate_memory(&alloc_info)?;
        *size = requirements.size;

        device.bind_image_memory(image, *memory, 0)?;

        let subresource = vk::ImageSubresource::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .array_layer(0);
        *layout = device.image_subresource_layout(image, subresource);
        Ok(())
    }

    pub fn host_layout(&self) -> Option<&vk::SubresourceLayout> {
        match &self.backing {
            Backing::HostVisible { layout, .. } => Some(layout),
            Backing::DmaBuf { .. } => None,
        }
    }

    /// Map the host-visible allocation (idempotent) and view it as bytes.
    pub fn map_host_memory(&mut self) -> Result<&[u8], WsiError> {
        let device = Arc::clone(&self.device);
        let Backing::HostVisible {
            memory,
            size,
            mapped,
            ..
        } = &mut self.backing
        else {
            return Err(WsiError::InitializationFailed(
                "mapping a dma-buf binding".into(),
            ));
        };
        if *memory == vk::DeviceMemory::null() {
            return Err(WsiError::OutOfDeviceMemory);
        }
        if mapped.is_none() {
            let ptr = device.map_memory(*memory, vk::WHOLE_SIZE)? as *mut u8;
            *mapped = Some(HostMapping(ptr));
        }
        let Some(mapping) = mapped.as_ref() else {
            return Err(WsiError::OutOfDeviceMemory);
        };
        // SAFETY: the mapping covers the whole allocation of `size` bytes
        // and stays valid until unmap (Drop).
        Ok(unsafe { std::slice::from_raw_parts(mapping.0, *size as usize) })
    }
}

fn import_plane_memory(device: &DeviceContext, fd: &Arc<OwnedFd>) -> Result<vk::DeviceMemory, WsiError> {
    let handle_type = vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT;
    let fd_props = device.memory_fd_properties(handle_type, fd.as_raw_fd())?;

    let type_bits = fd_props.memory_type_bits;
    if type_bits == 0 {
        error!("dma-buf fd {} is importable by no memory type", fd.as_raw_fd());
        return Err(WsiError::FormatNotSupported);
    }
    let type_index = type_bits.trailing_zeros();

    let import_fd = fd.as_fd().try_clone_to_owned().map_err(|err| {
        error!("failed to dup dma-buf fd {}: {}", fd.as_raw_fd(), err);
        WsiError::OutOfHostMemory
    })?;

    // SAFETY: import_fd is a live descriptor we own.
    let fd_size = unsafe { libc::lseek(import_fd.as_raw_fd(), 0, libc::SEEK_END) };
    if fd_size <= 0 {
        error!(
            "dma-buf fd {} reports size {}, refusing import",
            import_fd.as_raw_fd(),
            fd_size
        );
        return Err(WsiError::OutOfHostMemory);
    }

    let mut import_info = vk::ImportMemoryFdInfoKHR::default()
        .handle_type(handle_type)
        .fd(import_fd.as_raw_fd());
    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(fd_size as u64)
        .memory_type_index(type_index)
        .push_next(&mut import_info);

    match device.allocate_memory(&alloc_info) {
        Ok(memory) => {
            // The driver owns the duplicate only on successful import.
            let _ = import_fd.into_raw_fd();
            Ok(memory)
        }
        Err(err) => {
            error!(
                "failed to import device memory from dma-buf fd {}: {:?}",
                fd.as_raw_fd(),
                err
            );
            // import_fd drops here, closing the duplicate.
            Err(err)
        }
    }
}

impl Drop for ExternalMemory {
    fn drop(&mut self) {
        match &mut self.backing {
            Backing::DmaBuf { memories, .. } => {
                for memory in memories.drain(..) {
                    self.device.free_memory(memory);
                }
                // Plane fds close via their last Arc<OwnedFd> drop.
            }
            Backing::HostVisible { memory, mapped, .. } => {
                if mapped.take().is_some() {
                    self.device.unmap_memory(*memory);
                }
                self.device.free_memory(*memory);
                *memory = vk::DeviceMemory::null();
            }
        }
    }
}
