//! Error types for the wsi-bridge crate.

use ash::vk;
use thiserror::Error;

/// Errors surfaced by swapchain operations.
///
/// These are the discriminated result codes crossing the presentation
/// boundary; nothing in this crate panics on a presentation failure.
#[derive(Error, Debug)]
pub enum WsiError {
    /// The swapchain can no longer present and must be recreated.
    #[error("swapchain is out of date")]
    OutOfDate,

    /// Host memory allocation failed.
    #[error("out of host memory")]
    OutOfHostMemory,

    /// Device memory allocation or import failed.
    #[error("out of device memory")]
    OutOfDeviceMemory,

    /// No allocatable format satisfies the request.
    #[error("format not supported")]
    FormatNotSupported,

    /// Swapchain construction failed before any image existed.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// An unexpected result code from the driver.
    #[error("device error: {0:?}")]
    Device(vk::Result),
}

impl From<vk::Result> for WsiError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => WsiError::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => WsiError::OutOfDeviceMemory,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => WsiError::FormatNotSupported,
            vk::Result::ERROR_OUT_OF_DATE_KHR => WsiError::OutOfDate,
            other => WsiError::Device(other),
        }
    }
}

impl Clone for WsiError {
    fn clone(&self) -> Self {
        match self {
            WsiError::OutOfDate => WsiError::OutOfDate,
            WsiError::OutOfHostMemory => WsiError::OutOfHostMemory,
            WsiError::OutOfDeviceMemory => WsiError::OutOfDeviceMemory,
            WsiError::FormatNotSupported => WsiError::FormatNotSupported,
            WsiError::InitializationFailed(msg) => WsiError::InitializationFailed(msg.clone()),
            WsiError::Device(r) => WsiError::Device(*r),
        }
    }
}

/// Errors reported by a [`DmaBufAllocator`](crate::memory::DmaBufAllocator).
#[derive(Error, Debug)]
pub enum AllocError {
    /// None of the candidate formats can be allocated.
    #[error("no candidate format supported by the allocator")]
    NotSupported,

    /// The allocator ran out of buffer memory.
    #[error("allocator out of resources")]
    NoResources,

    /// Any other allocator failure.
    #[error("allocator failure: {0}")]
    Other(String),
}

impl From<AllocError> for WsiError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::NotSupported => WsiError::FormatNotSupported,
            AllocError::NoResources | AllocError::Other(_) => WsiError::OutOfHostMemory,
        }
    }
}

/// Outcome of an acquire request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    /// An image was acquired; its index is now owned by the caller.
    Acquired(u32),
    /// Zero-timeout poll found no free image. Retry later.
    NotReady,
    /// The deadline passed before an image became free. Retry later.
    Timeout,
}

/// Outcome of a present request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// The frame was handed to the presentation path.
    Success,
    /// The frame was presented but the surface no longer matches the
    /// swapchain dimensions; the application should recreate.
    Suboptimal,
}
