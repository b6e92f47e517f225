//! # wsi-bridge
//!
//! Presentation backend for a Vulkan windowing-system-integration layer:
//! turns rendered images into frames on screen, either over a local
//! shared-memory path or by handing dma-buf buffers to a compositor
//! process through an out-of-band socket protocol.
//!
//! ## Architecture
//!
//! ```text
//! application threads                      background thread
//! ┌─────────────────────────────┐          ┌──────────────────────┐
//! │ acquire_next_image          │          │ PresentEngine        │
//! │ queue_present ──┬─ bridge ──┼── fds ──▶│  (completion polling)│
//! │                 └─ shm      │          └──────────┬───────────┘
//! └────────┬────────────────────┘                     │
//!          ▼                                          ▼
//!   FrameLifecycle  ◀─── status mutex + condvar ──────┘
//!   (Free / Acquired, pending completions, release lag)
//! ```
//!
//! The driver is an opaque native library reached through `ash`'s loaded
//! function tables ([`DeviceContext`]); the window, the platform buffer
//! allocator and the shared-memory delivery path are collaborator traits
//! the embedder implements. Nothing in this crate reads ambient global
//! state except the documented `WSI_BRIDGE_*` environment configuration.
//!
//! ## The bridge path
//!
//! When [`BridgeConfig`] names a socket, frames are submitted zero-copy:
//! each present sends a fixed-size packet plus the plane fds over a
//! `SOCK_SEQPACKET` socket ([`BridgeClient`]), reuse of the buffer is
//! deferred behind a release lag of N−1 frames, and submission is paced
//! by compositor feedback when the peer supports it, bounded by a
//! wall-clock cap ([`FramePacer`]) either way. A bridge that fails at
//! runtime is disabled process-wide ([`BridgeAvailability`]) and the
//! next swapchain falls back to shared memory.

pub mod bridge;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod fence;
pub mod formats;
pub mod lifecycle;
pub mod memory;
pub mod pacing;
pub mod protocol;
pub mod surface;
pub mod swapchain;

pub use bridge::{BridgeAvailability, BridgeClient, Feedback, FramePlane};
pub use config::BridgeConfig;
pub use device::DeviceContext;
pub use error::{AcquireResult, AllocError, PresentOutcome, WsiError};
pub use fence::PresentFence;
pub use formats::{drm_mod, DrmFormat, ModifierProperties};
pub use lifecycle::{AcquireTimeout, FrameLifecycle, ImageStatus, MAX_PENDING_COMPLETIONS};
pub use memory::{
    AllocationRequest, AllocationResult, AllocatorFormat, DmaBufAllocator, ExternalMemory,
};
pub use pacing::FramePacer;
pub use surface::{HostFrame, ShmPresenter, SurfaceProvider};
pub use swapchain::{
    PresentMode, PresentRequest, Swapchain, SwapchainDesc, MAX_SWAPCHAIN_IMAGES,
};
