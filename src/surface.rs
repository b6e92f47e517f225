//! Collaborator interfaces around the swapchain.
//!
//! The swapchain never talks to a display server directly. It reaches the
//! window through a [`SurfaceProvider`] and, when the zero-copy bridge is
//! unavailable, hands finished frames to a [`ShmPresenter`] - the
//! embedder's shared-memory delivery path.

use crate::error::WsiError;

/// The window a swapchain presents to.
pub trait SurfaceProvider: Send + Sync {
    /// Protocol-level window identifier (the `xid` carried on the wire).
    fn window(&self) -> u32;

    /// Current size and color depth of the underlying surface, when the
    /// windowing connection can answer.
    fn size_and_depth(&self) -> Option<(u32, u32, u32)>;
}

/// One frame of host-visible pixels ready for shared-memory delivery.
pub struct HostFrame<'a> {
    pub image_index: u32,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the mapped image.
    pub row_pitch: u64,
    /// The mapped pixel data, `row_pitch * height` bytes at least.
    pub pixels: &'a [u8],
}

/// Shared-memory presentation path supplied by the embedder.
///
/// Implementations copy (or hand off) the frame to the windowing server
/// and signal it; any asynchronous completion tracking stays on their
/// side. A failure here is fatal to the swapchain.
pub trait ShmPresenter: Send {
    /// Whether this presenter can serve the given surface at all.
    fn is_available(&self, surface: &dyn SurfaceProvider) -> bool;

    /// One-time setup against the surface.
    fn init(&mut self, surface: &dyn SurfaceProvider) -> Result<(), WsiError>;

    /// Deliver one frame. `serial` is the swapchain's submission serial,
    /// usable for windowing-protocol sequence numbers.
    fn present(&mut self, frame: &HostFrame<'_>, serial: u32) -> Result<(), WsiError>;
}
