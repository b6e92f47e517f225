//! The per-image completion fence.
//!
//! Each swapchain image owns one fence. At present time the fence is
//! reset and re-armed with an empty queue submission that waits on the
//! application's semaphores, so "fence signalled" means "the GPU is done
//! producing this frame". The presentation path waits on it before
//! touching the buffer, and the background engine polls it to retire
//! pending completions.

use std::sync::Arc;

use ash::vk;

use crate::device::DeviceContext;
use crate::error::WsiError;

pub struct PresentFence {
    device: Arc<DeviceContext>,
    fence: vk::Fence,
    /// Whether the fence currently guards a submission. An un-armed fence
    /// reports "signalled" so waits never block on a frame that was never
    /// submitted.
    armed: bool,
}

impl PresentFence {
    pub fn new(device: Arc<DeviceContext>) -> Result<Self, WsiError> {
        let fence = device.create_fence()?;
        Ok(Self {
            device,
            fence,
            armed: false,
        })
    }

    /// Arm the fence behind the application's rendering: waits on
    /// `wait_semaphores`, then signals.
    pub fn set_payload(
        &mut self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<(), WsiError> {
        self.device.reset_fence(self.fence)?;
        self.armed = false;
        self.device
            .queue_submit_signal_fence(queue, wait_semaphores, self.fence)?;
        self.armed = true;
        Ok(())
    }

    /// Zero-cost completion poll.
    pub fn is_signalled(&self) -> Result<bool, WsiError> {
        if !self.armed {
            return Ok(true);
        }
        self.device.fence_status(self.fence)
    }

    /// Bounded wait for the payload; `Ok(false)` on timeout.
    pub fn wait(&self, timeout_ns: u64) -> Result<bool, WsiError> {
        if !self.armed {
            return Ok(true);
        }
        self.device.wait_for_fence(self.fence, timeout_ns)
    }
}

impl Drop for PresentFence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}
