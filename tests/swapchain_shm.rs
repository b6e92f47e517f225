//! End-to-end swapchain test on the shared-memory path against a real
//! Vulkan device.
//!
//! Requires a working Vulkan implementation (a GPU driver or a software
//! rasterizer); the test skips itself when none is available, the way
//! environment-dependent tests in this area usually must.
//!
//! Run with:
//! ```sh
//! cargo test --test swapchain_shm -- --nocapture
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ash::vk;

use wsi_bridge::memory::{AllocationRequest, AllocationResult, DmaBufAllocator};
use wsi_bridge::surface::{HostFrame, ShmPresenter, SurfaceProvider};
use wsi_bridge::{
    AcquireResult, AllocError, BridgeAvailability, BridgeConfig, DeviceContext, PresentOutcome,
    Swapchain, SwapchainDesc, WsiError,
};
use wsi_bridge::swapchain::{PresentMode, PresentRequest};

struct FixedSurface {
    width: u32,
    height: u32,
}

impl SurfaceProvider for FixedSurface {
    fn window(&self) -> u32 {
        0x0200_0001
    }

    fn size_and_depth(&self) -> Option<(u32, u32, u32)> {
        Some((self.width, self.height, 24))
    }
}

#[derive(Default)]
struct RecordingPresenter {
    frames: Arc<AtomicU32>,
}

impl ShmPresenter for RecordingPresenter {
    fn is_available(&self, _surface: &dyn SurfaceProvider) -> bool {
        true
    }

    fn init(&mut self, _surface: &dyn SurfaceProvider) -> Result<(), WsiError> {
        Ok(())
    }

    fn present(&mut self, frame: &HostFrame<'_>, _serial: u32) -> Result<(), WsiError> {
        assert!(frame.row_pitch >= u64::from(frame.width) * 4);
        assert!(frame.pixels.len() as u64 >= frame.row_pitch * u64::from(frame.height));
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// The shared-memory path never allocates dma-bufs.
struct NoDmaBufs;

impl DmaBufAllocator for NoDmaBufs {
    fn allocate(
        &mut self,
        _request: &AllocationRequest<'_>,
    ) -> Result<AllocationResult, AllocError> {
        Err(AllocError::NotSupported)
    }
}

struct VulkanHarness {
    instance: ash::Instance,
    device: ash::Device,
    context: Arc<DeviceContext>,
    queue: vk::Queue,
}

fn create_harness() -> Option<VulkanHarness> {
    // SAFETY: standard loader lookup; failure just skips the test.
    let entry = match unsafe { ash::Entry::load() } {
        Ok(entry) => entry,
        Err(err) => {
            eprintln!("Skipping test: no Vulkan loader: {err}");
            return None;
        }
    };

    let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_1);
    let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
    // SAFETY: create_info is fully initialized.
    let instance = match unsafe { entry.create_instance(&create_info, None) } {
        Ok(instance) => instance,
        Err(err) => {
            eprintln!("Skipping test: failed to create instance: {err:?}");
            return None;
        }
    };

    // SAFETY: instance is valid.
    let physical_devices = match unsafe { instance.enumerate_physical_devices() } {
        Ok(devices) if !devices.is_empty() => devices,
        _ => {
            eprintln!("Skipping test: no physical devices");
            // SAFETY: nothing else references the instance.
            unsafe { instance.destroy_instance(None) };
            return None;
        }
    };
    let physical_device = physical_devices[0];

    let priorities = [1.0f32];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(0)
        .queue_priorities(&priorities);
    let device_info =
        vk::DeviceCreateInfo::default().queue_create_infos(std::slice::from_ref(&queue_info));
    // SAFETY: queue family 0 always exists.
    let device = match unsafe { instance.create_device(physical_device, &device_info, None) } {
        Ok(device) => device,
        Err(err) => {
            eprintln!("Skipping test: failed to create device: {err:?}");
            // SAFETY: nothing else references the instance.
            unsafe { instance.destroy_instance(None) };
            return None;
        }
    };
    // SAFETY: queue (0, 0) was requested above.
    let queue = unsafe { device.get_device_queue(0, 0) };

    // SAFETY: the handles outlive the context (destroyed at harness end).
    let context = Arc::new(unsafe {
        DeviceContext::new(instance.clone(), physical_device, device.clone())
    });

    Some(VulkanHarness {
        instance,
        device,
        context,
        queue,
    })
}

impl VulkanHarness {
    fn destroy(self) {
        // SAFETY: every swapchain object has been dropped by now.
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

#[test]
fn shm_swapchain_acquire_present_cycle() {
    let Some(harness) = create_harness() else {
        return;
    };

    let frames = Arc::new(AtomicU32::new(0));
    let presenter = RecordingPresenter {
        frames: Arc::clone(&frames),
    };

    let desc = SwapchainDesc {
        width: 64,
        height: 64,
        format: vk::Format::B8G8R8A8_UNORM,
        usage: vk::ImageUsageFlags::TRANSFER_SRC,
        min_image_count: 3,
        present_mode: PresentMode::Fifo,
    };

    let swapchain = Swapchain::new(
        Arc::clone(&harness.context),
        Arc::new(FixedSurface {
            width: 64,
            height: 64,
        }),
        Box::new(NoDmaBufs),
        Some(Box::new(presenter)),
        &desc,
        &BridgeConfig::default(),
        BridgeAvailability::new(),
    )
    .expect("swapchain creation");

    assert!(!swapchain.is_bridge_active());
    assert_eq!(swapchain.image_count(), 3);
    assert_eq!(swapchain.images().len(), 3);

    // Property: N acquires exhaust the pool, then a poll is not-ready.
    let mut acquired = Vec::new();
    for _ in 0..3 {
        match swapchain.acquire_next_image(0).unwrap() {
            AcquireResult::Acquired(index) => acquired.push(index),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(
        swapchain.acquire_next_image(0).unwrap(),
        AcquireResult::NotReady
    );

    // Present them all; the shared-memory path releases immediately.
    for (n, &index) in acquired.iter().enumerate() {
        let outcome = swapchain
            .queue_present(
                harness.queue,
                &PresentRequest {
                    image_index: index,
                    present_id: (n + 1) as u64,
                    wait_semaphores: &[],
                    release_fence: None,
                    present_mode_override: None,
                },
            )
            .unwrap();
        assert_eq!(outcome, PresentOutcome::Success);
    }
    assert_eq!(frames.load(Ordering::Relaxed), 3);

    // The loop is closed: images are reusable.
    match swapchain.acquire_next_image(0).unwrap() {
        AcquireResult::Acquired(_) => {}
        other => panic!("unexpected {other:?}"),
    }

    drop(swapchain);
    harness.destroy();
    println!("shared-memory swapchain cycle complete");
}

#[test]
fn suboptimal_reported_when_surface_resizes() {
    let Some(harness) = create_harness() else {
        return;
    };

    let desc = SwapchainDesc {
        width: 64,
        height: 64,
        format: vk::Format::B8G8R8A8_UNORM,
        usage: vk::ImageUsageFlags::TRANSFER_SRC,
        min_image_count: 2,
        present_mode: PresentMode::Fifo,
    };

    // The surface reports a size the swapchain no longer matches.
    let swapchain = Swapchain::new(
        Arc::clone(&harness.context),
        Arc::new(FixedSurface {
            width: 128,
            height: 128,
        }),
        Box::new(NoDmaBufs),
        Some(Box::new(RecordingPresenter::default())),
        &desc,
        &BridgeConfig::default(),
        BridgeAvailability::new(),
    )
    .expect("swapchain creation");

    let index = match swapchain.acquire_next_image(u64::MAX).unwrap() {
        AcquireResult::Acquired(index) => index,
        other => panic!("unexpected {other:?}"),
    };
    let outcome = swapchain
        .queue_present(
            harness.queue,
            &PresentRequest {
                image_index: index,
                present_id: 0,
                wait_semaphores: &[],
                release_fence: None,
                present_mode_override: None,
            },
        )
        .unwrap();
    assert_eq!(outcome, PresentOutcome::Suboptimal);

    drop(swapchain);
    harness.destroy();
}
