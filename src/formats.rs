//! Pixel-format and DRM-format-modifier negotiation.
//!
//! This module answers the one question swapchain creation cares about:
//! for a requested Vulkan format, which fourcc + modifier combinations can
//! the driver actually import from (and export to) dma-buf memory, within
//! the requested image dimensions and usage? It uses
//! `VK_EXT_image_drm_format_modifier` for the modifier list and the
//! external-memory image format query for the import/export classification.

use ash::vk;
use drm_fourcc::DrmFourcc;
use tracing::{debug, trace};

/// Well-known DRM format modifier constants.
pub mod drm_mod {
    /// Linear (non-tiled) memory layout.
    pub const LINEAR: u64 = 0;

    /// Invalid modifier - indicates "use implicit modifier" or "no modifier".
    pub const INVALID: u64 = 0x00ff_ffff_ffff_ffff;

    /// Vendor prefix mask (upper 8 bits).
    pub const VENDOR_MASK: u64 = 0xff00_0000_0000_0000;
}

/// Properties of a single DRM format modifier.
#[derive(Debug, Clone)]
pub struct ModifierProperties {
    /// The DRM format modifier value.
    pub modifier: u64,

    /// Number of memory planes for this modifier.
    pub plane_count: u32,

    /// Vulkan format features supported with this modifier.
    pub format_features: vk::FormatFeatureFlags,
}

impl ModifierProperties {
    /// Whether images with this modifier may be created disjoint.
    pub fn supports_disjoint(&self) -> bool {
        self.format_features.contains(vk::FormatFeatureFlags::DISJOINT)
    }
}

/// One fourcc + modifier pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrmFormat {
    pub fourcc: DrmFourcc,
    pub modifier: u64,
}

/// Query supported modifiers for a Vulkan format.
///
/// Uses `vkGetPhysicalDeviceFormatProperties2` with
/// `VkDrmFormatModifierPropertiesListEXT` in the usual two-call pattern.
///
/// # Safety
///
/// - `instance` must be a valid Vulkan instance with
///   VK_KHR_get_physical_device_properties2
/// - `physical_device` must be a valid physical device from that instance
pub unsafe fn query_format_modifiers(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    vk_format: vk::Format,
) -> Vec<ModifierProperties> {
    let mut modifier_list = vk::DrmFormatModifierPropertiesListEXT::default();
    let mut format_props2 = vk::FormatProperties2::default().push_next(&mut modifier_list);

    instance.get_physical_device_format_properties2(physical_device, vk_format, &mut format_props2);

    let modifier_count = modifier_list.drm_format_modifier_count;
    if modifier_count == 0 {
        trace!("no modifiers for format {:?}", vk_format);
        return vec![];
    }

    let mut modifier_props: Vec<vk::DrmFormatModifierPropertiesEXT> =
        vec![vk::DrmFormatModifierPropertiesEXT::default(); modifier_count as usize];

    let mut modifier_list = vk::DrmFormatModifierPropertiesListEXT::default()
        .drm_format_modifier_properties(&mut modifier_props);
    let mut format_props2 = vk::FormatProperties2::default().push_next(&mut modifier_list);

    instance.get_physical_device_format_properties2(physical_device, vk_format, &mut format_props2);

    let result: Vec<ModifierProperties> = modifier_props
        .iter()
        .map(|p| ModifierProperties {
            modifier: p.drm_format_modifier,
            plane_count: p.drm_format_modifier_plane_count,
            format_features: p.drm_format_modifier_tiling_features,
        })
        .collect();

    trace!("format {:?}: {} modifiers supported", vk_format, result.len());
    result
}

/// Parameters of the image the swapchain wants to create, for
/// compatibility classification.
#[derive(Debug, Clone, Copy)]
pub struct ImageRequirements {
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
}

/// Dma-buf format candidates compatible with both the driver and the
/// requested image, split by direction.
#[derive(Debug, Default)]
pub struct CompatibleFormats {
    /// Formats the driver can import from dma-buf memory. The paired flag
    /// is `true` when the modifier does NOT support disjoint images, i.e.
    /// the allocator must place all planes in one allocation.
    pub importable: Vec<(DrmFormat, bool)>,
    /// Modifiers the driver can export to dma-buf memory.
    pub exportable_modifiers: Vec<u64>,
    /// Raw modifier properties, for plane-count lookups.
    pub modifier_props: Vec<ModifierProperties>,
}

/// Classify which modifier combinations of `requirements.format` can back
/// a dma-buf swapchain image.
///
/// Combinations failing the image-format query or the extent/mip/sample
/// limits are skipped, not errors; an empty result means the format is
/// unusable for the dma-buf path.
///
/// # Safety
///
/// `instance` and `physical_device` must be valid, with
/// VK_EXT_image_drm_format_modifier available.
pub unsafe fn surface_compatible_formats(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    requirements: &ImageRequirements,
) -> Option<CompatibleFormats> {
    let fourcc = vk_to_drm_fourcc(requirements.format)?;
    let modifier_props =
        query_format_modifiers(instance, physical_device, requirements.format);

    let mut importable = Vec::new();
    let mut exportable_modifiers = Vec::new();

    for prop in &modifier_props {
        let mut external_props = vk::ExternalImageFormatProperties::default();
        let mut format_props =
            vk::ImageFormatProperties2::default().push_next(&mut external_props);

        let mut external_info = vk::PhysicalDeviceExternalImageFormatInfo::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let mut drm_mod_info = vk::PhysicalDeviceImageDrmFormatModifierInfoEXT::default()
            .drm_format_modifier(prop.modifier)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image_info = vk::PhysicalDeviceImageFormatInfo2::default()
            .format(requirements.format)
            .ty(vk::ImageType::TYPE_2D)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(requirements.usage)
            .flags(requirements.flags)
            .push_next(&mut external_info)
            .push_next(&mut drm_mod_info);

        if instance
            .get_physical_device_image_format_properties2(
                physical_device,
                &image_info,
                &mut format_props,
            )
            .is_err()
        {
            continue;
        }

        let limits = format_props.image_format_properties;
        if limits.max_extent.width < requirements.width
            || limits.max_extent.height < requirements.height
            || limits.max_mip_levels < 1
            || limits.max_array_layers < 1
            || !limits.sample_counts.contains(vk::SampleCountFlags::TYPE_1)
        {
            continue;
        }

        let features = external_props.external_memory_properties.external_memory_features;
        if features.contains(vk::ExternalMemoryFeatureFlags::EXPORTABLE) {
            exportable_modifiers.push(prop.modifier);
        }
        if features.contains(vk::ExternalMemoryFeatureFlags::IMPORTABLE) {
            let require_non_disjoint = !prop.supports_disjoint();
            importable.push((
                DrmFormat {
                    fourcc,
                    modifier: prop.modifier,
                },
                require_non_disjoint,
            ));
        }
    }

    debug!(
        format = ?requirements.format,
        importable = importable.len(),
        exportable = exportable_modifiers.len(),
        "classified dma-buf format candidates"
    );

    Some(CompatibleFormats {
        importable,
        exportable_modifiers,
        modifier_props,
    })
}

/// Map the swapchain-relevant Vulkan formats to their DRM fourcc.
///
/// Note the component-order flip: Vulkan names components most significant
/// first, DRM fourccs least significant first.
pub fn vk_to_drm_fourcc(format: vk::Format) -> Option<DrmFourcc> {
    match format {
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => Some(DrmFourcc::Argb8888),
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => Some(DrmFourcc::Abgr8888),
        vk::Format::A2B10G10R10_UNORM_PACK32 => Some(DrmFourcc::Abgr2101010),
        vk::Format::A2R10G10B10_UNORM_PACK32 => Some(DrmFourcc::Argb2101010),
        vk::Format::R5G6B5_UNORM_PACK16 => Some(DrmFourcc::Rgb565),
        vk::Format::R16G16B16A16_SFLOAT => Some(DrmFourcc::Abgr16161616f),
        _ => None,
    }
}

/// Replace an alpha-carrying fourcc with its opaque sibling.
///
/// Compositors scanning out a swapchain buffer must not blend with
/// whatever the application left in the alpha channel.
pub fn strip_alpha(fourcc: DrmFourcc) -> DrmFourcc {
    match fourcc {
        DrmFourcc::Argb8888 => DrmFourcc::Xrgb8888,
        DrmFourcc::Abgr8888 => DrmFourcc::Xbgr8888,
        DrmFourcc::Argb2101010 => DrmFourcc::Xrgb2101010,
        DrmFourcc::Abgr2101010 => DrmFourcc::Xbgr2101010,
        other => other,
    }
}

/// Format plane count as defined by the fourcc itself (not the modifier).
pub fn fourcc_plane_count(fourcc: DrmFourcc) -> u32 {
    match fourcc {
        DrmFourcc::Nv12 | DrmFourcc::Nv21 | DrmFourcc::Nv16 | DrmFourcc::P010 => 2,
        DrmFourcc::Yuv420 | DrmFourcc::Yvu420 | DrmFourcc::Yuv422 | DrmFourcc::Yuv444 => 3,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_formats_are_stripped() {
        assert_eq!(strip_alpha(DrmFourcc::Argb8888), DrmFourcc::Xrgb8888);
        assert_eq!(strip_alpha(DrmFourcc::Abgr8888), DrmFourcc::Xbgr8888);
        assert_eq!(strip_alpha(DrmFourcc::Xrgb8888), DrmFourcc::Xrgb8888);
        assert_eq!(strip_alpha(DrmFourcc::Nv12), DrmFourcc::Nv12);
    }

    #[test]
    fn bgra_maps_to_argb() {
        assert_eq!(
            vk_to_drm_fourcc(vk::Format::B8G8R8A8_UNORM),
            Some(DrmFourcc::Argb8888)
        );
        assert_eq!(
            vk_to_drm_fourcc(vk::Format::R8G8B8A8_UNORM),
            Some(DrmFourcc::Abgr8888)
        );
        assert_eq!(vk_to_drm_fourcc(vk::Format::D32_SFLOAT), None);
    }

    #[test]
    fn plane_counts_for_video_formats() {
        assert_eq!(fourcc_plane_count(DrmFourcc::Xrgb8888), 1);
        assert_eq!(fourcc_plane_count(DrmFourcc::Nv12), 2);
        assert_eq!(fourcc_plane_count(DrmFourcc::Yuv420), 3);
    }

    #[test]
    fn disjoint_support_follows_format_features() {
        let props = ModifierProperties {
            modifier: drm_mod::LINEAR,
            plane_count: 1,
            format_features: vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::DISJOINT,
        };
        assert!(props.supports_disjoint());

        let props = ModifierProperties {
            modifier: drm_mod::LINEAR,
            plane_count: 1,
            format_features: vk::FormatFeatureFlags::SAMPLED_IMAGE,
        };
        assert!(!props.supports_disjoint());
    }
}
