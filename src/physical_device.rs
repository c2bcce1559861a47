//! Physical device enumeration and capability capture.
use std::{borrow::Cow, ffi::CStr, fmt, sync::Arc};

use ash::vk;
use thiserror::Error;

use crate::InstanceContext;

/// Errors that can occur while selecting a physical device.
#[derive(Debug, Error)]
pub enum DeviceSelectionError {
    /// Vulkan Error.
    #[error("vulkan error")]
    VulkanError(#[from] vk::Result),
    /// The instance has no physical devices attached at all.
    #[error("no physical devices available")]
    NoDevices,
    /// The selection policy accepted none of the enumerated devices.
    #[error("selection policy rejected all {0} devices")]
    PolicyRejected(usize),
}

/// No queue family on the selected device matched the requested capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no queue family supporting {flags:?} was found")]
pub struct QueueFamilyNotFound {
    /// The capability flags that were asked for.
    pub flags: vk::QueueFlags,
}

/// The default selection policy: take the first enumerated device, whatever
/// its properties. Pass a different policy to
/// [`PhysicalDeviceContext::with_policy`] to score devices instead.
#[inline]
pub fn pick_first(devices: &[vk::PhysicalDevice]) -> Option<usize> {
    (!devices.is_empty()).then_some(0)
}

fn select(
    devices: &[vk::PhysicalDevice],
    policy: &mut impl FnMut(&[vk::PhysicalDevice]) -> Option<usize>,
) -> Result<usize, DeviceSelectionError> {
    if devices.is_empty() {
        return Err(DeviceSelectionError::NoDevices);
    }

    policy(devices)
        .filter(|&index| index < devices.len())
        .ok_or(DeviceSelectionError::PolicyRejected(devices.len()))
}

fn find_queue_family(
    families: &[vk::QueueFamilyProperties],
    flags: vk::QueueFlags,
) -> Result<u32, QueueFamilyNotFound> {
    families
        .iter()
        .position(|family| family.queue_count > 0 && family.queue_flags.contains(flags))
        .map(|index| index as u32)
        .ok_or(QueueFamilyNotFound { flags })
}

/// One selected physical device and a copy of its capabilities.
///
/// Shares ownership of the [`InstanceContext`] it was enumerated from, so the
/// instance outlives the cached handle. The handle itself is a non-owning
/// reference into driver-managed state and needs no teardown.
pub struct PhysicalDeviceContext {
    instance: Arc<InstanceContext>,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    features: vk::PhysicalDeviceFeatures,
    memory_types: Vec<vk::MemoryType>,
    memory_heaps: Vec<vk::MemoryHeap>,
    queue_families: Vec<vk::QueueFamilyProperties>,
}

impl PhysicalDeviceContext {
    /// Enumerate physical devices and capture the one chosen by
    /// [`pick_first`].
    ///
    /// # Safety
    ///
    /// Calls into the driver through `instance`.
    pub unsafe fn new(instance: Arc<InstanceContext>) -> Result<Self, DeviceSelectionError> {
        Self::with_policy(instance, pick_first)
    }

    /// Enumerate physical devices and capture the one chosen by `policy`.
    ///
    /// An empty enumeration is reported as [`DeviceSelectionError::NoDevices`]
    /// instead of handing back an invalid handle.
    ///
    /// # Safety
    ///
    /// Calls into the driver through `instance`.
    pub unsafe fn with_policy(
        instance: Arc<InstanceContext>,
        mut policy: impl FnMut(&[vk::PhysicalDevice]) -> Option<usize>,
    ) -> Result<Self, DeviceSelectionError> {
        let devices = instance.instance().enumerate_physical_devices()?;
        log::info!("number of physical devices: {}", devices.len());

        let physical_device = devices[select(&devices, &mut policy)?];

        let properties = instance
            .instance()
            .get_physical_device_properties(physical_device);
        log::info!(
            "selected physical device: {:?}",
            CStr::from_ptr(properties.device_name.as_ptr())
        );

        let memory_properties = instance
            .instance()
            .get_physical_device_memory_properties(physical_device);
        let memory_types =
            memory_properties.memory_types[..memory_properties.memory_type_count as usize].to_vec();
        let memory_heaps =
            memory_properties.memory_heaps[..memory_properties.memory_heap_count as usize].to_vec();
        log::debug!("memory types: {}", memory_types.len());
        log::debug!("memory heaps: {}", memory_heaps.len());

        let features = instance
            .instance()
            .get_physical_device_features(physical_device);
        let queue_families = instance
            .instance()
            .get_physical_device_queue_family_properties(physical_device);

        Ok(PhysicalDeviceContext {
            instance,
            physical_device,
            properties,
            features,
            memory_types,
            memory_heaps,
            queue_families,
        })
    }

    /// The instance this device was enumerated from.
    #[inline]
    pub fn instance(&self) -> &Arc<InstanceContext> {
        &self.instance
    }

    /// The raw physical device handle, for calls expecting one.
    #[inline]
    pub fn handle(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Properties of the physical device.
    #[inline]
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Name of the physical device.
    #[inline]
    pub fn device_name(&self) -> Cow<str> {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()).to_string_lossy() }
    }

    /// The feature flags the physical device supports.
    #[inline]
    pub fn features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.features
    }

    /// The memory types the physical device exposes.
    #[inline]
    pub fn memory_types(&self) -> &[vk::MemoryType] {
        &self.memory_types
    }

    /// The memory heaps the physical device exposes.
    #[inline]
    pub fn memory_heaps(&self) -> &[vk::MemoryHeap] {
        &self.memory_heaps
    }

    /// The queue family table of the physical device, in enumeration order.
    #[inline]
    pub fn queue_families(&self) -> &[vk::QueueFamilyProperties] {
        &self.queue_families
    }

    /// Index of the first queue family with at least one queue supporting all
    /// of `flags`.
    #[inline]
    pub fn queue_family_index(&self, flags: vk::QueueFlags) -> Result<u32, QueueFamilyNotFound> {
        find_queue_family(&self.queue_families, flags)
    }
}

impl fmt::Debug for PhysicalDeviceContext {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("PhysicalDeviceContext")
            .field("handle", &self.physical_device)
            .field("device_name", &self.device_name())
            .field("memory_types", &self.memory_types.len())
            .field("memory_heaps", &self.memory_heaps.len())
            .field("queue_families", &self.queue_families.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties::builder()
            .queue_flags(flags)
            .queue_count(count)
            .build()
    }

    #[test]
    fn first_matching_family_wins() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 2),
            family(vk::QueueFlags::COMPUTE, 1),
        ];
        assert_eq!(find_queue_family(&families, vk::QueueFlags::COMPUTE), Ok(1));
        assert_eq!(
            find_queue_family(&families, vk::QueueFlags::GRAPHICS),
            Ok(0)
        );
    }

    #[test]
    fn families_without_queues_never_match() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 0),
            family(vk::QueueFlags::TRANSFER, 1),
        ];
        assert_eq!(
            find_queue_family(&families, vk::QueueFlags::TRANSFER),
            Ok(1)
        );
    }

    #[test]
    fn unsupported_flags_report_not_found() {
        let families = [family(vk::QueueFlags::GRAPHICS, 2)];
        assert_eq!(
            find_queue_family(&families, vk::QueueFlags::SPARSE_BINDING),
            Err(QueueFamilyNotFound {
                flags: vk::QueueFlags::SPARSE_BINDING
            })
        );
    }

    #[test]
    fn pick_first_always_selects_index_zero() {
        let devices = [vk::PhysicalDevice::null(); 3];
        assert_eq!(pick_first(&devices), Some(0));
        assert_eq!(pick_first(&[]), None);
    }

    #[test]
    fn empty_enumeration_is_an_error() {
        let err = select(&[], &mut pick_first).unwrap_err();
        assert!(matches!(err, DeviceSelectionError::NoDevices));
    }

    #[test]
    fn rejecting_policy_is_an_error() {
        let devices = [vk::PhysicalDevice::null(); 2];
        let err = select(&devices, &mut |_: &[vk::PhysicalDevice]| None).unwrap_err();
        assert!(matches!(err, DeviceSelectionError::PolicyRejected(2)));
    }

    #[test]
    fn out_of_range_policy_is_an_error() {
        let devices = [vk::PhysicalDevice::null(); 2];
        let err = select(&devices, &mut |d: &[vk::PhysicalDevice]| Some(d.len())).unwrap_err();
        assert!(matches!(err, DeviceSelectionError::PolicyRejected(2)));
    }
}
