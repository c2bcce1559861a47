#![allow(clippy::missing_safety_doc)]
#![warn(missing_docs)]
/*!
Vulkan bootstrap contexts: instance creation and physical device discovery.

- ✅ Instance creation with extension/layer negotiation
- ✅ Optional debug-utils messenger, torn down before the instance
- ✅ Physical device enumeration with a swappable selection policy
- ✅ Capability capture: features, memory types/heaps, queue families

There is deliberately no logical device, swapchain or frame loop here; this
crate ends where device creation begins.

## Cargo Features

- `surface` (enabled by default): Enables the use of [`raw-window-handle`] to
  pull in the instance extensions the window system needs.

## Example

```rust,ignore
let instance = Arc::new(unsafe {
    InstanceContext::builder()
        .validation_layers(ValidationLayers::Request)
        .request_debug_messenger(DebugMessenger::Default)
        .require_surface_extensions(&window)
        .unwrap()
        .build()
}?);

let physical_device = unsafe { PhysicalDeviceContext::new(instance.clone()) }?;
let features = physical_device.features();
let compute = physical_device.queue_family_index(vk::QueueFlags::COMPUTE)?;
```

Both contexts tear themselves down on drop, in reverse construction order as
long as the `Arc` is respected.

[`raw-window-handle`]: https://crates.io/crates/raw-window-handle
*/

pub mod instance;
pub mod physical_device;

pub use instance::*;
pub use physical_device::*;

type BootstrapSmallVec<T> = smallvec::SmallVec<[T; 8]>;
