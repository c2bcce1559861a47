use std::{process::exit, sync::Arc};

use ash::vk;
use vk_context::{DebugMessenger, InstanceContext, PhysicalDeviceContext, ValidationLayers};
use winit::{event_loop::EventLoop, window::WindowBuilder};

fn main() {
    env_logger::init();

    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("vk-context")
        .with_visible(false)
        .build(&event_loop)
        .expect("window creation failed");

    let instance_builder = InstanceContext::builder()
        .app_name("vk-context bootstrap")
        .unwrap()
        .validation_layers(ValidationLayers::Request)
        .request_debug_messenger(DebugMessenger::Default)
        .require_surface_extensions(&window)
        .expect("no surface extensions for this display");

    let instance = match unsafe { instance_builder.build() } {
        Ok(instance) => Arc::new(instance),
        Err(err) => {
            log::error!("instance creation failed: {err}");
            exit(-1);
        }
    };
    log::info!("{:?}", instance.metadata());

    let physical_device = match unsafe { PhysicalDeviceContext::new(instance.clone()) } {
        Ok(physical_device) => physical_device,
        Err(err) => {
            log::error!("physical device selection failed: {err}");
            exit(-1);
        }
    };

    let features = physical_device.features();
    log::info!(
        "{:?} supports geometry shaders: {}",
        physical_device.device_name(),
        features.geometry_shader == vk::TRUE
    );

    match physical_device.queue_family_index(vk::QueueFlags::GRAPHICS) {
        Ok(index) => log::info!("graphics queue family: {index}"),
        Err(err) => {
            log::error!("{err}");
            exit(-1);
        }
    }
}
