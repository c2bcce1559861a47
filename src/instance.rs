//! Instance context creation and teardown.
use std::{
    borrow::Cow,
    ffi::{c_void, CStr, CString, NulError},
    fmt,
    os::raw::c_char,
};

use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry, Instance, LoadingError};
use cstr::cstr;
#[cfg(feature = "surface")]
use raw_window_handle::HasRawDisplayHandle;
use thiserror::Error;

use crate::BootstrapSmallVec;

/// Require, request or disable validation layers.
#[derive(Debug, Copy, Clone)]
pub enum ValidationLayers {
    /// Instance creation will fail if there are no validation layers installed.
    Require,
    /// If there are validation layers installed, enable them.
    Request,
    /// Don't enable validation layers.
    Disable,
}

/// Enable or disable the debug messenger, optionally providing a custom callback.
#[derive(Copy, Clone)]
pub enum DebugMessenger {
    /// Enables the debug messenger with the [`default_debug_callback`]
    /// callback.
    Default,
    /// Enables the debug messenger with a custom, user-provided callback.
    Custom {
        /// The user provided callback function. Feel free to take a look at the
        /// [`default_debug_callback`] when implementing your own.
        callback: vk::PFN_vkDebugUtilsMessengerCallbackEXT,
        /// A user data pointer passed to the debug callback.
        user_data_pointer: *mut c_void,
    },
    /// Disables the debug messenger.
    Disable,
}

/// The default debug callback used in [`DebugMessenger::Default`].
///
/// Mirrors every validation message to the error stream through [`log`] and
/// always tells the runtime not to abort the triggering call.
pub unsafe extern "system" fn default_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if (*p_callback_data).p_message.is_null() {
        Cow::from("")
    } else {
        CStr::from_ptr((*p_callback_data).p_message).to_string_lossy()
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[{message_type:?}] {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[{message_type:?}] {message}")
        }
        _ => log::debug!("[{message_type:?}] {message}"),
    }

    vk::FALSE
}

/// Metadata recorded while the instance was built.
#[derive(Clone)]
pub struct InstanceMetadata {
    api_version: u32,
    enabled_layers: BootstrapSmallVec<CString>,
    enabled_extensions: BootstrapSmallVec<CString>,
}

impl InstanceMetadata {
    /// Retrieve the used instance API version.
    #[inline]
    pub fn api_version_raw(&self) -> u32 {
        self.api_version
    }

    /// Retrieve the used instance API major version.
    #[inline]
    pub fn api_version_major(&self) -> u32 {
        vk::api_version_major(self.api_version)
    }

    /// Retrieve the used instance API minor version.
    #[inline]
    pub fn api_version_minor(&self) -> u32 {
        vk::api_version_minor(self.api_version)
    }

    /// List of all enabled layers in the instance.
    #[inline]
    pub fn enabled_layers(&self) -> &[CString] {
        &self.enabled_layers
    }

    /// List of all enabled extensions in the instance.
    #[inline]
    pub fn enabled_extensions(&self) -> &[CString] {
        &self.enabled_extensions
    }

    /// Returns true if `extension` is enabled.
    #[inline]
    pub fn is_extension_enabled(&self, extension: &CStr) -> bool {
        self.enabled_extensions
            .iter()
            .any(|i| i.as_c_str() == extension)
    }
}

impl fmt::Debug for InstanceMetadata {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("InstanceMetadata")
            .field(
                "api_version",
                &format_args!("{}.{}", self.api_version_major(), self.api_version_minor()),
            )
            .field("enabled_layers", &self.enabled_layers)
            .field("enabled_extensions", &self.enabled_extensions)
            .finish()
    }
}

/// Errors that can occur during instance context creation.
#[derive(Debug, Error)]
pub enum InstanceCreationError {
    /// Vulkan Error.
    #[error("vulkan error")]
    VulkanError(#[from] vk::Result),
    /// One or more layers are not present.
    #[error("layers ({0:?}) not present")]
    LayersNotPresent(BootstrapSmallVec<CString>),
    /// One or more extensions are not present.
    #[error("extensions ({0:?}) not present")]
    ExtensionsNotPresent(BootstrapSmallVec<CString>),
    /// The Vulkan entry point loader failed.
    #[error("loader creation error")]
    LoaderCreation(#[from] LoadingError),
}

/// Filters `requested` names against the supported set, keeping request order
/// and dropping duplicates. A missing name is a hard error when it was
/// required and silently skipped otherwise.
///
/// # Safety
///
/// Every pointer in `requested` must point to a valid null-terminated string.
unsafe fn filter_supported(
    requested: &[(*const c_char, bool)],
    is_supported: impl Fn(&CStr) -> bool,
) -> Result<BootstrapSmallVec<*const c_char>, BootstrapSmallVec<CString>> {
    let mut enabled: BootstrapSmallVec<*const c_char> = BootstrapSmallVec::new();
    let mut not_present = BootstrapSmallVec::new();
    for &(name, required) in requested {
        let cstr = CStr::from_ptr(name);
        let already_enabled = enabled.iter().any(|&e| CStr::from_ptr(e) == cstr);

        match (required, is_supported(cstr)) {
            (_, true) => {
                if !already_enabled {
                    enabled.push(name);
                }
            }
            (true, false) => not_present.push(cstr.to_owned()),
            (false, false) => (),
        }
    }

    if not_present.is_empty() {
        Ok(enabled)
    } else {
        Err(not_present)
    }
}

/// Owns a Vulkan instance together with its optional debug messenger.
///
/// Built through [`InstanceContextBuilder`]. Teardown happens on drop: the
/// messenger is destroyed before the instance, and never twice.
pub struct InstanceContext {
    entry: Entry,
    instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    allocator: Option<vk::AllocationCallbacks>,
    metadata: InstanceMetadata,
}

impl InstanceContext {
    /// Start building an instance context.
    #[inline]
    pub fn builder() -> InstanceContextBuilder {
        InstanceContextBuilder::new()
    }

    /// The raw instance handle, for calls expecting one.
    #[inline]
    pub fn handle(&self) -> vk::Instance {
        self.instance.handle()
    }

    /// The loaded instance function table.
    #[inline]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// The Vulkan entry points the instance was created from.
    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// The debug messenger handle, if one was created.
    #[inline]
    pub fn debug_messenger(&self) -> Option<vk::DebugUtilsMessengerEXT> {
        self.debug.as_ref().map(|(_, messenger)| *messenger)
    }

    /// The allocation callbacks all context teardown calls use.
    #[inline]
    pub fn allocation_callbacks(&self) -> Option<&vk::AllocationCallbacks> {
        self.allocator.as_ref()
    }

    /// Metadata about what is actually enabled in the instance.
    #[inline]
    pub fn metadata(&self) -> &InstanceMetadata {
        &self.metadata
    }
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        unsafe {
            // Messenger first, it is bound to the instance lifetime.
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, self.allocator.as_ref());
            }
            self.instance.destroy_instance(self.allocator.as_ref());
        }
    }
}

impl fmt::Debug for InstanceContext {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("InstanceContext")
            .field("handle", &self.instance.handle())
            .field("debug_messenger", &self.debug_messenger())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Configuration for [`InstanceContext`] creation.
pub struct InstanceContextBuilder {
    app_name: Option<CString>,
    app_version: Option<u32>,
    required_api_version: u32,
    layers: BootstrapSmallVec<(*const c_char, bool)>,
    extensions: BootstrapSmallVec<(*const c_char, bool)>,
    debug_messenger: DebugMessenger,
    debug_message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    debug_message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    allocator: Option<vk::AllocationCallbacks>,
}

impl InstanceContextBuilder {
    /// Create a new instance context builder with opinionated defaults.
    #[inline]
    pub fn new() -> Self {
        InstanceContextBuilder {
            app_name: None,
            app_version: None,
            required_api_version: vk::API_VERSION_1_0,
            layers: BootstrapSmallVec::new(),
            extensions: BootstrapSmallVec::new(),
            debug_messenger: DebugMessenger::Disable,
            debug_message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            debug_message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            allocator: None,
        }
    }

    /// Application name to advertise.
    #[inline]
    pub fn app_name(mut self, app_name: &str) -> Result<Self, NulError> {
        self.app_name = Some(CString::new(app_name)?);
        Ok(self)
    }

    /// Application version to advertise.
    #[inline]
    pub fn app_version(mut self, major: u32, minor: u32) -> Self {
        self.app_version = Some(vk::make_api_version(0, major, minor, 0));
        self
    }

    /// Instance API version to be used as minimum requirement.
    #[inline]
    pub fn require_api_version(mut self, major: u32, minor: u32) -> Self {
        self.required_api_version = vk::make_api_version(0, major, minor, 0);
        self
    }

    /// Try to enable this layer, ignore if it's not supported.
    #[inline]
    pub fn request_layer(mut self, layer: &'static CStr) -> Self {
        self.layers.push((layer.as_ptr(), false));
        self
    }

    /// Enable this layer, fail if it's not supported.
    #[inline]
    pub fn require_layer(mut self, layer: &'static CStr) -> Self {
        self.layers.push((layer.as_ptr(), true));
        self
    }

    /// Try to enable this extension, ignore if it is not supported.
    #[inline]
    pub fn request_extension(mut self, extension: &'static CStr) -> Self {
        self.extensions.push((extension.as_ptr(), false));
        self
    }

    /// Enable this extension, fail if it's not supported.
    #[inline]
    pub fn require_extension(mut self, extension: &'static CStr) -> Self {
        self.extensions.push((extension.as_ptr(), true));
        self
    }

    #[cfg(feature = "surface")]
    /// Adds a requirement on all Vulkan extensions necessary to create a
    /// surface on `display_handle`. Returns `None` if the corresponding
    /// surface extensions couldn't be found. Only available on feature
    /// `surface`.
    #[inline]
    pub fn require_surface_extensions(
        mut self,
        display_handle: &impl HasRawDisplayHandle,
    ) -> Option<Self> {
        let required_extensions =
            ash_window::enumerate_required_extensions(display_handle.raw_display_handle()).ok()?;
        if log::log_enabled!(log::Level::Debug) {
            for &name in required_extensions {
                log::debug!("window system requires instance extension: {:?}", unsafe {
                    CStr::from_ptr(name)
                });
            }
        }
        self.extensions
            .extend(required_extensions.iter().map(|&name| (name, true)));
        Some(self)
    }

    /// Add Khronos validation layers.
    #[inline]
    pub fn validation_layers(mut self, validation_layers: ValidationLayers) -> Self {
        match validation_layers {
            ValidationLayers::Require | ValidationLayers::Request => {
                self.layers.push((
                    cstr!("VK_LAYER_KHRONOS_validation").as_ptr(),
                    matches!(validation_layers, ValidationLayers::Require),
                ));
            }
            ValidationLayers::Disable => (),
        }

        self
    }

    /// Try to create a debug messenger with the config provided by
    /// `debug_messenger`.
    #[inline]
    pub fn request_debug_messenger(mut self, debug_messenger: DebugMessenger) -> Self {
        if !matches!(debug_messenger, DebugMessenger::Disable) {
            self.extensions
                .push((vk::ExtDebugUtilsFn::name().as_ptr(), false));
        }

        self.debug_messenger = debug_messenger;
        self
    }

    /// Filter for the severity of debug messages.
    #[inline]
    pub fn debug_message_severity(
        mut self,
        severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    ) -> Self {
        self.debug_message_severity = severity;
        self
    }

    /// Filter for the type of debug messages.
    #[inline]
    pub fn debug_message_type(mut self, ty: vk::DebugUtilsMessageTypeFlagsEXT) -> Self {
        self.debug_message_type = ty;
        self
    }

    /// Allocation callbacks to use for instance creation and teardown.
    #[inline]
    pub fn allocation_callbacks(mut self, allocator: vk::AllocationCallbacks) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Load the Vulkan entry points and build the [`InstanceContext`].
    ///
    /// # Safety
    ///
    /// Loads the Vulkan shared library and calls into the driver.
    pub unsafe fn build(self) -> Result<InstanceContext, InstanceCreationError> {
        let entry = Entry::load()?;

        let layer_properties = entry.enumerate_instance_layer_properties()?;
        let enabled_layers = filter_supported(&self.layers, |layer| {
            layer_properties
                .iter()
                .any(|supported| CStr::from_ptr(supported.layer_name.as_ptr()) == layer)
        })
        .map_err(InstanceCreationError::LayersNotPresent)?;

        let mut extension_properties = entry.enumerate_instance_extension_properties(None)?;
        for &layer_name in &enabled_layers {
            extension_properties.extend(
                entry
                    .enumerate_instance_extension_properties(Some(CStr::from_ptr(layer_name)))?
                    .into_iter(),
            );
        }

        if log::log_enabled!(log::Level::Debug) {
            for supported in &extension_properties {
                log::debug!(
                    "supported instance extension: {:?}",
                    CStr::from_ptr(supported.extension_name.as_ptr())
                );
            }
        }

        let enabled_extensions = filter_supported(&self.extensions, |extension| {
            extension_properties
                .iter()
                .any(|supported| CStr::from_ptr(supported.extension_name.as_ptr()) == extension)
        })
        .map_err(InstanceCreationError::ExtensionsNotPresent)?;

        let debug_utils_cstr = vk::ExtDebugUtilsFn::name();
        let is_debug_utils_enabled = enabled_extensions
            .iter()
            .any(|&name| CStr::from_ptr(name) == debug_utils_cstr);

        let mut app_info = vk::ApplicationInfo::builder().api_version(self.required_api_version);

        let app_name;
        if let Some(val) = self.app_name {
            app_name = val;
            app_info = app_info.application_name(&app_name);
        }

        if let Some(app_version) = self.app_version {
            app_info = app_info.application_version(app_version);
        }

        let mut instance_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&enabled_layers)
            .enabled_extension_names(&enabled_extensions);

        let should_create_debug_messenger = !matches!(
            (&self.debug_messenger, is_debug_utils_enabled),
            (DebugMessenger::Disable, _) | (_, false)
        );

        let messenger_info = should_create_debug_messenger.then(|| {
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(self.debug_message_severity)
                .message_type(self.debug_message_type);
            match self.debug_messenger {
                DebugMessenger::Default => {
                    messenger_info.pfn_user_callback(Some(default_debug_callback))
                }
                DebugMessenger::Custom {
                    callback,
                    user_data_pointer,
                } => messenger_info
                    .pfn_user_callback(callback)
                    .user_data(user_data_pointer),
                DebugMessenger::Disable => unreachable!(),
            }
            .build()
        });

        // Covers instance creation and destruction with validation as well.
        let mut instance_messenger_info;
        if let Some(messenger_info) = messenger_info {
            instance_messenger_info = messenger_info;
            instance_info = instance_info.push_next(&mut instance_messenger_info);
        }

        let instance = entry.create_instance(&instance_info, self.allocator.as_ref())?;

        let debug = match messenger_info {
            Some(messenger_info) => {
                let loader = DebugUtils::new(&entry, &instance);
                match loader.create_debug_utils_messenger(&messenger_info, self.allocator.as_ref())
                {
                    Ok(messenger) => Some((loader, messenger)),
                    Err(err) => {
                        instance.destroy_instance(self.allocator.as_ref());
                        return Err(err.into());
                    }
                }
            }
            None => None,
        };

        let metadata = InstanceMetadata {
            api_version: self.required_api_version,
            enabled_layers: enabled_layers
                .into_iter()
                .map(|ptr| CStr::from_ptr(ptr).to_owned())
                .collect(),
            enabled_extensions: enabled_extensions
                .into_iter()
                .map(|ptr| CStr::from_ptr(ptr).to_owned())
                .collect(),
        };

        Ok(InstanceContext {
            entry,
            instance,
            debug,
            allocator: self.allocator,
            metadata,
        })
    }
}

impl Default for InstanceContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cstr::cstr;

    const EXT_A: &CStr = cstr!("VK_KHR_surface");
    const EXT_B: &CStr = cstr!("VK_KHR_xcb_surface");
    const EXT_MISSING: &CStr = cstr!("VK_NOT_a_real_extension");

    fn supported(name: &CStr) -> bool {
        name == EXT_A || name == EXT_B || name == vk::ExtDebugUtilsFn::name()
    }

    fn names(enabled: &[*const c_char]) -> Vec<&'static CStr> {
        enabled
            .iter()
            .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
            .collect()
    }

    #[test]
    fn enabled_extensions_keep_request_order() {
        let requested = [
            (EXT_A.as_ptr(), true),
            (EXT_B.as_ptr(), true),
            (vk::ExtDebugUtilsFn::name().as_ptr(), false),
        ];
        let enabled = unsafe { filter_supported(&requested, supported) }.unwrap();
        assert_eq!(names(&enabled), [EXT_A, EXT_B, vk::ExtDebugUtilsFn::name()]);
    }

    #[test]
    fn duplicate_requests_enable_once() {
        let requested = [
            (EXT_A.as_ptr(), true),
            (EXT_B.as_ptr(), true),
            (EXT_A.as_ptr(), false),
        ];
        let enabled = unsafe { filter_supported(&requested, supported) }.unwrap();
        assert_eq!(names(&enabled), [EXT_A, EXT_B]);
    }

    #[test]
    fn missing_required_extension_is_an_error() {
        let requested = [(EXT_A.as_ptr(), true), (EXT_MISSING.as_ptr(), true)];
        let not_present = unsafe { filter_supported(&requested, supported) }.unwrap_err();
        assert_eq!(not_present.as_slice(), [EXT_MISSING.to_owned()]);
    }

    #[test]
    fn missing_requested_extension_is_skipped() {
        let requested = [(EXT_MISSING.as_ptr(), false), (EXT_B.as_ptr(), true)];
        let enabled = unsafe { filter_supported(&requested, supported) }.unwrap();
        assert_eq!(names(&enabled), [EXT_B]);
    }
}
