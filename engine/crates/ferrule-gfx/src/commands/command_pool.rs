use ash::vk;

use crate::{commands::command_buffer::GfxCommandBuffer, device::GfxDevice, error::GfxResult};

/// command pool 是和 queue family 绑定的，而不是和 queue 绑定的
pub struct GfxCommandPool {
    handle: vk::CommandPool,
    queue_family_index: u32,

    debug_name: String,
    valid: bool,
}
// init & destroy
impl GfxCommandPool {
    pub fn new(
        device: &dyn GfxDevice,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
        debug_name: &str,
    ) -> GfxResult<Self> {
        let handle = device.create_command_pool(queue_family_index, flags, debug_name)?;
        Ok(Self {
            handle,
            queue_family_index,
            debug_name: debug_name.to_string(),
            valid: true,
        })
    }

    pub fn destroy(mut self, device: &dyn GfxDevice) {
        device.destroy_command_pool(self.handle);
        self.valid = false;
    }
}

// getters
impl GfxCommandPool {
    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
}
// tools
impl GfxCommandPool {
    /// 这个调用并不会释放资源，而是将 pool 内的 command buffer 设置到初始状态
    ///
    /// reset 之后，pool 内的 command buffer 又可以重新录制命令
    pub fn reset_all_buffers(&self, device: &dyn GfxDevice) -> GfxResult<()> {
        device.reset_command_pool(self.handle)
    }

    pub fn allocate_command_buffer(&self, device: &dyn GfxDevice, debug_name: &str) -> GfxResult<GfxCommandBuffer> {
        let handle = device.allocate_command_buffer(self.handle, debug_name)?;
        Ok(GfxCommandBuffer::from_raw(handle, self.queue_family_index))
    }
}

impl Drop for GfxCommandPool {
    fn drop(&mut self) {
        debug_assert!(!self.valid, "CommandPool {} must be destroyed manually.", self.debug_name);
    }
}
