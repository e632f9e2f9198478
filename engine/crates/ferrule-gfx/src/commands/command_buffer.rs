use ash::vk;

use crate::{
    basic::color::LabelColor,
    commands::barrier::{GfxBufferBarrier, GfxImageBarrier},
    device::GfxDevice,
    error::GfxResult,
};

/// 命令缓冲封装
///
/// 只保存 handle，录制时显式传入 device。
///
/// # 使用示例
/// ```ignore
/// let cmd = pool.allocate_command_buffer(device, "gbuffer")?;
/// cmd.begin(device, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, "gbuffer")?;
/// // 录制命令...
/// cmd.end(device)?;
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GfxCommandBuffer {
    vk_handle: vk::CommandBuffer,
    queue_family_index: u32,
}
// new & init
impl GfxCommandBuffer {
    #[inline]
    pub fn from_raw(vk_handle: vk::CommandBuffer, queue_family_index: u32) -> Self {
        Self {
            vk_handle,
            queue_family_index,
        }
    }
}
// Basic 命令
impl GfxCommandBuffer {
    /// 开始录制 command
    ///
    /// 自动设置 debug label
    #[inline]
    pub fn begin(
        &self,
        device: &dyn GfxDevice,
        usage_flag: vk::CommandBufferUsageFlags,
        debug_label_name: &str,
    ) -> GfxResult<()> {
        device.begin_command_buffer(self.vk_handle, usage_flag)?;
        self.begin_label(device, debug_label_name, LabelColor::COLOR_CMD);
        Ok(())
    }

    /// 结束录制 command
    ///
    /// 结束 debug label
    #[inline]
    pub fn end(&self, device: &dyn GfxDevice) -> GfxResult<()> {
        self.end_label(device);
        device.end_command_buffer(self.vk_handle)
    }
}
// getters
impl GfxCommandBuffer {
    #[inline]
    pub fn vk_handle(&self) -> vk::CommandBuffer {
        self.vk_handle
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
}
// 同步命令
impl GfxCommandBuffer {
    /// 所有 barrier 合并进一条 pipeline barrier 命令
    ///
    /// - command type: synchronization
    /// - supported queue types: transfer, graphics, compute
    pub fn pipeline_barrier(
        &self,
        device: &dyn GfxDevice,
        image_barriers: &[GfxImageBarrier],
        buffer_barriers: &[GfxBufferBarrier],
    ) {
        let image_barriers = image_barriers.iter().map(|b| *b.inner()).collect::<Vec<_>>();
        let buffer_barriers = buffer_barriers.iter().map(|b| *b.inner()).collect::<Vec<_>>();
        device.cmd_pipeline_barrier(self.vk_handle, &image_barriers, &buffer_barriers);
    }
}
// debug 相关命令
impl GfxCommandBuffer {
    #[inline]
    pub fn begin_label(&self, device: &dyn GfxDevice, label_name: &str, label_color: [f32; 4]) {
        device.cmd_begin_label(self.vk_handle, label_name, label_color);
    }

    #[inline]
    pub fn end_label(&self, device: &dyn GfxDevice) {
        device.cmd_end_label(self.vk_handle);
    }

    #[inline]
    pub fn insert_label(&self, device: &dyn GfxDevice, label_name: &str, label_color: [f32; 4]) {
        device.cmd_insert_label(self.vk_handle, label_name, label_color);
    }
}
