use ash::vk;

use crate::{
    commands::submit_info::GfxSubmitInfo, descriptors::GfxDescriptorBinding, error::GfxResult,
    queue_family::GfxQueueFamily,
};

/// 向 host-visible buffer 写入的一段数据
#[derive(Clone, Copy, Debug)]
pub struct GfxBufferWrite<'a> {
    pub offset: vk::DeviceSize,
    pub data: &'a [u8],
}

/// 设备接口
///
/// 渲染核心只通过这个 trait 访问 GPU。实现必须可以跨线程共享：
/// copy 任务会在 worker 线程上调用 [`GfxDevice::write_buffer`]。
///
/// 所有 `destroy_*` 都要求对象已经不再被 GPU 使用。
pub trait GfxDevice: Send + Sync {
    /// 后端名称，仅用于日志
    fn backend_name(&self) -> &str;

    fn queue_families(&self) -> &[GfxQueueFamily];

    fn get_queue(&self, queue_family_index: u32, queue_index: u32) -> vk::Queue;

    // 同步原语
    fn create_semaphore(&self, debug_name: &str) -> GfxResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_fence(&self, signaled: bool, debug_name: &str) -> GfxResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// 阻塞等待 fence；`timeout_ns` 到期返回 `Ok(false)`
    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GfxResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> GfxResult<()>;

    // command
    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
        debug_name: &str,
    ) -> GfxResult<vk::CommandPool>;
    fn reset_command_pool(&self, command_pool: vk::CommandPool) -> GfxResult<()>;
    fn destroy_command_pool(&self, command_pool: vk::CommandPool);
    fn allocate_command_buffer(&self, command_pool: vk::CommandPool, debug_name: &str)
    -> GfxResult<vk::CommandBuffer>;
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> GfxResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()>;

    /// 录制一条 pipeline barrier 命令，包含所有给定的 barrier
    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
    );
    fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, label_name: &str, label_color: [f32; 4]);
    fn cmd_end_label(&self, command_buffer: vk::CommandBuffer);
    fn cmd_insert_label(&self, command_buffer: vk::CommandBuffer, label_name: &str, label_color: [f32; 4]);

    /// 同一个 queue 的提交需要外部同步，由调用方保证
    fn queue_submit(&self, queue: vk::Queue, batches: &[GfxSubmitInfo], fence: vk::Fence) -> GfxResult<()>;
    fn queue_begin_label(&self, queue: vk::Queue, label_name: &str, label_color: [f32; 4]);
    fn queue_end_label(&self, queue: vk::Queue);
    fn queue_insert_label(&self, queue: vk::Queue, label_name: &str, label_color: [f32; 4]);
    fn queue_wait_idle(&self, queue: vk::Queue) -> GfxResult<()>;
    /// 等待所有 queue 上的工作完成，只在 shutdown 时使用
    fn device_wait_idle(&self) -> GfxResult<()>;

    // descriptor
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        debug_name: &str,
    ) -> GfxResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, descriptor_pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        descriptor_pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> GfxResult<vk::DescriptorSet>;
    fn update_descriptor_set(&self, descriptor_set: vk::DescriptorSet, bindings: &[GfxDescriptorBinding]);

    // host-visible buffer
    fn create_host_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        debug_name: &str,
    ) -> GfxResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// map -> 逐段 copy -> flush -> unmap
    fn write_buffer(&self, buffer: vk::Buffer, writes: &[GfxBufferWrite<'_>]) -> GfxResult<()>;
}
