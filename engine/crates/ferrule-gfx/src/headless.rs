//! 不访问 GPU 的空后端
//!
//! 生成唯一的 handle，把录制的命令与提交按顺序记录到事件日志，
//! host buffer 用内存中的 `Vec<u8>` 模拟。fence 可以在提交时自动 signal，
//! 也可以由外部线程手动 signal，用来观察帧循环的阻塞行为。

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use ash::vk::{self, Handle};
use itertools::Itertools;
use parking_lot::{Condvar, Mutex};

use crate::{
    commands::submit_info::GfxSubmitInfo,
    descriptors::GfxDescriptorBinding,
    device::{GfxBufferWrite, GfxDevice},
    error::{GfxError, GfxResult},
    queue_family::GfxQueueFamily,
};

/// 提交时 fence 的行为
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadlessFenceMode {
    /// 提交后立刻 signal，相当于 GPU 瞬间执行完
    AutoSignal,
    /// 需要调用 [`HeadlessDevice::signal_fence`] 等接口
    Manual,
}

#[derive(Clone, Debug)]
pub struct HeadlessDeviceDesc {
    pub queue_families: Vec<GfxQueueFamily>,
    pub fence_mode: HeadlessFenceMode,
    /// 最多能同时存在的 semaphore 数量，`None` 表示不限制
    pub max_semaphores: Option<usize>,
}

impl Default for HeadlessDeviceDesc {
    /// 一个全能 family + 一个独立的 transfer family
    fn default() -> Self {
        Self {
            queue_families: vec![
                GfxQueueFamily::new(
                    "graphics",
                    0,
                    vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                    2,
                    true,
                ),
                GfxQueueFamily::new("transfer", 1, vk::QueueFlags::TRANSFER, 1, false),
            ],
            fence_mode: HeadlessFenceMode::AutoSignal,
            max_semaphores: None,
        }
    }
}

/// image barrier 中与同步相关的字段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadlessImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub aspect_mask: vk::ImageAspectFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadlessBufferBarrier {
    pub buffer: vk::Buffer,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

/// 事件日志中的一条记录
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeadlessEvent {
    BeginCommandBuffer {
        command_buffer: vk::CommandBuffer,
    },
    EndCommandBuffer {
        command_buffer: vk::CommandBuffer,
    },
    PipelineBarrier {
        command_buffer: vk::CommandBuffer,
        image_barriers: Vec<HeadlessImageBarrier>,
        buffer_barriers: Vec<HeadlessBufferBarrier>,
    },
    BeginLabel {
        command_buffer: vk::CommandBuffer,
        label: String,
    },
    EndLabel {
        command_buffer: vk::CommandBuffer,
    },
    InsertLabel {
        command_buffer: vk::CommandBuffer,
        label: String,
    },
    Submit {
        queue: vk::Queue,
        command_buffers: Vec<vk::CommandBuffer>,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    QueueBeginLabel {
        queue: vk::Queue,
        label: String,
    },
    QueueEndLabel {
        queue: vk::Queue,
    },
    QueueInsertLabel {
        queue: vk::Queue,
        label: String,
    },
    QueueWaitIdle {
        queue: vk::Queue,
    },
    DeviceWaitIdle,
    BufferWrite {
        buffer: vk::Buffer,
        range_count: usize,
        byte_count: usize,
    },
    FenceSignaled {
        fence: vk::Fence,
    },
    FenceWaitCompleted {
        fence: vk::Fence,
    },
    FenceReset {
        fence: vk::Fence,
    },
    CommandPoolReset {
        command_pool: vk::CommandPool,
    },
    DescriptorSetAllocated {
        descriptor_set: vk::DescriptorSet,
    },
}

struct HeadlessDescriptorPool {
    max_sets: u32,
    allocated: u32,
}

struct HeadlessFences {
    /// fence -> 是否 signaled
    states: HashMap<vk::Fence, bool>,
    /// Manual 模式下已提交但还没 signal 的 fence，按提交顺序
    pending: VecDeque<vk::Fence>,
}

pub struct HeadlessDevice {
    desc: HeadlessDeviceDesc,
    next_handle: AtomicU64,

    events: Mutex<Vec<HeadlessEvent>>,

    fences: Mutex<HeadlessFences>,
    fence_signaled: Condvar,

    live_semaphores: Mutex<usize>,
    /// 再成功提交多少次之后让下一次提交失败
    submit_failure_countdown: Mutex<Option<usize>>,
    buffers: Mutex<HashMap<vk::Buffer, Vec<u8>>>,
    descriptor_pools: Mutex<HashMap<vk::DescriptorPool, HeadlessDescriptorPool>>,
}

// new & init
impl HeadlessDevice {
    pub fn new(desc: HeadlessDeviceDesc) -> Self {
        Self {
            desc,
            // 0 是 null handle
            next_handle: AtomicU64::new(1),
            events: Mutex::new(Vec::new()),
            fences: Mutex::new(HeadlessFences {
                states: HashMap::new(),
                pending: VecDeque::new(),
            }),
            fence_signaled: Condvar::new(),
            live_semaphores: Mutex::new(0),
            submit_failure_countdown: Mutex::new(None),
            buffers: Mutex::new(HashMap::new()),
            descriptor_pools: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    fn mint<T: Handle>(&self) -> T {
        T::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    fn record(&self, event: HeadlessEvent) {
        self.events.lock().push(event);
    }
}
// 测试辅助
impl HeadlessDevice {
    /// 事件日志的快照
    pub fn events(&self) -> Vec<HeadlessEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// 读取 host buffer 的全部内容
    pub fn read_buffer(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.buffers.lock().get(&buffer).cloned()
    }

    pub fn live_semaphore_count(&self) -> usize {
        *self.live_semaphores.lock()
    }

    /// 模拟 GPU 执行完成：signal 指定 fence
    pub fn signal_fence(&self, fence: vk::Fence) {
        self.record(HeadlessEvent::FenceSignaled { fence });
        let mut fences = self.fences.lock();
        fences.pending.retain(|f| *f != fence);
        if let Some(state) = fences.states.get_mut(&fence) {
            *state = true;
        }
        self.fence_signaled.notify_all();
    }

    /// signal 最早提交的一个 fence
    pub fn signal_next_pending(&self) -> Option<vk::Fence> {
        let fence = self.fences.lock().pending.front().copied()?;
        self.signal_fence(fence);
        Some(fence)
    }

    pub fn pending_fence_count(&self) -> usize {
        self.fences.lock().pending.len()
    }

    /// 接下来 `successful_submits` 次提交正常，之后的一次提交返回错误
    pub fn fail_submit_after(&self, successful_submits: usize) {
        *self.submit_failure_countdown.lock() = Some(successful_submits);
    }

    /// 模拟 GPU 执行完所有已提交的工作
    fn drain_pending_fences(&self) {
        while self.signal_next_pending().is_some() {}
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.fences.lock().states.get(&fence).copied().unwrap_or(false)
    }
}

impl GfxDevice for HeadlessDevice {
    fn backend_name(&self) -> &str {
        "headless"
    }

    fn queue_families(&self) -> &[GfxQueueFamily] {
        &self.desc.queue_families
    }

    fn get_queue(&self, queue_family_index: u32, queue_index: u32) -> vk::Queue {
        // 保证同一个 (family, index) 总是得到同一个 handle
        vk::Queue::from_raw(0x1_0000_0000 | ((queue_family_index as u64) << 16) | queue_index as u64)
    }

    fn create_semaphore(&self, _debug_name: &str) -> GfxResult<vk::Semaphore> {
        let mut live = self.live_semaphores.lock();
        if let Some(max) = self.desc.max_semaphores
            && *live >= max
        {
            return Err(GfxError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        *live += 1;
        Ok(self.mint())
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
        let mut live = self.live_semaphores.lock();
        *live = live.saturating_sub(1);
    }

    fn create_fence(&self, signaled: bool, _debug_name: &str) -> GfxResult<vk::Fence> {
        let fence = self.mint();
        self.fences.lock().states.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut fences = self.fences.lock();
        fences.states.remove(&fence);
        fences.pending.retain(|f| *f != fence);
    }

    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GfxResult<bool> {
        let deadline = (timeout_ns != u64::MAX).then(|| Instant::now() + Duration::from_nanos(timeout_ns));

        let mut fences = self.fences.lock();
        loop {
            match fences.states.get(&fence) {
                None => return Err(GfxError::invalid_argument(format!("unknown fence {fence:?}"))),
                Some(true) => break,
                Some(false) => {}
            }
            match deadline {
                None => self.fence_signaled.wait(&mut fences),
                Some(deadline) => {
                    if self.fence_signaled.wait_until(&mut fences, deadline).timed_out()
                        && !fences.states.get(&fence).copied().unwrap_or(false)
                    {
                        return Ok(false);
                    }
                }
            }
        }
        drop(fences);

        self.record(HeadlessEvent::FenceWaitCompleted { fence });
        Ok(true)
    }

    fn reset_fence(&self, fence: vk::Fence) -> GfxResult<()> {
        let mut fences = self.fences.lock();
        let state = fences
            .states
            .get_mut(&fence)
            .ok_or_else(|| GfxError::invalid_argument(format!("unknown fence {fence:?}")))?;
        *state = false;
        drop(fences);

        self.record(HeadlessEvent::FenceReset { fence });
        Ok(())
    }

    fn create_command_pool(
        &self,
        _queue_family_index: u32,
        _flags: vk::CommandPoolCreateFlags,
        _debug_name: &str,
    ) -> GfxResult<vk::CommandPool> {
        Ok(self.mint())
    }

    fn reset_command_pool(&self, command_pool: vk::CommandPool) -> GfxResult<()> {
        self.record(HeadlessEvent::CommandPoolReset { command_pool });
        Ok(())
    }

    fn destroy_command_pool(&self, _command_pool: vk::CommandPool) {}

    fn allocate_command_buffer(
        &self,
        _command_pool: vk::CommandPool,
        _debug_name: &str,
    ) -> GfxResult<vk::CommandBuffer> {
        Ok(self.mint())
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _usage: vk::CommandBufferUsageFlags,
    ) -> GfxResult<()> {
        self.record(HeadlessEvent::BeginCommandBuffer { command_buffer });
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        self.record(HeadlessEvent::EndCommandBuffer { command_buffer });
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
    ) {
        let image_barriers = image_barriers
            .iter()
            .map(|b| HeadlessImageBarrier {
                image: b.image,
                old_layout: b.old_layout,
                new_layout: b.new_layout,
                src_stage: b.src_stage_mask,
                src_access: b.src_access_mask,
                dst_stage: b.dst_stage_mask,
                dst_access: b.dst_access_mask,
                src_queue_family: b.src_queue_family_index,
                dst_queue_family: b.dst_queue_family_index,
                aspect_mask: b.subresource_range.aspect_mask,
                base_mip_level: b.subresource_range.base_mip_level,
                level_count: b.subresource_range.level_count,
                base_array_layer: b.subresource_range.base_array_layer,
                layer_count: b.subresource_range.layer_count,
            })
            .collect_vec();
        let buffer_barriers = buffer_barriers
            .iter()
            .map(|b| HeadlessBufferBarrier {
                buffer: b.buffer,
                src_stage: b.src_stage_mask,
                src_access: b.src_access_mask,
                dst_stage: b.dst_stage_mask,
                dst_access: b.dst_access_mask,
                src_queue_family: b.src_queue_family_index,
                dst_queue_family: b.dst_queue_family_index,
            })
            .collect_vec();
        self.record(HeadlessEvent::PipelineBarrier {
            command_buffer,
            image_barriers,
            buffer_barriers,
        });
    }

    fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, label_name: &str, _label_color: [f32; 4]) {
        self.record(HeadlessEvent::BeginLabel {
            command_buffer,
            label: label_name.to_string(),
        });
    }

    fn cmd_end_label(&self, command_buffer: vk::CommandBuffer) {
        self.record(HeadlessEvent::EndLabel { command_buffer });
    }

    fn cmd_insert_label(&self, command_buffer: vk::CommandBuffer, label_name: &str, _label_color: [f32; 4]) {
        self.record(HeadlessEvent::InsertLabel {
            command_buffer,
            label: label_name.to_string(),
        });
    }

    fn queue_submit(&self, queue: vk::Queue, batches: &[GfxSubmitInfo], fence: vk::Fence) -> GfxResult<()> {
        {
            let fences = self.fences.lock();
            if fence != vk::Fence::null() && !fences.states.contains_key(&fence) {
                return Err(GfxError::invalid_argument(format!("unknown fence {fence:?}")));
            }
        }
        {
            let mut countdown = self.submit_failure_countdown.lock();
            match *countdown {
                Some(0) => {
                    *countdown = None;
                    return Err(GfxError::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
                }
                Some(n) => *countdown = Some(n - 1),
                None => {}
            }
        }

        self.record(HeadlessEvent::Submit {
            queue,
            command_buffers: batches.iter().flat_map(|b| b.command_buffers()).collect(),
            wait_semaphores: batches.iter().flat_map(|b| b.wait_semaphores().map(|(s, _)| s)).collect(),
            signal_semaphores: batches.iter().flat_map(|b| b.signal_semaphores().map(|(s, _)| s)).collect(),
            fence,
        });

        if fence != vk::Fence::null() {
            match self.desc.fence_mode {
                HeadlessFenceMode::AutoSignal => self.signal_fence(fence),
                HeadlessFenceMode::Manual => self.fences.lock().pending.push_back(fence),
            }
        }
        Ok(())
    }

    fn queue_begin_label(&self, queue: vk::Queue, label_name: &str, _label_color: [f32; 4]) {
        self.record(HeadlessEvent::QueueBeginLabel {
            queue,
            label: label_name.to_string(),
        });
    }

    fn queue_end_label(&self, queue: vk::Queue) {
        self.record(HeadlessEvent::QueueEndLabel { queue });
    }

    fn queue_insert_label(&self, queue: vk::Queue, label_name: &str, _label_color: [f32; 4]) {
        self.record(HeadlessEvent::QueueInsertLabel {
            queue,
            label: label_name.to_string(),
        });
    }

    /// headless 不区分 queue，等同于整个设备 idle
    fn queue_wait_idle(&self, queue: vk::Queue) -> GfxResult<()> {
        self.drain_pending_fences();
        self.record(HeadlessEvent::QueueWaitIdle { queue });
        Ok(())
    }

    fn device_wait_idle(&self) -> GfxResult<()> {
        self.drain_pending_fences();
        self.record(HeadlessEvent::DeviceWaitIdle);
        Ok(())
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
        _debug_name: &str,
    ) -> GfxResult<vk::DescriptorPool> {
        let pool = self.mint();
        self.descriptor_pools.lock().insert(pool, HeadlessDescriptorPool { max_sets, allocated: 0 });
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, descriptor_pool: vk::DescriptorPool) {
        self.descriptor_pools.lock().remove(&descriptor_pool);
    }

    fn allocate_descriptor_set(
        &self,
        descriptor_pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> GfxResult<vk::DescriptorSet> {
        let mut pools = self.descriptor_pools.lock();
        let pool = pools
            .get_mut(&descriptor_pool)
            .ok_or_else(|| GfxError::invalid_argument(format!("unknown descriptor pool {descriptor_pool:?}")))?;
        if pool.allocated >= pool.max_sets {
            return Err(GfxError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        pool.allocated += 1;
        drop(pools);

        let descriptor_set = self.mint();
        self.record(HeadlessEvent::DescriptorSetAllocated { descriptor_set });
        Ok(descriptor_set)
    }

    fn update_descriptor_set(&self, _descriptor_set: vk::DescriptorSet, _bindings: &[GfxDescriptorBinding]) {}

    fn create_host_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        _debug_name: &str,
    ) -> GfxResult<vk::Buffer> {
        let buffer = self.mint();
        self.buffers.lock().insert(buffer, vec![0; size as usize]);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.buffers.lock().remove(&buffer);
    }

    fn write_buffer(&self, buffer: vk::Buffer, writes: &[GfxBufferWrite<'_>]) -> GfxResult<()> {
        let mut buffers = self.buffers.lock();
        let memory = buffers
            .get_mut(&buffer)
            .ok_or_else(|| GfxError::invalid_argument(format!("buffer {buffer:?} is not a host buffer")))?;
        for write in writes {
            let begin = write.offset as usize;
            let end = begin + write.data.len();
            if end > memory.len() {
                return Err(GfxError::invalid_argument(format!(
                    "write [{begin}, {end}) out of buffer size {}",
                    memory.len()
                )));
            }
            memory[begin..end].copy_from_slice(write.data);
        }
        drop(buffers);

        self.record(HeadlessEvent::BufferWrite {
            buffer,
            range_count: writes.len(),
            byte_count: writes.iter().map(|w| w.data.len()).sum(),
        });
        Ok(())
    }
}
