//! frame-in-flight slot
//!
//! 每个 slot 有一个 fence 和每个 queue family 一个 command pool，初始化时创建，
//! 之后一直复用。slot N 的 fence signal 之前，CPU 不能改写与 slot N 相关的资源。

use std::time::Duration;

use ash::vk;
use ferrule_gfx::{
    commands::{command_buffer::GfxCommandBuffer, command_pool::GfxCommandPool, fence::GfxFence},
    device::GfxDevice,
    error::{GfxError, GfxResult},
};

struct SlotCommandPool {
    pool: GfxCommandPool,
    /// 已分配的 command buffer；pool reset 之后按顺序复用
    command_buffers: Vec<GfxCommandBuffer>,
    cursor: usize,
}

pub struct FrameSlot {
    index: usize,
    /// 创建时就是 signaled，第一次复用时不会阻塞
    fence: GfxFence,
    pools: Vec<SlotCommandPool>,
}

// new & init
impl FrameSlot {
    pub fn new(device: &dyn GfxDevice, index: usize, queue_family_indices: &[u32]) -> GfxResult<Self> {
        let fence = GfxFence::new(device, true, &format!("frame-slot-{index}-fence"))?;
        let mut pools = Vec::with_capacity(queue_family_indices.len());
        for &family in queue_family_indices {
            let pool = GfxCommandPool::new(
                device,
                family,
                vk::CommandPoolCreateFlags::TRANSIENT,
                &format!("frame-slot-{index}-family-{family}"),
            )?;
            pools.push(SlotCommandPool {
                pool,
                command_buffers: vec![],
                cursor: 0,
            });
        }

        Ok(Self { index, fence, pools })
    }
}

// getters
impl FrameSlot {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn fence(&self) -> &GfxFence {
        &self.fence
    }
}

// tools
impl FrameSlot {
    /// 等待这个 slot 上一次提交的 GPU 工作完成
    ///
    /// `timeout` 为 `None` 时无限等待；超时视为设备丢失
    pub fn wait(&self, device: &dyn GfxDevice, timeout: Option<Duration>) -> GfxResult<()> {
        let _span = tracy_client::span!("FrameSlot::wait");
        let timeout_ns = timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX - 1));
        if !self.fence.wait(device, timeout_ns)? {
            log::error!("frame slot {} fence not signaled within {:?}", self.index, timeout);
            return Err(GfxError::device_lost(format!("frame slot {} fence wait timed out", self.index)));
        }
        Ok(())
    }

    /// 提交这个 slot 的最后一个 stage 之前调用
    #[inline]
    pub fn reset_fence(&self, device: &dyn GfxDevice) -> GfxResult<()> {
        self.fence.reset(device)
    }

    /// 所有 command buffer 回到初始状态，可以重新录制
    pub fn reset_command_pools(&mut self, device: &dyn GfxDevice) -> GfxResult<()> {
        for slot_pool in &mut self.pools {
            slot_pool.pool.reset_all_buffers(device)?;
            slot_pool.cursor = 0;
        }
        Ok(())
    }

    /// 取一个可以录制的 command buffer，优先复用之前分配的
    pub fn command_buffer(
        &mut self,
        device: &dyn GfxDevice,
        queue_family_index: u32,
        debug_name: &str,
    ) -> GfxResult<GfxCommandBuffer> {
        let index = self.index;
        let slot_pool = self
            .pools
            .iter_mut()
            .find(|p| p.pool.queue_family_index() == queue_family_index)
            .ok_or_else(|| {
                GfxError::invalid_argument(format!("frame slot {index} has no command pool for family {queue_family_index}"))
            })?;

        let command_buffer = match slot_pool.command_buffers.get(slot_pool.cursor) {
            Some(cmd) => *cmd,
            None => {
                let cmd = slot_pool.pool.allocate_command_buffer(device, &format!("[slot-{index}]{debug_name}"))?;
                slot_pool.command_buffers.push(cmd);
                cmd
            }
        };
        slot_pool.cursor += 1;
        Ok(command_buffer)
    }
}

// destroy
impl FrameSlot {
    pub fn destroy(self, device: &dyn GfxDevice) {
        for slot_pool in self.pools {
            slot_pool.pool.destroy(device);
        }
        self.fence.destroy(device);
    }
}
