//! Barrier 批处理
//!
//! 把一组期望的子资源状态与状态表做 diff，只为真正发生变化的子资源生成 barrier，
//! 并把一批请求（可以跨多个资源）合并成一条 pipeline barrier 命令。

use std::sync::Arc;

use ferrule_gfx::{commands::command_buffer::GfxCommandBuffer, device::GfxDevice, error::GfxResult};

use crate::{
    handles::{GfxBufferHandle, GfxImageHandle, GfxResourceHandle},
    resource_state::{SubresourceRange, SubresourceState},
    state_table::ResourceStateTable,
};

/// 一个状态转换请求
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionRequest {
    pub resource: GfxResourceHandle,
    pub range: SubresourceRange,
    pub desired: SubresourceState,
}

impl TransitionRequest {
    #[inline]
    pub fn image(handle: GfxImageHandle, range: SubresourceRange, desired: SubresourceState) -> Self {
        Self {
            resource: handle.into(),
            range,
            desired,
        }
    }

    #[inline]
    pub fn buffer(handle: GfxBufferHandle, desired: SubresourceState) -> Self {
        Self {
            resource: handle.into(),
            range: SubresourceRange::WHOLE,
            desired,
        }
    }
}

/// 一次 transition 调用实际录制的内容
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BarrierSummary {
    pub image_barriers: usize,
    pub buffer_barriers: usize,
    /// 状态发生变化的子资源数量
    pub changed_subresources: usize,
}

impl BarrierSummary {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.image_barriers == 0 && self.buffer_barriers == 0
    }

    /// 录制的 pipeline barrier 命令数量，只可能是 0 或 1
    #[inline]
    pub fn barrier_commands(&self) -> usize {
        usize::from(!self.is_empty())
    }
}

pub struct BarrierBatcher {
    device: Arc<dyn GfxDevice>,
    state_table: Arc<ResourceStateTable>,
}

// new & init
impl BarrierBatcher {
    pub fn new(device: Arc<dyn GfxDevice>, state_table: Arc<ResourceStateTable>) -> Self {
        Self { device, state_table }
    }
}

// getters
impl BarrierBatcher {
    #[inline]
    pub fn state_table(&self) -> &Arc<ResourceStateTable> {
        &self.state_table
    }
}

// tools
impl BarrierBatcher {
    /// 单个资源的状态转换
    ///
    /// 与当前状态相同的子资源不会产生 barrier；两次相同的调用只会录制一次。
    pub fn request_transition(
        &self,
        cmd: &GfxCommandBuffer,
        resource: impl Into<GfxResourceHandle>,
        range: SubresourceRange,
        desired: SubresourceState,
    ) -> GfxResult<BarrierSummary> {
        self.batch_transition(
            cmd,
            &[TransitionRequest {
                resource: resource.into(),
                range,
                desired,
            }],
        )
    }

    /// 一批状态转换，所有需要的 barrier 合并为一条命令
    ///
    /// 参数在录制之前全部校验：任何一个请求不合法，都不会录制命令，也不会修改状态表。
    pub fn batch_transition(&self, cmd: &GfxCommandBuffer, requests: &[TransitionRequest]) -> GfxResult<BarrierSummary> {
        let _span = tracy_client::span!("BarrierBatcher::batch_transition");

        let pending = self.state_table.transition(requests)?;
        let summary = BarrierSummary {
            image_barriers: pending.image_barriers.len(),
            buffer_barriers: pending.buffer_barriers.len(),
            changed_subresources: pending.changed_subresources,
        };
        if pending.is_empty() {
            return Ok(summary);
        }

        cmd.pipeline_barrier(self.device.as_ref(), &pending.image_barriers, &pending.buffer_barriers);
        log::trace!(
            "cmd {:?}: {} requests -> {} image barriers, {} buffer barriers",
            cmd.vk_handle(),
            requests.len(),
            summary.image_barriers,
            summary.buffer_barriers
        );
        Ok(summary)
    }

    /// 资源在外部完成了转换（例如 swapchain acquire），只更新状态表
    #[inline]
    pub fn assume_state(&self, resource: impl Into<GfxResourceHandle>, state: SubresourceState) -> GfxResult<()> {
        self.state_table.set_state_all(resource, state)
    }
}
