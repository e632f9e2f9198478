//! Pass 与 stage
//!
//! 一个 stage 由若干 pass 顺序录制到同一个 command buffer；同一 queue 上相邻的 stage 合并为一次提交。
//! pass 在绘制前通过 [`PassContext`] 声明自己需要的资源状态。

use ash::vk;
use ferrule_gfx::{
    basic::color::LabelColor, commands::command_buffer::GfxCommandBuffer, descriptors::GfxDescriptorBinding,
    device::GfxDevice, error::GfxResult,
};
use ferrule_render_interface::{
    barrier::{BarrierSummary, TransitionRequest},
    handles::GfxResourceHandle,
    queue_registry::QueueRole,
    render_context::RenderContext,
    resource_state::{SubresourceRange, SubresourceState},
};

/// pass 录制时可以访问的内容
pub struct PassContext<'a> {
    pub render_context: &'a RenderContext,
    pub cmd: GfxCommandBuffer,
    pub frame_index: usize,
    pub frame_id: u64,
}

impl PassContext<'_> {
    #[inline]
    pub fn device(&self) -> &dyn GfxDevice {
        self.render_context.device().as_ref()
    }

    /// 把资源转换到 `desired`，状态相同时不录制任何命令
    #[inline]
    pub fn transition(
        &self,
        resource: impl Into<GfxResourceHandle>,
        range: SubresourceRange,
        desired: SubresourceState,
    ) -> GfxResult<BarrierSummary> {
        self.render_context.request_transition(&self.cmd, resource, range, desired)
    }

    #[inline]
    pub fn batch_transition(&self, requests: &[TransitionRequest]) -> GfxResult<BarrierSummary> {
        self.render_context.batch_transition(&self.cmd, requests)
    }

    #[inline]
    pub fn descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
        bindings: &[GfxDescriptorBinding],
    ) -> GfxResult<vk::DescriptorSet> {
        self.render_context.get_or_create_descriptor_set(layout, bindings)
    }

    /// 在 command buffer 中插入一个 debug label，用于标记 draw / dispatch
    #[inline]
    pub fn insert_label(&self, label: &str) {
        self.cmd.insert_label(self.device(), label, LabelColor::COLOR_CMD);
    }
}

pub trait RenderPass {
    fn name(&self) -> &str;

    /// command buffer 已经开始录制，直接录制命令即可
    fn record(&mut self, ctx: &PassContext<'_>) -> GfxResult<()>;
}

/// 一个 command buffer，提交到 `role` 对应的 queue
pub struct RenderStage {
    pub(crate) name: String,
    pub(crate) role: QueueRole,
    /// 跨 queue 时等待上一次提交的位置，与上一个 stage 同 queue 时不使用
    pub(crate) wait_stage: vk::PipelineStageFlags2,
    pub(crate) passes: Vec<Box<dyn RenderPass>>,
}

// new & init
impl RenderStage {
    pub fn new(name: impl Into<String>, role: QueueRole, wait_stage: vk::PipelineStageFlags2) -> Self {
        Self {
            name: name.into(),
            role,
            wait_stage,
            passes: vec![],
        }
    }

    /// builder
    pub fn with_pass(mut self, pass: impl RenderPass + 'static) -> Self {
        self.passes.push(Box::new(pass));
        self
    }
}

// getters
impl RenderStage {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn role(&self) -> QueueRole {
        self.role
    }

    #[inline]
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }
}
