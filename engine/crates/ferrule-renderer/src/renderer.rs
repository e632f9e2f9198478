//! 帧循环
//!
//! 每一帧的顺序：
//! 1. update 任务在 worker 线程池上运行（enqueue 拷贝、准备 descriptor），全部完成后继续
//! 2. 等待复用 slot 的 fence，这是编排线程每帧唯一的阻塞点
//! 3. 回收该 slot 的 semaphore
//! 4. drain 拷贝队列
//! 5. reset 该 slot 的 command pool，按 stage 录制
//! 6. 链式提交：同一 queue 上相邻的 stage 合并为一次提交，最后一次提交 signal
//!    present-ready semaphore 与 fence
//!
//! 录制与提交期间的状态表修改记在 journal 中，帧在提交前失败时回滚，
//! 下一帧看到的仍是上一次成功提交之后的状态。

use std::sync::Arc;

use ash::vk;
use crossbeam_utils::sync::WaitGroup;
use ferrule_gfx::{
    basic::color::LabelColor,
    commands::{command_buffer::GfxCommandBuffer, semaphore::GfxSemaphore},
    descriptors::GfxDescriptorBinding,
    error::{GfxError, GfxResult},
};
use ferrule_render_interface::{
    copy_queue::{DeferredCopyQueue, DrainStats, MemoryRange},
    descriptor_cache::DescriptorSetCache,
    handles::GfxBufferHandle,
    queue_registry::QueueRole,
    render_context::RenderContext,
    submission::SubmittedFrame,
};
use itertools::Itertools;

use crate::pass::{PassContext, RenderStage};

/// update 任务可以访问的内容，只包含线程安全的部分
pub struct FrameUpdateContext {
    copy_queue: Arc<DeferredCopyQueue>,
    descriptor_cache: Arc<DescriptorSetCache>,
    frame_index: usize,
    frame_id: u64,
}

impl FrameUpdateContext {
    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[inline]
    pub fn enqueue_copy(&self, target: GfxBufferHandle, ranges: Vec<MemoryRange>) -> GfxResult<()> {
        self.copy_queue.enqueue(target, ranges)
    }

    #[inline]
    pub fn descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
        bindings: &[GfxDescriptorBinding],
    ) -> GfxResult<vk::DescriptorSet> {
        self.descriptor_cache.get_or_create(layout, bindings)
    }
}

pub type UpdateTask = Box<dyn FnOnce(&FrameUpdateContext) -> GfxResult<()> + Send>;

/// 一帧的结果
#[derive(Clone, Copy, Debug)]
pub struct FrameOutput {
    pub frame_id: u64,
    pub frame_index: usize,
    /// 交给 present 等待
    pub present_ready: GfxSemaphore,
    pub drain: DrainStats,
    pub stage_count: usize,
    /// 合并之后实际的 queue 提交次数
    pub submit_count: usize,
}

struct RecordedStage {
    name: String,
    role: QueueRole,
    cmd: GfxCommandBuffer,
    wait_stage: vk::PipelineStageFlags2,
}

pub struct Renderer {
    context: RenderContext,
    stages: Vec<RenderStage>,
}

// new & init
impl Renderer {
    pub fn new(context: RenderContext) -> Self {
        Self { context, stages: vec![] }
    }

    /// stage 按添加顺序提交
    pub fn add_stage(&mut self, stage: RenderStage) {
        self.stages.push(stage);
    }
}

// getters
impl Renderer {
    #[inline]
    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    #[inline]
    pub fn context_mut(&mut self) -> &mut RenderContext {
        &mut self.context
    }

    #[inline]
    pub fn stages(&self) -> &[RenderStage] {
        &self.stages
    }
}

// phase call
impl Renderer {
    /// 执行一帧
    ///
    /// 出错时帧序号不前进。`DeviceLost` 之后不应再调用
    pub fn render_frame(
        &mut self,
        update_tasks: Vec<UpdateTask>,
        external_wait: Option<(GfxSemaphore, vk::PipelineStageFlags2)>,
    ) -> GfxResult<FrameOutput> {
        let _span = tracy_client::span!("Renderer::render_frame");

        let result = self.render_frame_inner(update_tasks, external_wait);
        if let Err(e) = &result
            && e.is_fatal()
        {
            log::error!("{} fatal: {e}", self.context.frame_counter().frame_name());
        }
        result
    }

    fn render_frame_inner(
        &mut self,
        update_tasks: Vec<UpdateTask>,
        external_wait: Option<(GfxSemaphore, vk::PipelineStageFlags2)>,
    ) -> GfxResult<FrameOutput> {
        if self.stages.is_empty() {
            return Err(GfxError::invalid_argument("renderer has no stages"));
        }
        let frame_index = self.context.frame_counter().frame_index();
        let frame_id = self.context.frame_counter().frame_id();

        self.run_update_tasks(update_tasks, frame_index, frame_id)?;

        {
            let _span = tracy_client::span!("wait frame slot");
            self.context.wait_frame_slot(frame_index)?;
        }
        self.context.reclaim_semaphores(frame_index)?;
        let drain = self.context.drain_copies()?;
        self.context.reset_frame_slot(frame_index)?;

        let state_table = self.context.state_table().clone();
        state_table.begin_journal();
        let (stage_count, submitted) = match self.record_and_submit(frame_index, frame_id, external_wait) {
            Ok(done) => {
                state_table.commit_journal();
                done
            }
            Err(e) => {
                let restored = state_table.rollback_journal();
                log::warn!(
                    "{} aborted, {restored} subresource states rolled back: {e}",
                    self.context.frame_counter().frame_name()
                );
                return Err(e);
            }
        };

        log::debug!(
            "{} done: {} stages in {} submits, {} copy bytes",
            self.context.frame_counter().frame_name(),
            stage_count,
            submitted.submit_count,
            drain.bytes
        );
        tracy_client::frame_mark();
        self.context.next_frame();

        Ok(FrameOutput {
            frame_id,
            frame_index,
            present_ready: submitted.present_ready,
            drain,
            stage_count,
            submit_count: submitted.submit_count,
        })
    }

    fn record_and_submit(
        &mut self,
        frame_index: usize,
        frame_id: u64,
        external_wait: Option<(GfxSemaphore, vk::PipelineStageFlags2)>,
    ) -> GfxResult<(usize, SubmittedFrame)> {
        let recorded = self.record_stages(frame_index, frame_id)?;
        let submitted = self.submit_stages(frame_index, &recorded, external_wait)?;
        Ok((recorded.len(), submitted))
    }

    /// 所有任务都结束之后才返回，返回第一个错误
    fn run_update_tasks(&self, update_tasks: Vec<UpdateTask>, frame_index: usize, frame_id: u64) -> GfxResult<()> {
        if update_tasks.is_empty() {
            return Ok(());
        }
        let _span = tracy_client::span!("Renderer::update");

        let update_context = Arc::new(FrameUpdateContext {
            copy_queue: self.context.copy_queue().clone(),
            descriptor_cache: self.context.descriptor_cache().clone(),
            frame_index,
            frame_id,
        });
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<GfxResult<()>>();
        let wait_group = WaitGroup::new();

        for task in update_tasks {
            let update_context = update_context.clone();
            let result_tx = result_tx.clone();
            let wg_task = wait_group.clone();
            self.context.worker_pool().spawn(move || {
                let _ = result_tx.send(task(update_context.as_ref()));
                drop(wg_task);
            });
        }
        drop(result_tx);
        wait_group.wait();

        let errors = result_rx.try_iter().filter_map(Result::err).collect_vec();
        for e in &errors {
            log::warn!("update task failed: {e}");
        }
        errors.into_iter().next().map_or(Ok(()), Err)
    }

    fn record_stages(&mut self, frame_index: usize, frame_id: u64) -> GfxResult<Vec<RecordedStage>> {
        let _span = tracy_client::span!("Renderer::record");

        let Self { context, stages } = self;
        let frame_name = context.frame_counter().frame_name();
        let device = context.device().clone();

        let mut recorded = Vec::with_capacity(stages.len());
        for stage in stages.iter_mut() {
            let cmd = context.allocate_command_buffer(stage.role, &stage.name)?;
            cmd.begin(device.as_ref(), vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, &format!("{frame_name}{}", stage.name))?;

            let pass_context = PassContext {
                render_context: context,
                cmd,
                frame_index,
                frame_id,
            };
            for pass in stage.passes.iter_mut() {
                cmd.begin_label(device.as_ref(), pass.name(), LabelColor::COLOR_PASS);
                pass.record(&pass_context)?;
                cmd.end_label(device.as_ref());
            }

            cmd.end(device.as_ref())?;
            recorded.push(RecordedStage {
                name: stage.name.clone(),
                role: stage.role,
                cmd,
                wait_stage: stage.wait_stage,
            });
        }
        Ok(recorded)
    }

    fn submit_stages(
        &self,
        frame_index: usize,
        recorded: &[RecordedStage],
        external_wait: Option<(GfxSemaphore, vk::PipelineStageFlags2)>,
    ) -> GfxResult<SubmittedFrame> {
        let _span = tracy_client::span!("Renderer::submit");

        let mut submission = self.context.sequencer().begin_frame(frame_index);
        submission.region(self.context.frame_counter().frame_name());
        if let Some((semaphore, wait_stage)) = external_wait {
            submission.wait_external(semaphore, wait_stage);
        }
        for stage in recorded {
            submission.push_stage(
                self.context.queue(stage.role)?,
                &stage.name,
                std::slice::from_ref(&stage.cmd),
                stage.wait_stage,
            );
        }

        // fence 在最后一次提交之前才会 reset
        submission.submit(self.context.frame_slot(frame_index)?.fence())
    }
}

// destroy
impl Renderer {
    pub fn shutdown(self) -> GfxResult<()> {
        self.context.shutdown()
    }
}
