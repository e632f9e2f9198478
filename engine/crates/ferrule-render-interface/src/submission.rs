//! 跨 queue 的提交顺序
//!
//! 一帧由若干 stage 组成（例如 shadow -> main -> present），每个 stage 属于一个 queue。
//! 相邻且属于同一个 queue 的 stage 合并成一次提交；只有跨 queue 时才插入一个从
//! [`FrameSemaphorePool`] 取出的 semaphore 交接。最后一次提交同时 signal present-ready
//! semaphore 和这一帧的 fence。
//!
//! 整条链需要的 semaphore 在第一次提交之前全部取出，fence 在最后一次提交前才 reset。
//! 因此在第一次提交之前失败的帧不会留下任何 GPU 侧的状态；已经提交了一部分之后失败
//! 会升级为 `DeviceLost`。

use std::sync::Arc;

use ash::vk;
use ferrule_gfx::{
    commands::{command_buffer::GfxCommandBuffer, fence::GfxFence, semaphore::GfxSemaphore, submit_info::GfxSubmitInfo},
    device::GfxDevice,
    error::{GfxError, GfxResult},
};
use itertools::Itertools;

use crate::{queue_registry::GfxQueue, semaphore_pool::FrameSemaphorePool};

pub struct SubmissionSequencer {
    device: Arc<dyn GfxDevice>,
    semaphore_pool: Arc<FrameSemaphorePool>,
}

// new & init
impl SubmissionSequencer {
    pub fn new(device: Arc<dyn GfxDevice>, semaphore_pool: Arc<FrameSemaphorePool>) -> Self {
        Self { device, semaphore_pool }
    }
}

// tools
impl SubmissionSequencer {
    /// 原始的提交操作
    ///
    /// `wait_stage` 是等待 `wait_semaphore` 的 pipeline stage；signal 总是在所有命令完成之后
    pub fn submit(
        &self,
        queue: &GfxQueue,
        command_buffers: &[GfxCommandBuffer],
        wait_stage: vk::PipelineStageFlags2,
        wait_semaphore: Option<&GfxSemaphore>,
        signal_semaphore: Option<&GfxSemaphore>,
        signal_fence: Option<&GfxFence>,
    ) -> GfxResult<()> {
        let _span = tracy_client::span!("SubmissionSequencer::submit");

        let mut submit_info = GfxSubmitInfo::new(command_buffers);
        if let Some(semaphore) = wait_semaphore {
            submit_info = submit_info.wait(semaphore, wait_stage);
        }
        if let Some(semaphore) = signal_semaphore {
            submit_info = submit_info.signal(semaphore, vk::PipelineStageFlags2::ALL_COMMANDS);
        }
        queue.submit(self.device.as_ref(), std::slice::from_ref(&submit_info), signal_fence)
    }

    /// 开始规划一帧的提交
    pub fn begin_frame(&self, frame_index: usize) -> FrameSubmission<'_> {
        FrameSubmission {
            sequencer: self,
            frame_index,
            region: None,
            external_wait: None,
            batches: vec![],
            stage_count: 0,
        }
    }
}

/// 同一个 queue 上连续的若干 stage，对应一次提交
struct PlannedBatch<'a> {
    queue: &'a GfxQueue,
    command_buffers: Vec<GfxCommandBuffer>,
    /// 等待上一个 queue 的 semaphore 时使用的 stage，取第一个 stage 的值
    wait_stage: vk::PipelineStageFlags2,
    stage_names: Vec<String>,
}

/// [`FrameSubmission::submit`] 的结果
#[derive(Clone, Copy, Debug)]
pub struct SubmittedFrame {
    /// 交给 present 等待
    pub present_ready: GfxSemaphore,
    /// 实际的 queue 提交次数
    pub submit_count: usize,
}

/// 一帧内的提交计划
///
/// 由 [`SubmissionSequencer::begin_frame`] 创建，[`FrameSubmission::submit`] 消耗。
pub struct FrameSubmission<'a> {
    sequencer: &'a SubmissionSequencer,
    frame_index: usize,

    /// queue debug region 的前缀，例如 `[F12A]`
    region: Option<String>,
    /// 外部 semaphore（例如 swapchain acquire），由第一次提交等待
    external_wait: Option<(GfxSemaphore, vk::PipelineStageFlags2)>,

    batches: Vec<PlannedBatch<'a>>,
    stage_count: usize,
}

// getters
impl FrameSubmission<'_> {
    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    #[inline]
    pub fn stage_count(&self) -> usize {
        self.stage_count
    }

    /// 合并之后的提交次数
    #[inline]
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

// tools
impl<'a> FrameSubmission<'a> {
    pub fn wait_external(&mut self, semaphore: GfxSemaphore, wait_stage: vk::PipelineStageFlags2) -> &mut Self {
        self.external_wait = Some((semaphore, wait_stage));
        self
    }

    /// 每次提交都包在名为 `{region}{stage 名}` 的 queue debug region 中
    pub fn region(&mut self, region: impl Into<String>) -> &mut Self {
        self.region = Some(region.into());
        self
    }

    /// 追加一个 stage，只记录，不提交
    ///
    /// 与上一个 stage 在同一个 queue 上时并入同一次提交，此时 `wait_stage` 不再使用：
    /// 同一个 queue 内的顺序由 pass 录制的 barrier 保证
    pub fn push_stage(
        &mut self,
        queue: &'a GfxQueue,
        name: &str,
        command_buffers: &[GfxCommandBuffer],
        wait_stage: vk::PipelineStageFlags2,
    ) -> &mut Self {
        self.stage_count += 1;
        match self.batches.last_mut() {
            Some(batch) if batch.queue.handle() == queue.handle() => {
                batch.command_buffers.extend_from_slice(command_buffers);
                batch.stage_names.push(name.to_string());
            }
            _ => self.batches.push(PlannedBatch {
                queue,
                command_buffers: command_buffers.to_vec(),
                wait_stage,
                stage_names: vec![name.to_string()],
            }),
        }
        self
    }

    /// 按计划提交整条链，最后一次提交 signal present-ready semaphore 以及 `frame_fence`
    ///
    /// 第一次提交之前的错误（例如 semaphore 耗尽）原样返回，fence 保持原状态；
    /// 已经有提交成功之后的错误都是致命的。
    pub fn submit(self, frame_fence: &GfxFence) -> GfxResult<SubmittedFrame> {
        let _span = tracy_client::span!("FrameSubmission::submit");

        let Self {
            sequencer,
            frame_index,
            region,
            mut external_wait,
            batches,
            stage_count,
        } = self;
        if batches.is_empty() {
            return Err(GfxError::invalid_argument("frame submission has no stages"));
        }
        let device = sequencer.device.as_ref();
        let pool = &sequencer.semaphore_pool;

        // 每个 queue 边界一个，最后一个作为 present-ready。
        // 失败时已经取出的 semaphore 没有被 signal 过，留在 in-use 中等下次 reclaim
        let signals = (0..batches.len()).map(|_| pool.acquire(frame_index)).collect::<GfxResult<Vec<_>>>()?;

        let submit_infos = batches
            .iter()
            .enumerate()
            .map(|(i, batch)| {
                let mut info = GfxSubmitInfo::new(&batch.command_buffers);
                if i == 0 {
                    if let Some((external, external_stage)) = external_wait.take() {
                        info = info.wait(&external, external_stage);
                    }
                } else {
                    info = info.wait(&signals[i - 1], batch.wait_stage);
                }
                info.signal(&signals[i], vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect_vec();

        let last = batches.len() - 1;
        for (i, (batch, info)) in batches.iter().zip(&submit_infos).enumerate() {
            let fence = if i == last {
                if let Err(e) = frame_fence.reset(device) {
                    return Err(broken_chain(frame_index, i, e));
                }
                Some(frame_fence)
            } else {
                None
            };

            let result = match &region {
                Some(region) => {
                    let label = format!("{region}{}", batch.stage_names.join("+"));
                    batch.queue.submit_in_region(device, &label, std::slice::from_ref(info), fence)
                }
                None => batch.queue.submit(device, std::slice::from_ref(info), fence),
            };
            if let Err(e) = result {
                // 第一次提交失败且 fence 没有被 reset 时，什么都没有发生
                return Err(if i == 0 && fence.is_none() { e } else { broken_chain(frame_index, i, e) });
            }
        }

        log::debug!("frame slot {frame_index}: {stage_count} stages in {} submits", batches.len());
        Ok(SubmittedFrame {
            present_ready: signals[last],
            submit_count: batches.len(),
        })
    }
}

/// 链提交了一部分（或 fence 已经 reset）之后的失败无法回退
fn broken_chain(frame_index: usize, submitted: usize, e: GfxError) -> GfxError {
    if e.is_fatal() {
        return e;
    }
    log::error!("frame slot {frame_index}: submit chain broken after {submitted} submits: {e}");
    GfxError::device_lost(format!(
        "frame slot {frame_index} submit chain broken after {submitted} submits: {e}"
    ))
}

#[cfg(test)]
mod tests {
    use ferrule_gfx::headless::{HeadlessDevice, HeadlessDeviceDesc, HeadlessEvent, HeadlessFenceMode};

    use super::*;
    use crate::queue_registry::{QueueCapabilities, QueueRegistry, QueueRegistryBuilder, QueueRole};

    struct Fixture {
        device: Arc<HeadlessDevice>,
        pool: Arc<FrameSemaphorePool>,
        sequencer: SubmissionSequencer,
        registry: QueueRegistry,
    }

    fn fixture_with(desc: HeadlessDeviceDesc) -> Fixture {
        let device = Arc::new(HeadlessDevice::new(desc));
        let pool = Arc::new(FrameSemaphorePool::new(device.clone(), 2));
        let sequencer = SubmissionSequencer::new(device.clone(), pool.clone());

        let mut builder = QueueRegistryBuilder::new(device.as_ref());
        builder.resolve(QueueRole::Graphics, QueueCapabilities::GRAPHICS, 1, &[]);
        builder.resolve(QueueRole::Transfer, QueueCapabilities::TRANSFER, 1, &[]);
        let registry = builder.build();

        Fixture {
            device,
            pool,
            sequencer,
            registry,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(HeadlessDeviceDesc {
            fence_mode: HeadlessFenceMode::Manual,
            ..Default::default()
        })
    }

    type SubmitRecord = (vk::Queue, Vec<vk::CommandBuffer>, Vec<vk::Semaphore>, Vec<vk::Semaphore>, vk::Fence);

    fn submits(device: &HeadlessDevice) -> Vec<SubmitRecord> {
        device
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HeadlessEvent::Submit {
                    queue,
                    command_buffers,
                    wait_semaphores,
                    signal_semaphores,
                    fence,
                } => Some((queue, command_buffers, wait_semaphores, signal_semaphores, fence)),
                _ => None,
            })
            .collect()
    }

    fn cmd(raw: u64) -> GfxCommandBuffer {
        use ash::vk::Handle;
        GfxCommandBuffer::from_raw(vk::CommandBuffer::from_raw(raw), 0)
    }

    #[test]
    fn test_queue_change_threads_semaphore() {
        let f = fixture();
        let graphics = f.registry.queue(QueueRole::Graphics).unwrap();
        let transfer = f.registry.queue(QueueRole::Transfer).unwrap();
        let fence = GfxFence::new(f.device.as_ref(), true, "frame-fence").unwrap();

        let mut frame = f.sequencer.begin_frame(1);
        frame
            .push_stage(transfer, "upload", &[cmd(10)], vk::PipelineStageFlags2::NONE)
            .push_stage(graphics, "shadow", &[cmd(11)], vk::PipelineStageFlags2::VERTEX_SHADER)
            .push_stage(graphics, "main", &[cmd(12)], vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert_eq!((frame.stage_count(), frame.batch_count()), (3, 2));
        let submitted = frame.submit(&fence).unwrap();

        let submits = submits(&f.device);
        assert_eq!(submitted.submit_count, 2);
        assert_eq!(submits.len(), 2);

        assert_eq!(submits[0].0, transfer.handle());
        assert!(submits[0].2.is_empty());
        assert_eq!(submits[0].4, vk::Fence::null());
        let handoff = submits[0].3.clone();
        assert_eq!(handoff.len(), 1);

        assert_eq!(submits[1].0, graphics.handle());
        assert_eq!(submits[1].1, vec![cmd(11).vk_handle(), cmd(12).vk_handle()]);
        assert_eq!(submits[1].2, handoff);
        assert_eq!(submits[1].3, vec![submitted.present_ready.handle()]);
        assert_eq!(submits[1].4, fence.handle());

        assert_eq!(f.pool.in_use_count(1), 2);
        assert_eq!(f.pool.in_use_count(0), 0);
        assert_eq!(f.device.pending_fence_count(), 1);
    }

    #[test]
    fn test_same_queue_stages_share_one_submit() {
        let f = fixture();
        let graphics = f.registry.queue(QueueRole::Graphics).unwrap();
        let transfer = f.registry.queue(QueueRole::Transfer).unwrap();
        let fence = GfxFence::new(f.device.as_ref(), true, "frame-fence").unwrap();

        let mut frame = f.sequencer.begin_frame(0);
        frame
            .push_stage(graphics, "shadow", &[cmd(1)], vk::PipelineStageFlags2::NONE)
            .push_stage(graphics, "main", &[cmd(2)], vk::PipelineStageFlags2::FRAGMENT_SHADER)
            .push_stage(transfer, "readback", &[cmd(3)], vk::PipelineStageFlags2::TRANSFER);
        let submitted = frame.submit(&fence).unwrap();

        assert_eq!(submitted.submit_count, 2);
        assert_eq!(submits(&f.device).len(), 2);
        assert_eq!(f.pool.in_use_count(0), 2);
        assert_eq!(f.device.live_semaphore_count(), 2);
    }

    #[test]
    fn test_fence_reset_right_before_final_submit() {
        let f = fixture();
        let graphics = f.registry.queue(QueueRole::Graphics).unwrap();
        let transfer = f.registry.queue(QueueRole::Transfer).unwrap();
        let fence = GfxFence::new(f.device.as_ref(), true, "frame-fence").unwrap();

        let mut frame = f.sequencer.begin_frame(0);
        frame
            .push_stage(transfer, "upload", &[cmd(1)], vk::PipelineStageFlags2::NONE)
            .push_stage(graphics, "main", &[cmd(2)], vk::PipelineStageFlags2::VERTEX_INPUT);
        frame.submit(&fence).unwrap();

        let events = f.device.events();
        let submit_positions =
            events.iter().positions(|e| matches!(e, HeadlessEvent::Submit { .. })).collect_vec();
        let reset = events
            .iter()
            .position(|e| *e == HeadlessEvent::FenceReset { fence: fence.handle() })
            .unwrap();
        assert_eq!(submit_positions.len(), 2);
        assert!(submit_positions[0] < reset && reset < submit_positions[1]);
    }

    #[test]
    fn test_external_wait_goes_to_first_submit_only() {
        let f = fixture();
        let graphics = f.registry.queue(QueueRole::Graphics).unwrap();
        let transfer = f.registry.queue(QueueRole::Transfer).unwrap();
        let fence = GfxFence::new(f.device.as_ref(), true, "frame-fence").unwrap();
        let acquire = GfxSemaphore::new(f.device.as_ref(), "swapchain-acquire").unwrap();

        let mut frame = f.sequencer.begin_frame(0);
        frame
            .wait_external(acquire, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .push_stage(graphics, "main", &[cmd(20)], vk::PipelineStageFlags2::NONE)
            .push_stage(transfer, "readback", &[cmd(21)], vk::PipelineStageFlags2::TRANSFER);
        frame.submit(&fence).unwrap();

        let submits = submits(&f.device);
        assert_eq!(submits[0].2, vec![acquire.handle()]);
        assert_eq!(submits[1].2, submits[0].3);
    }

    #[test]
    fn test_single_stage_frame() {
        let f = fixture();
        let graphics = f.registry.queue(QueueRole::Graphics).unwrap();
        let fence = GfxFence::new(f.device.as_ref(), true, "frame-fence").unwrap();

        let mut frame = f.sequencer.begin_frame(0);
        frame.push_stage(graphics, "main", &[cmd(30)], vk::PipelineStageFlags2::NONE);
        let submitted = frame.submit(&fence).unwrap();

        let submits = submits(&f.device);
        assert_eq!(submits.len(), 1);
        assert!(submits[0].2.is_empty());
        assert_eq!(submits[0].3, vec![submitted.present_ready.handle()]);
        assert_eq!(f.pool.in_use_count(0), 1);
    }

    #[test]
    fn test_region_labels_each_submit() {
        let f = fixture();
        let graphics = f.registry.queue(QueueRole::Graphics).unwrap();
        let fence = GfxFence::new(f.device.as_ref(), true, "frame-fence").unwrap();

        let mut frame = f.sequencer.begin_frame(0);
        frame
            .region("[F0A]")
            .push_stage(graphics, "shadow", &[cmd(1)], vk::PipelineStageFlags2::NONE)
            .push_stage(graphics, "main", &[cmd(2)], vk::PipelineStageFlags2::NONE);
        frame.submit(&fence).unwrap();

        let labels = f
            .device
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HeadlessEvent::QueueBeginLabel { label, .. } => Some(label),
                _ => None,
            })
            .collect_vec();
        assert_eq!(labels, vec!["[F0A]shadow+main".to_string()]);
    }

    #[test]
    fn test_semaphore_exhaustion_leaves_fence_untouched() {
        let f = fixture_with(HeadlessDeviceDesc {
            fence_mode: HeadlessFenceMode::Manual,
            max_semaphores: Some(1),
            ..Default::default()
        });
        let graphics = f.registry.queue(QueueRole::Graphics).unwrap();
        let transfer = f.registry.queue(QueueRole::Transfer).unwrap();
        let fence = GfxFence::new(f.device.as_ref(), true, "frame-fence").unwrap();

        let mut frame = f.sequencer.begin_frame(0);
        frame
            .push_stage(transfer, "upload", &[cmd(1)], vk::PipelineStageFlags2::NONE)
            .push_stage(graphics, "main", &[cmd(2)], vk::PipelineStageFlags2::VERTEX_INPUT);
        let err = frame.submit(&fence).unwrap_err();

        assert!(matches!(err, GfxError::ResourceExhausted(_)));
        assert!(submits(&f.device).is_empty());
        assert!(f.device.is_fence_signaled(fence.handle()));
        assert!(
            !f.device
                .events()
                .iter()
                .any(|e| matches!(e, HeadlessEvent::FenceReset { .. }))
        );
        // 取出但没有 signal 过的 semaphore 可以正常回收
        f.pool.reclaim(0).unwrap();
        assert_eq!(f.pool.available_count(0), 1);
    }

    #[test]
    fn test_failure_after_partial_chain_is_fatal() {
        let f = fixture();
        let graphics = f.registry.queue(QueueRole::Graphics).unwrap();
        let transfer = f.registry.queue(QueueRole::Transfer).unwrap();
        let fence = GfxFence::new(f.device.as_ref(), true, "frame-fence").unwrap();
        f.device.fail_submit_after(1);

        let mut frame = f.sequencer.begin_frame(0);
        frame
            .push_stage(transfer, "upload", &[cmd(1)], vk::PipelineStageFlags2::NONE)
            .push_stage(graphics, "main", &[cmd(2)], vk::PipelineStageFlags2::VERTEX_INPUT);
        let err = frame.submit(&fence).unwrap_err();

        assert!(matches!(err, GfxError::DeviceLost(_)));
        assert_eq!(submits(&f.device).len(), 1);
    }

    #[test]
    fn test_failure_of_first_submit_is_recoverable() {
        let f = fixture();
        let graphics = f.registry.queue(QueueRole::Graphics).unwrap();
        let transfer = f.registry.queue(QueueRole::Transfer).unwrap();
        let fence = GfxFence::new(f.device.as_ref(), true, "frame-fence").unwrap();
        f.device.fail_submit_after(0);

        let mut frame = f.sequencer.begin_frame(0);
        frame
            .push_stage(transfer, "upload", &[cmd(1)], vk::PipelineStageFlags2::NONE)
            .push_stage(graphics, "main", &[cmd(2)], vk::PipelineStageFlags2::VERTEX_INPUT);
        let err = frame.submit(&fence).unwrap_err();

        assert!(!err.is_fatal());
        assert!(f.device.is_fence_signaled(fence.handle()));
    }

    #[test]
    fn test_raw_submit() {
        let f = fixture();
        let graphics = f.registry.queue(QueueRole::Graphics).unwrap();
        let wait = f.pool.acquire(0).unwrap();
        let signal = f.pool.acquire(0).unwrap();

        f.sequencer
            .submit(graphics, &[cmd(40)], vk::PipelineStageFlags2::TRANSFER, Some(&wait), Some(&signal), None)
            .unwrap();

        let submits = submits(&f.device);
        assert_eq!(
            submits,
            vec![(graphics.handle(), vec![cmd(40).vk_handle()], vec![wait.handle()], vec![signal.handle()], vk::Fence::null())]
        );
    }

    #[test]
    fn test_bad_frame_index_submits_nothing() {
        let f = fixture();
        let graphics = f.registry.queue(QueueRole::Graphics).unwrap();
        let fence = GfxFence::new(f.device.as_ref(), true, "frame-fence").unwrap();

        let mut frame = f.sequencer.begin_frame(5);
        frame.push_stage(graphics, "main", &[cmd(50)], vk::PipelineStageFlags2::NONE);
        assert!(matches!(frame.submit(&fence), Err(GfxError::InvalidArgument(_))));
        assert!(submits(&f.device).is_empty());
    }

    #[test]
    fn test_empty_plan_is_rejected() {
        let f = fixture();
        let fence = GfxFence::new(f.device.as_ref(), true, "frame-fence").unwrap();
        assert!(matches!(f.sequencer.begin_frame(0).submit(&fence), Err(GfxError::InvalidArgument(_))));
    }
}
