//! 渲染核心的显式上下文
//!
//! 由 [`RenderContext::init`] 创建、[`RenderContext::shutdown`] 销毁，以引用的方式传递。
//! 持有状态表、queue 映射、semaphore 池、拷贝队列、descriptor 缓存、worker 线程池
//! 以及所有 frame slot。

use std::sync::Arc;

use ash::vk;
use ferrule_gfx::{
    commands::{command_buffer::GfxCommandBuffer, semaphore::GfxSemaphore},
    descriptors::GfxDescriptorBinding,
    device::GfxDevice,
    error::{GfxError, GfxResult},
};

use crate::{
    barrier::{BarrierBatcher, BarrierSummary, TransitionRequest},
    config::RenderCoreConfig,
    copy_queue::{DeferredCopyQueue, DrainStats, MemoryRange},
    descriptor_cache::DescriptorSetCache,
    frame_counter::FrameCounter,
    frame_slot::FrameSlot,
    handles::{GfxBufferHandle, GfxResourceHandle},
    queue_registry::{GfxQueue, QueueCapabilities, QueueRegistry, QueueRegistryBuilder, QueueRole},
    resource_state::{SubresourceRange, SubresourceState},
    semaphore_pool::FrameSemaphorePool,
    state_table::ResourceStateTable,
    submission::SubmissionSequencer,
};

pub struct RenderContext {
    config: RenderCoreConfig,
    device: Arc<dyn GfxDevice>,
    queues: QueueRegistry,

    state_table: Arc<ResourceStateTable>,
    barrier_batcher: BarrierBatcher,
    semaphore_pool: Arc<FrameSemaphorePool>,
    sequencer: SubmissionSequencer,
    copy_queue: Arc<DeferredCopyQueue>,
    descriptor_cache: Arc<DescriptorSetCache>,

    worker_pool: rayon::ThreadPool,

    frame_slots: Vec<FrameSlot>,
    frame_counter: FrameCounter,
}

// new & init
impl RenderContext {
    /// 按标准角色解析 queue：
    /// - graphics：必须存在
    /// - present：优先与 graphics 共用
    /// - transfer：优先独立的 transfer queue，否则与 graphics 共用
    /// - compute：优先独立的 compute queue，否则与 graphics 共用
    pub fn init(device: Arc<dyn GfxDevice>, config: RenderCoreConfig) -> GfxResult<Self> {
        let queues = {
            let mut builder = QueueRegistryBuilder::new(device.as_ref());
            builder
                .resolve(QueueRole::Graphics, QueueCapabilities::GRAPHICS, 1, &[])
                .ok_or_else(|| GfxError::invalid_argument("device exposes no graphics queue"))?;
            if builder.resolve(QueueRole::Present, QueueCapabilities::PRESENT, 1, &[QueueRole::Graphics]).is_none() {
                log::warn!("no present capable queue, running without presentation");
            }
            builder.resolve(QueueRole::Transfer, QueueCapabilities::TRANSFER, 1, &[QueueRole::Graphics]);
            builder.resolve(
                QueueRole::Compute,
                QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
                1,
                &[QueueRole::Graphics],
            );
            builder.build()
        };

        Self::init_with_queues(device, config, queues)
    }

    /// 使用外部解析好的 queue 映射，例如带有自定义角色的映射
    pub fn init_with_queues(
        device: Arc<dyn GfxDevice>,
        config: RenderCoreConfig,
        queues: QueueRegistry,
    ) -> GfxResult<Self> {
        tracy_client::Client::start();
        let _span = tracy_client::span!("RenderContext::init");

        config.validate()?;
        if queues.queue(QueueRole::Graphics).is_none() {
            return Err(GfxError::invalid_argument("queue registry has no graphics role"));
        }

        let state_table = Arc::new(ResourceStateTable::new());
        let barrier_batcher = BarrierBatcher::new(device.clone(), state_table.clone());
        let semaphore_pool = Arc::new(FrameSemaphorePool::new(device.clone(), config.frames_in_flight));
        let sequencer = SubmissionSequencer::new(device.clone(), semaphore_pool.clone());
        let copy_queue = Arc::new(DeferredCopyQueue::new(state_table.clone()));
        let descriptor_cache = Arc::new(DescriptorSetCache::new(
            device.clone(),
            config.max_descriptor_sets,
            &config.descriptor_pool_sizes(),
        )?);

        let worker_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|index| format!("Ferrule-Worker-{}", index))
            .build()
            .map_err(|e| GfxError::resource_exhausted(format!("failed to create worker pool: {e}")))?;

        let families = queues.queue_family_indices();
        let frame_slots = (0..config.frames_in_flight)
            .map(|index| FrameSlot::new(device.as_ref(), index, &families))
            .collect::<GfxResult<Vec<_>>>()?;

        log::info!(
            "render context initialized on {} backend: {} frames in flight, {} workers, queue families {:?}",
            device.backend_name(),
            config.frames_in_flight,
            config.worker_threads,
            families
        );

        Ok(Self {
            frame_counter: FrameCounter::new(0, config.frames_in_flight),
            config,
            device,
            queues,
            state_table,
            barrier_batcher,
            semaphore_pool,
            sequencer,
            copy_queue,
            descriptor_cache,
            worker_pool,
            frame_slots,
        })
    }
}

// getters
impl RenderContext {
    #[inline]
    pub fn config(&self) -> &RenderCoreConfig {
        &self.config
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn GfxDevice> {
        &self.device
    }

    #[inline]
    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    pub fn queue(&self, role: QueueRole) -> GfxResult<&Arc<GfxQueue>> {
        self.queues
            .queue(role)
            .ok_or_else(|| GfxError::invalid_argument(format!("no queue resolved for role {role}")))
    }

    #[inline]
    pub fn state_table(&self) -> &Arc<ResourceStateTable> {
        &self.state_table
    }

    #[inline]
    pub fn barrier_batcher(&self) -> &BarrierBatcher {
        &self.barrier_batcher
    }

    #[inline]
    pub fn semaphore_pool(&self) -> &Arc<FrameSemaphorePool> {
        &self.semaphore_pool
    }

    #[inline]
    pub fn sequencer(&self) -> &SubmissionSequencer {
        &self.sequencer
    }

    #[inline]
    pub fn copy_queue(&self) -> &Arc<DeferredCopyQueue> {
        &self.copy_queue
    }

    #[inline]
    pub fn descriptor_cache(&self) -> &Arc<DescriptorSetCache> {
        &self.descriptor_cache
    }

    #[inline]
    pub fn worker_pool(&self) -> &rayon::ThreadPool {
        &self.worker_pool
    }

    #[inline]
    pub fn frame_counter(&self) -> &FrameCounter {
        &self.frame_counter
    }

    pub fn frame_slot(&self, frame_index: usize) -> GfxResult<&FrameSlot> {
        self.frame_slots
            .get(frame_index)
            .ok_or_else(|| GfxError::invalid_argument(format!("frame index {frame_index} out of range")))
    }
}

// 资源状态
impl RenderContext {
    #[inline]
    pub fn request_transition(
        &self,
        cmd: &GfxCommandBuffer,
        resource: impl Into<GfxResourceHandle>,
        range: SubresourceRange,
        desired: SubresourceState,
    ) -> GfxResult<BarrierSummary> {
        self.barrier_batcher.request_transition(cmd, resource, range, desired)
    }

    #[inline]
    pub fn batch_transition(&self, cmd: &GfxCommandBuffer, requests: &[TransitionRequest]) -> GfxResult<BarrierSummary> {
        self.barrier_batcher.batch_transition(cmd, requests)
    }
}

// 同步
impl RenderContext {
    #[inline]
    pub fn acquire_semaphore(&self, frame_index: usize) -> GfxResult<GfxSemaphore> {
        self.semaphore_pool.acquire(frame_index)
    }

    #[inline]
    pub fn reclaim_semaphores(&self, frame_index: usize) -> GfxResult<()> {
        self.semaphore_pool.reclaim(frame_index)
    }

    /// 阻塞等待 slot 的 fence，使用配置中的诊断超时
    pub fn wait_frame_slot(&self, frame_index: usize) -> GfxResult<()> {
        self.frame_slot(frame_index)?.wait(self.device.as_ref(), self.config.fence_timeout())
    }

    pub fn reset_frame_slot(&mut self, frame_index: usize) -> GfxResult<()> {
        let slot = self
            .frame_slots
            .get_mut(frame_index)
            .ok_or_else(|| GfxError::invalid_argument(format!("frame index {frame_index} out of range")))?;
        slot.reset_command_pools(self.device.as_ref())
    }

    /// 从当前帧的 slot 中取一个 command buffer，所在 family 由角色决定
    pub fn allocate_command_buffer(&mut self, role: QueueRole, debug_name: &str) -> GfxResult<GfxCommandBuffer> {
        let family = self.queue(role)?.queue_family_index();
        let frame_index = self.frame_counter.frame_index();
        let name = format!("{}{}", self.frame_counter.frame_name(), debug_name);
        let slot = self
            .frame_slots
            .get_mut(frame_index)
            .ok_or_else(|| GfxError::invalid_argument(format!("frame index {frame_index} out of range")))?;
        slot.command_buffer(self.device.as_ref(), family, &name)
    }

    #[inline]
    pub fn next_frame(&mut self) {
        self.frame_counter.next_frame();
    }
}

// 拷贝与 descriptor
impl RenderContext {
    #[inline]
    pub fn enqueue_copy(&self, target: GfxBufferHandle, ranges: Vec<MemoryRange>) -> GfxResult<()> {
        self.copy_queue.enqueue(target, ranges)
    }

    #[inline]
    pub fn drain_copies(&self) -> GfxResult<DrainStats> {
        self.copy_queue.drain(&self.device, &self.worker_pool)
    }

    #[inline]
    pub fn get_or_create_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
        bindings: &[GfxDescriptorBinding],
    ) -> GfxResult<vk::DescriptorSet> {
        self.descriptor_cache.get_or_create(layout, bindings)
    }
}

// destroy
impl RenderContext {
    /// 等待 device 空闲后释放同步对象、command pool 与 descriptor pool
    ///
    /// 等待失败时仍然会释放，返回第一个错误
    pub fn shutdown(self) -> GfxResult<()> {
        let _span = tracy_client::span!("RenderContext::shutdown");

        let mut first_error = None;
        if let Err(e) = self.device.device_wait_idle() {
            log::error!("wait device idle during shutdown: {e}");
            first_error.get_or_insert(e);
        }
        // device idle 之后 fence 应当都已 signal，这里只做校验
        for slot in &self.frame_slots {
            if let Err(e) = slot.wait(self.device.as_ref(), self.config.fence_timeout()) {
                log::error!("wait frame slot {} during shutdown: {e}", slot.index());
                first_error.get_or_insert(e);
            }
        }

        let pending = self.copy_queue.pending_count();
        if pending > 0 {
            log::warn!("{pending} copy requests dropped at shutdown");
        }

        self.descriptor_cache.destroy();
        self.semaphore_pool.destroy();
        for slot in self.frame_slots {
            slot.destroy(self.device.as_ref());
        }

        log::info!("render context shut down after {} frames", self.frame_counter.frame_id());
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;
    use ferrule_gfx::headless::{HeadlessDevice, HeadlessDeviceDesc, HeadlessEvent};

    use super::*;
    use crate::state_table::ImageRegisterDesc;

    fn config() -> RenderCoreConfig {
        RenderCoreConfig {
            frames_in_flight: 2,
            worker_threads: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_init_resolves_standard_roles() {
        let device = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc::default()));
        let context = RenderContext::init(device.clone(), config()).unwrap();

        let graphics = context.queue(QueueRole::Graphics).unwrap();
        assert!(Arc::ptr_eq(graphics, context.queue(QueueRole::Present).unwrap()));
        assert_eq!(context.queue(QueueRole::Transfer).unwrap().queue_family_index(), 1);
        assert_eq!(context.queue(QueueRole::Compute).unwrap().queue_family_index(), 0);
        assert!(context.queue(QueueRole::Named("shadow")).is_err());

        context.shutdown().unwrap();
        assert_eq!(device.live_semaphore_count(), 0);
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let device = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc::default()));
        let bad = RenderCoreConfig {
            frames_in_flight: 0,
            ..config()
        };
        assert!(matches!(RenderContext::init(device, bad), Err(GfxError::InvalidArgument(_))));
    }

    #[test]
    fn test_context_api_round_trip() {
        let headless = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc::default()));
        let device: Arc<dyn GfxDevice> = headless.clone();
        let mut context = RenderContext::init(device.clone(), config()).unwrap();

        // 拷贝
        let buffer = device.create_host_buffer(8, vk::BufferUsageFlags::UNIFORM_BUFFER, "ubo").unwrap();
        let ubo = context.state_table().register_buffer(buffer, 8, SubresourceState::BUFFER_HOST_WRITE, "ubo").unwrap();
        context.enqueue_copy(ubo, vec![MemoryRange::from_pod(&[1u32, 2u32], 0)]).unwrap();
        assert_eq!(context.drain_copies().unwrap().bytes, 8);
        assert_eq!(bytemuck::pod_read_unaligned::<[u32; 2]>(&headless.read_buffer(buffer).unwrap()), [1, 2]);

        // barrier
        let image = context
            .state_table()
            .register_image(ImageRegisterDesc {
                image: vk::Image::from_raw(77),
                format: vk::Format::R8G8B8A8_UNORM,
                mip_levels: 1,
                array_layers: 1,
                initial_state: SubresourceState::UNDEFINED,
                debug_name: "color".to_string(),
            })
            .unwrap();
        let cmd = context.allocate_command_buffer(QueueRole::Graphics, "main").unwrap();
        let summary = context
            .request_transition(&cmd, image, SubresourceRange::WHOLE, SubresourceState::COLOR_ATTACHMENT_WRITE)
            .unwrap();
        assert_eq!(summary.image_barriers, 1);

        // descriptor
        let bindings = [GfxDescriptorBinding::uniform_buffer(0, buffer, 0, 8)];
        let layout = vk::DescriptorSetLayout::from_raw(5);
        let set = context.get_or_create_descriptor_set(layout, &bindings).unwrap();
        assert_eq!(context.get_or_create_descriptor_set(layout, &bindings).unwrap(), set);

        // semaphore
        context.acquire_semaphore(1).unwrap();
        context.reclaim_semaphores(1).unwrap();
        assert_eq!(context.semaphore_pool().available_count(1), 1);

        assert!(headless.events().iter().any(|e| matches!(e, HeadlessEvent::PipelineBarrier { .. })));
        context.next_frame();
        assert_eq!(context.frame_counter().frame_index(), 1);
        context.shutdown().unwrap();
    }

    #[test]
    fn test_fence_timeout_is_fatal() {
        use ferrule_gfx::headless::HeadlessFenceMode;

        let device = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc {
            fence_mode: HeadlessFenceMode::Manual,
            ..Default::default()
        }));
        let context = RenderContext::init(
            device.clone(),
            RenderCoreConfig {
                fence_timeout_ms: Some(5),
                ..config()
            },
        )
        .unwrap();

        context.wait_frame_slot(0).unwrap();
        context.frame_slot(0).unwrap().reset_fence(device.as_ref()).unwrap();
        let err = context.wait_frame_slot(0).unwrap_err();
        assert!(matches!(err, GfxError::DeviceLost(_)));

        device.signal_fence(context.frame_slot(0).unwrap().fence().handle());
        context.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_waits_device_idle_before_release() {
        use ferrule_gfx::headless::HeadlessFenceMode;

        let device = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc {
            fence_mode: HeadlessFenceMode::Manual,
            ..Default::default()
        }));
        let context = RenderContext::init(
            device.clone(),
            RenderCoreConfig {
                fence_timeout_ms: Some(5),
                ..config()
            },
        )
        .unwrap();

        // 一次未完成的提交，fence 只能靠 device idle 来 signal
        let slot = context.frame_slot(0).unwrap();
        slot.reset_fence(device.as_ref()).unwrap();
        let fence = slot.fence().handle();
        context
            .queue(QueueRole::Graphics)
            .unwrap()
            .submit(device.as_ref(), &[], Some(slot.fence()))
            .unwrap();

        context.shutdown().unwrap();

        let events = device.events();
        let idle = events.iter().position(|e| matches!(e, HeadlessEvent::DeviceWaitIdle)).unwrap();
        let signaled = events
            .iter()
            .rposition(|e| matches!(e, HeadlessEvent::FenceSignaled { fence: f } if *f == fence))
            .unwrap();
        // fence 由 idle 等待 signal，随后的 slot 校验不会超时
        assert!(signaled < idle);
    }
}
