//! 延迟的 host -> device 拷贝
//!
//! update 阶段任意线程都可以 enqueue，请求只在锁内追加，立即返回。
//! 每帧由编排线程在复用 slot 的 fence 等待之后、录制命令之前 drain 一次：
//! 每个目标资源一个拷贝任务，分发到 worker 线程池，全部完成后才返回。

use std::{mem, sync::Arc};

use ash::vk;
use crossbeam_utils::sync::WaitGroup;
use ferrule_gfx::{
    device::{GfxBufferWrite, GfxDevice},
    error::{GfxError, GfxResult},
};
use itertools::Itertools;
use parking_lot::Mutex;

use crate::{handles::GfxBufferHandle, state_table::ResourceStateTable};

/// 一段要写入 buffer 的数据
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRange {
    pub data: Vec<u8>,
    /// 实际写入的字节数，不超过 `data.len()`
    pub size: vk::DeviceSize,
    /// 在目标 buffer 中的偏移
    pub offset: vk::DeviceSize,
}

impl MemoryRange {
    /// 写入 `data` 的全部内容
    pub fn new(data: Vec<u8>, offset: vk::DeviceSize) -> Self {
        let size = data.len() as vk::DeviceSize;
        Self { data, size, offset }
    }

    pub fn with_size(data: Vec<u8>, size: vk::DeviceSize, offset: vk::DeviceSize) -> Self {
        Self { data, size, offset }
    }

    /// 从 POD 数据（例如 uniform 结构体）构造
    pub fn from_pod<T: bytemuck::Pod>(value: &T, offset: vk::DeviceSize) -> Self {
        Self::new(bytemuck::bytes_of(value).to_vec(), offset)
    }

    pub fn from_pod_slice<T: bytemuck::Pod>(values: &[T], offset: vk::DeviceSize) -> Self {
        Self::new(bytemuck::cast_slice(values).to_vec(), offset)
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }
}

/// 一个目标 buffer 上的一组拷贝
#[derive(Clone, Debug)]
pub struct CopyRequest {
    pub target: GfxBufferHandle,
    pub ranges: Vec<MemoryRange>,
}

/// 一次 drain 完成的工作量
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub requests: usize,
    /// 涉及的资源数量，也是分发的任务数量
    pub resources: usize,
    pub ranges: usize,
    pub bytes: usize,
}

pub struct DeferredCopyQueue {
    state_table: Arc<ResourceStateTable>,
    requests: Mutex<Vec<CopyRequest>>,
}

// new & init
impl DeferredCopyQueue {
    pub fn new(state_table: Arc<ResourceStateTable>) -> Self {
        Self {
            state_table,
            requests: Mutex::new(Vec::new()),
        }
    }
}

// getters
impl DeferredCopyQueue {
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.requests.lock().len()
    }
}

// tools
impl DeferredCopyQueue {
    /// 追加一个拷贝请求
    ///
    /// 参数在这里就完成校验：null / 失效的 handle、超出 buffer 的范围、
    /// `data` 比 `size` 短，都返回 `InvalidArgument`，队列保持不变。
    pub fn enqueue(&self, target: GfxBufferHandle, ranges: Vec<MemoryRange>) -> GfxResult<()> {
        let (_, buffer_size) = self.state_table.buffer_info(target)?;
        for range in &ranges {
            if (range.data.len() as vk::DeviceSize) < range.size {
                return Err(GfxError::invalid_argument(format!(
                    "copy range declares {} bytes but only carries {}",
                    range.size,
                    range.data.len()
                )));
            }
            let end = range.offset.checked_add(range.size);
            if end.is_none_or(|end| end > buffer_size) {
                return Err(GfxError::invalid_argument(format!(
                    "copy range [{}, +{}) exceeds buffer size {buffer_size}",
                    range.offset, range.size
                )));
            }
        }
        if ranges.is_empty() {
            return Ok(());
        }

        self.requests.lock().push(CopyRequest { target, ranges });
        Ok(())
    }

    /// 执行所有积压的拷贝
    ///
    /// 同一个资源的所有 range 在同一个任务里按 enqueue 顺序写入；不同资源并行。
    /// 任意任务失败时，等待全部任务结束后返回第一个错误。
    pub fn drain(&self, device: &Arc<dyn GfxDevice>, pool: &rayon::ThreadPool) -> GfxResult<DrainStats> {
        let _span = tracy_client::span!("DeferredCopyQueue::drain");

        let requests = mem::take(&mut *self.requests.lock());
        if requests.is_empty() {
            return Ok(DrainStats::default());
        }

        let mut stats = DrainStats {
            requests: requests.len(),
            ..Default::default()
        };
        let grouped = requests
            .into_iter()
            .map(|request| (request.target, request.ranges))
            .into_group_map();
        stats.resources = grouped.len();

        let (result_tx, result_rx) = crossbeam_channel::unbounded::<GfxResult<()>>();
        let wait_group = WaitGroup::new();

        for (target, ranges) in grouped {
            let ranges = ranges.into_iter().flatten().collect_vec();
            stats.ranges += ranges.len();
            stats.bytes += ranges.iter().map(|r| r.size as usize).sum::<usize>();

            // 资源可能在 enqueue 之后被注销
            let buffer = match self.state_table.buffer_info(target) {
                Ok((buffer, _)) => buffer,
                Err(e) => {
                    log::error!("drop copies to {target:?}: {e}");
                    let _ = result_tx.send(Err(e));
                    continue;
                }
            };

            let device = device.clone();
            let result_tx = result_tx.clone();
            let wg_task = wait_group.clone();
            pool.spawn(move || {
                let _span = tracy_client::span!("copy_task");
                let writes = ranges
                    .iter()
                    .map(|range| GfxBufferWrite {
                        offset: range.offset,
                        data: range.bytes(),
                    })
                    .collect_vec();
                let _ = result_tx.send(device.write_buffer(buffer, &writes));

                drop(wg_task);
            });
        }
        drop(result_tx);

        wait_group.wait();

        let mut first_error = None;
        for result in result_rx.try_iter() {
            if let Err(e) = result {
                log::error!("copy task failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                log::debug!(
                    "drained {} copy requests: {} resources, {} ranges, {} bytes",
                    stats.requests,
                    stats.resources,
                    stats.ranges,
                    stats.bytes
                );
                Ok(stats)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use ferrule_gfx::headless::{HeadlessDevice, HeadlessDeviceDesc, HeadlessEvent};

    use super::*;
    use crate::resource_state::SubresourceState;

    struct Fixture {
        headless: Arc<HeadlessDevice>,
        device: Arc<dyn GfxDevice>,
        table: Arc<ResourceStateTable>,
        queue: Arc<DeferredCopyQueue>,
        pool: rayon::ThreadPool,
    }

    fn fixture() -> Fixture {
        let headless = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc::default()));
        let table = Arc::new(ResourceStateTable::new());
        Fixture {
            device: headless.clone(),
            headless,
            queue: Arc::new(DeferredCopyQueue::new(table.clone())),
            table,
            pool: rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap(),
        }
    }

    impl Fixture {
        fn buffer(&self, size: vk::DeviceSize, name: &str) -> (vk::Buffer, GfxBufferHandle) {
            let buffer = self.device.create_host_buffer(size, vk::BufferUsageFlags::UNIFORM_BUFFER, name).unwrap();
            let handle = self.table.register_buffer(buffer, size, SubresourceState::BUFFER_HOST_WRITE, name).unwrap();
            (buffer, handle)
        }
    }

    #[test]
    fn test_copy_visible_after_drain() {
        let f = fixture();
        let (buffer, handle) = f.buffer(16, "uniform");

        f.queue.enqueue(handle, vec![MemoryRange::new(vec![1, 2, 3, 4], 0)]).unwrap();
        assert_eq!(f.queue.pending_count(), 1);
        // drain 之前不可见
        assert_eq!(f.headless.read_buffer(buffer).unwrap()[..4], [0, 0, 0, 0]);

        let stats = f.queue.drain(&f.device, &f.pool).unwrap();
        assert_eq!(stats.bytes, 4);
        assert_eq!(f.queue.pending_count(), 0);
        assert_eq!(f.headless.read_buffer(buffer).unwrap()[..4], [1, 2, 3, 4]);
    }

    #[test]
    fn test_ranges_applied_in_enqueue_order() {
        let f = fixture();
        let (buffer, handle) = f.buffer(8, "overlap");

        f.queue.enqueue(handle, vec![MemoryRange::new(vec![1; 8], 0)]).unwrap();
        f.queue.enqueue(handle, vec![MemoryRange::new(vec![2; 4], 2)]).unwrap();
        f.queue.enqueue(handle, vec![MemoryRange::with_size(vec![3, 3, 9], 2, 4)]).unwrap();
        f.queue.drain(&f.device, &f.pool).unwrap();

        assert_eq!(f.headless.read_buffer(buffer).unwrap(), vec![1, 1, 2, 2, 3, 3, 1, 1]);
    }

    #[test]
    fn test_one_task_per_resource() {
        let f = fixture();
        let (a, ha) = f.buffer(64, "a");
        let (b, hb) = f.buffer(64, "b");

        for i in 0..5u32 {
            let target = if i % 2 == 0 { ha } else { hb };
            f.queue.enqueue(target, vec![MemoryRange::from_pod(&i, (i * 4) as vk::DeviceSize)]).unwrap();
        }
        let stats = f.queue.drain(&f.device, &f.pool).unwrap();
        assert_eq!(
            stats,
            DrainStats {
                requests: 5,
                resources: 2,
                ranges: 5,
                bytes: 20,
            }
        );

        let writes = f
            .headless
            .events()
            .into_iter()
            .filter(|e| matches!(e, HeadlessEvent::BufferWrite { .. }))
            .count();
        assert_eq!(writes, 2);

        let words = |bytes: Vec<u8>| bytes[..20].chunks(4).map(bytemuck::pod_read_unaligned::<u32>).collect_vec();
        assert_eq!(words(f.headless.read_buffer(a).unwrap()), vec![0, 0, 2, 0, 4]);
        assert_eq!(words(f.headless.read_buffer(b).unwrap()), vec![0, 1, 0, 3, 0]);
    }

    #[test]
    fn test_enqueue_validates_eagerly() {
        let f = fixture();
        let (_, handle) = f.buffer(8, "small");

        let invalid = |r: GfxResult<()>| matches!(r, Err(GfxError::InvalidArgument(_)));
        assert!(invalid(f.queue.enqueue(GfxBufferHandle::null(), vec![MemoryRange::new(vec![0], 0)])));
        assert!(invalid(f.queue.enqueue(handle, vec![MemoryRange::new(vec![0; 4], 6)])));
        assert!(invalid(f.queue.enqueue(handle, vec![MemoryRange::with_size(vec![0; 2], 4, 0)])));
        assert!(invalid(f.queue.enqueue(handle, vec![MemoryRange::with_size(vec![], 0, u64::MAX)])));
        assert_eq!(f.queue.pending_count(), 0);
    }

    #[test]
    fn test_enqueue_from_many_threads() {
        let f = fixture();
        let (buffer, handle) = f.buffer(64, "shared");

        thread::scope(|s| {
            for i in 0..8u8 {
                let queue = &f.queue;
                s.spawn(move || queue.enqueue(handle, vec![MemoryRange::new(vec![i + 1; 8], i as u64 * 8)]).unwrap());
            }
        });
        assert_eq!(f.queue.pending_count(), 8);
        f.queue.drain(&f.device, &f.pool).unwrap();

        let bytes = f.headless.read_buffer(buffer).unwrap();
        for i in 0..8usize {
            assert!(bytes[i * 8..(i + 1) * 8].iter().all(|b| *b == i as u8 + 1));
        }
    }

    #[test]
    fn test_unregistered_target_reports_error_after_other_copies() {
        let f = fixture();
        let (kept, kept_handle) = f.buffer(4, "kept");
        let (_, gone_handle) = f.buffer(4, "gone");

        f.queue.enqueue(gone_handle, vec![MemoryRange::new(vec![7; 4], 0)]).unwrap();
        f.queue.enqueue(kept_handle, vec![MemoryRange::new(vec![9; 4], 0)]).unwrap();
        f.table.unregister(gone_handle).unwrap();

        assert!(matches!(f.queue.drain(&f.device, &f.pool), Err(GfxError::InvalidArgument(_))));
        assert_eq!(f.headless.read_buffer(kept).unwrap(), vec![9; 4]);
        assert_eq!(f.queue.pending_count(), 0);
    }

    #[test]
    fn test_drain_empty_is_noop() {
        let f = fixture();
        assert_eq!(f.queue.drain(&f.device, &f.pool).unwrap(), DrainStats::default());
        assert!(f.headless.events().is_empty());
    }
}
