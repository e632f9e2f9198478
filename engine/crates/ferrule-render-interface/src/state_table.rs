//! 资源状态表
//!
//! 记录每个已注册资源的每个子资源当前被请求的状态。表里保存的是最后一次
//! 请求的状态，而不是 GPU 实际执行到的状态：barrier 录制的同时就更新表。

use std::collections::HashSet;

use ash::vk;
use ferrule_gfx::{
    commands::barrier::{BarrierScope, GfxBufferBarrier, GfxImageBarrier},
    error::{GfxError, GfxResult},
};
use parking_lot::Mutex;
use slotmap::SlotMap;

use crate::{
    barrier::TransitionRequest,
    handles::{GfxBufferHandle, GfxImageHandle, GfxResourceHandle, InnerResourceHandle},
    resource_state::{ResolvedRange, SubresourceRange, SubresourceState},
};

/// 注册 image 所需的信息，image 本身仍由创建者持有
#[derive(Clone, Debug)]
pub struct ImageRegisterDesc {
    pub image: vk::Image,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub initial_state: SubresourceState,
    pub debug_name: String,
}

#[derive(Clone, Copy, Debug)]
enum ResourceKind {
    Image {
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
        array_layers: u32,
    },
    Buffer {
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    },
}

struct ResourceRecord {
    kind: ResourceKind,
    /// image 按 `layer * mip_levels + mip` 展平；buffer 只有一项
    states: Vec<SubresourceState>,
    debug_name: String,
}

/// 一段连续 mip、连续 layer 上相同的状态转换
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ImageTransitionRun {
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    from: SubresourceState,
    to: SubresourceState,
    base_mip_level: u32,
    level_count: u32,
    base_array_layer: u32,
    layer_count: u32,
}

impl ImageTransitionRun {
    /// 只在紧邻的下一个 layer 上、mip 范围与转换完全相同时才能合并
    fn try_extend_layer(&mut self, next: &ImageTransitionRun) -> bool {
        let same_transition = self.image == next.image
            && self.from == next.from
            && self.to == next.to
            && self.base_mip_level == next.base_mip_level
            && self.level_count == next.level_count;
        if same_transition && self.base_array_layer + self.layer_count == next.base_array_layer {
            self.layer_count += next.layer_count;
            true
        } else {
            false
        }
    }

    fn to_gfx_barrier(&self) -> GfxImageBarrier {
        GfxImageBarrier::for_image(self.image, self.aspect)
            .mips(self.base_mip_level, self.level_count)
            .layers(self.base_array_layer, self.layer_count)
            .layouts(self.from.layout, self.to.layout)
            .scopes(src_scope(&self.from), dst_scope(&self.to))
            .ownership(SubresourceState::ownership_transfer(&self.from, &self.to))
    }
}

/// 一次状态转换计算出的 barrier，尚未录制
#[derive(Default)]
pub(crate) struct PendingBarriers {
    pub image_barriers: Vec<GfxImageBarrier>,
    pub buffer_barriers: Vec<GfxBufferBarrier>,
    /// 状态发生变化的子资源数量
    pub changed_subresources: usize,
}

impl PendingBarriers {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.image_barriers.is_empty() && self.buffer_barriers.is_empty()
    }
}

/// 子资源被修改之前的状态
#[derive(Clone, Copy, Debug)]
struct JournalEntry {
    handle: InnerResourceHandle,
    index: usize,
    prior: SubresourceState,
}

/// 资源状态表
///
/// 整张表由一把粗粒度的锁保护，资源通过代际索引引用。
///
/// 录制一帧时可以打开 journal：期间的每次状态修改都会记下旧状态，
/// 这一帧最终没有提交时用 [`ResourceStateTable::rollback_journal`] 恢复。
/// 加锁顺序固定为 records -> journal。
#[derive(Default)]
pub struct ResourceStateTable {
    records: Mutex<SlotMap<InnerResourceHandle, ResourceRecord>>,
    journal: Mutex<Option<Vec<JournalEntry>>>,
}

// new & init
impl ResourceStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_image(&self, desc: ImageRegisterDesc) -> GfxResult<GfxImageHandle> {
        if desc.image == vk::Image::null() {
            return Err(GfxError::invalid_argument(format!("register null image: {}", desc.debug_name)));
        }
        if desc.mip_levels == 0 || desc.array_layers == 0 {
            return Err(GfxError::invalid_argument(format!(
                "image {} has {} mips and {} layers",
                desc.debug_name, desc.mip_levels, desc.array_layers
            )));
        }

        let subresource_count = (desc.mip_levels * desc.array_layers) as usize;
        let record = ResourceRecord {
            kind: ResourceKind::Image {
                image: desc.image,
                aspect: infer_image_aspect(desc.format),
                mip_levels: desc.mip_levels,
                array_layers: desc.array_layers,
            },
            states: vec![desc.initial_state; subresource_count],
            debug_name: desc.debug_name,
        };
        let inner = self.records.lock().insert(record);
        Ok(GfxImageHandle { inner })
    }

    pub fn register_buffer(
        &self,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        initial_state: SubresourceState,
        debug_name: impl Into<String>,
    ) -> GfxResult<GfxBufferHandle> {
        let debug_name = debug_name.into();
        if buffer == vk::Buffer::null() {
            return Err(GfxError::invalid_argument(format!("register null buffer: {debug_name}")));
        }

        let record = ResourceRecord {
            kind: ResourceKind::Buffer { buffer, size },
            states: vec![initial_state],
            debug_name,
        };
        let inner = self.records.lock().insert(record);
        Ok(GfxBufferHandle { inner })
    }

    /// 资源销毁时调用，之后该 handle 失效
    pub fn unregister(&self, handle: impl Into<GfxResourceHandle>) -> GfxResult<()> {
        let handle = handle.into();
        self.records
            .lock()
            .remove(handle.inner())
            .map(|_| ())
            .ok_or_else(|| GfxError::invalid_argument(format!("unregister unknown resource {handle:?}")))
    }
}

// getters
impl ResourceStateTable {
    #[inline]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn image_state(&self, handle: GfxImageHandle, mip_level: u32, array_layer: u32) -> GfxResult<SubresourceState> {
        let records = self.records.lock();
        let record = Self::lookup(&records, handle.into())?;
        let ResourceKind::Image {
            mip_levels,
            array_layers,
            ..
        } = record.kind
        else {
            return Err(GfxError::invalid_argument(format!("{} is not an image", record.debug_name)));
        };
        if mip_level >= mip_levels || array_layer >= array_layers {
            return Err(GfxError::invalid_argument(format!(
                "subresource (mip {mip_level}, layer {array_layer}) out of range for {}",
                record.debug_name
            )));
        }
        Ok(record.states[(array_layer * mip_levels + mip_level) as usize])
    }

    pub fn buffer_state(&self, handle: GfxBufferHandle) -> GfxResult<SubresourceState> {
        let records = self.records.lock();
        Ok(Self::lookup(&records, handle.into())?.states[0])
    }

    /// buffer 的 vk handle 与大小
    pub fn buffer_info(&self, handle: GfxBufferHandle) -> GfxResult<(vk::Buffer, vk::DeviceSize)> {
        let records = self.records.lock();
        let record = Self::lookup(&records, handle.into())?;
        match record.kind {
            ResourceKind::Buffer { buffer, size } => Ok((buffer, size)),
            ResourceKind::Image { .. } => {
                Err(GfxError::invalid_argument(format!("{} is not a buffer", record.debug_name)))
            }
        }
    }

    fn lookup(
        records: &SlotMap<InnerResourceHandle, ResourceRecord>,
        handle: GfxResourceHandle,
    ) -> GfxResult<&ResourceRecord> {
        if handle.is_null() {
            return Err(GfxError::invalid_argument("null resource handle"));
        }
        let record = records
            .get(handle.inner())
            .ok_or_else(|| GfxError::invalid_argument(format!("stale or unknown resource handle {handle:?}")))?;
        let kind_matches = matches!(
            (handle, record.kind),
            (GfxResourceHandle::Image(_), ResourceKind::Image { .. })
                | (GfxResourceHandle::Buffer(_), ResourceKind::Buffer { .. })
        );
        if !kind_matches {
            return Err(GfxError::invalid_argument(format!("handle kind mismatch for {}", record.debug_name)));
        }
        Ok(record)
    }
}

// tools
impl ResourceStateTable {
    /// 不录制 barrier，直接覆盖所有子资源的状态
    ///
    /// 用于在外部完成转换的资源，例如刚 acquire 的 swapchain image。
    pub fn set_state_all(&self, handle: impl Into<GfxResourceHandle>, state: SubresourceState) -> GfxResult<()> {
        let handle = handle.into();
        let mut records = self.records.lock();
        Self::lookup(&records, handle)?;
        if let Some(record) = records.get_mut(handle.inner()) {
            let mut journal = self.journal.lock();
            if let Some(journal) = journal.as_mut() {
                journal.extend(record.states.iter().enumerate().map(|(index, prior)| JournalEntry {
                    handle: handle.inner(),
                    index,
                    prior: *prior,
                }));
            }
            record.states.fill(state);
        }
        Ok(())
    }

    /// 开始记录状态修改；已经打开的 journal 会被丢弃
    pub fn begin_journal(&self) {
        let mut journal = self.journal.lock();
        if let Some(stale) = journal.as_ref()
            && !stale.is_empty()
        {
            log::warn!("discard an unfinished state journal with {} entries", stale.len());
        }
        *journal = Some(Vec::new());
    }

    /// 修改已经生效（对应的命令已经提交），关闭 journal
    pub fn commit_journal(&self) {
        self.journal.lock().take();
    }

    /// 按相反顺序恢复 journal 中记录的旧状态并关闭 journal，返回恢复的条目数
    ///
    /// 期间被 unregister 的资源直接跳过
    pub fn rollback_journal(&self) -> usize {
        let mut records = self.records.lock();
        let Some(entries) = self.journal.lock().take() else {
            return 0;
        };
        let mut restored = 0;
        for entry in entries.iter().rev() {
            if let Some(state) = records.get_mut(entry.handle).and_then(|r| r.states.get_mut(entry.index)) {
                *state = entry.prior;
                restored += 1;
            }
        }
        restored
    }

    /// 计算一批状态转换需要的 barrier，并立即更新表
    ///
    /// 整批请求先全部校验，任何一个不合法都不会修改表。同一批中
    /// 同一个子资源只能出现一次。
    pub(crate) fn transition(&self, requests: &[TransitionRequest]) -> GfxResult<PendingBarriers> {
        let mut records = self.records.lock();

        // 1. 校验
        let mut resolved = Vec::with_capacity(requests.len());
        let mut touched = HashSet::new();
        for request in requests {
            let record = Self::lookup(&records, request.resource)?;
            let range = match record.kind {
                ResourceKind::Image {
                    mip_levels,
                    array_layers,
                    ..
                } => request.range.resolve(mip_levels, array_layers)?,
                ResourceKind::Buffer { .. } => {
                    if request.range != SubresourceRange::WHOLE {
                        return Err(GfxError::invalid_argument(format!(
                            "buffer {} only supports the whole range",
                            record.debug_name
                        )));
                    }
                    SubresourceRange::new(0, 1, 0, 1).resolve(1, 1)?
                }
            };

            let mip_levels = match record.kind {
                ResourceKind::Image { mip_levels, .. } => mip_levels,
                ResourceKind::Buffer { .. } => 1,
            };
            for (layer, mip) in range_indices(&range) {
                if !touched.insert((request.resource.inner(), layer * mip_levels + mip)) {
                    return Err(GfxError::invalid_argument(format!(
                        "subresource (mip {mip}, layer {layer}) of {} appears twice in one batch",
                        record.debug_name
                    )));
                }
            }
            resolved.push((request, range));
        }

        // 2. diff 并更新
        let mut journal = self.journal.lock();
        let mut pending = PendingBarriers::default();
        let mut image_runs: Vec<ImageTransitionRun> = Vec::new();
        for (request, range) in resolved {
            let record = records
                .get_mut(request.resource.inner())
                .ok_or_else(|| GfxError::invalid_argument("resource vanished during transition"))?;

            match record.kind {
                ResourceKind::Image {
                    image,
                    aspect,
                    mip_levels,
                    ..
                } => {
                    let mip_end = range.base_mip_level + range.level_count;
                    for layer in range.base_array_layer..range.base_array_layer + range.layer_count {
                        let index = |mip: u32| (layer * mip_levels + mip) as usize;
                        let mut mip = range.base_mip_level;
                        while mip < mip_end {
                            let current = record.states[index(mip)];
                            let target = request.desired.resolve_queue_family(&current);
                            if current == target {
                                mip += 1;
                                continue;
                            }

                            // 相邻且状态相同的 mip 合并为一个 barrier
                            let run_start = mip;
                            while mip < mip_end && record.states[index(mip)] == current {
                                if let Some(journal) = journal.as_mut() {
                                    journal.push(JournalEntry {
                                        handle: request.resource.inner(),
                                        index: index(mip),
                                        prior: current,
                                    });
                                }
                                record.states[index(mip)] = target;
                                mip += 1;
                            }
                            pending.changed_subresources += (mip - run_start) as usize;

                            let run = ImageTransitionRun {
                                image,
                                aspect,
                                from: current,
                                to: target,
                                base_mip_level: run_start,
                                level_count: mip - run_start,
                                base_array_layer: layer,
                                layer_count: 1,
                            };
                            let merged = image_runs.iter_mut().rev().any(|prev| prev.try_extend_layer(&run));
                            if !merged {
                                image_runs.push(run);
                            }
                        }
                    }
                }
                ResourceKind::Buffer { buffer, .. } => {
                    let current = record.states[0];
                    let target = request.desired.resolve_queue_family(&current);
                    if current == target {
                        continue;
                    }
                    if let Some(journal) = journal.as_mut() {
                        journal.push(JournalEntry {
                            handle: request.resource.inner(),
                            index: 0,
                            prior: current,
                        });
                    }
                    record.states[0] = target;
                    pending.changed_subresources += 1;

                    let barrier = GfxBufferBarrier::whole(buffer)
                        .scopes(src_scope(&current), dst_scope(&target))
                        .ownership(SubresourceState::ownership_transfer(&current, &target));
                    pending.buffer_barriers.push(barrier);
                }
            }
        }
        pending.image_barriers = image_runs.iter().map(ImageTransitionRun::to_gfx_barrier).collect();

        Ok(pending)
    }
}

#[inline]
fn src_scope(state: &SubresourceState) -> BarrierScope {
    BarrierScope::new(state.stage, state.src_access())
}

#[inline]
fn dst_scope(state: &SubresourceState) -> BarrierScope {
    BarrierScope::new(state.stage, state.access)
}

/// 范围内所有 (layer, mip)
fn range_indices(range: &ResolvedRange) -> impl Iterator<Item = (u32, u32)> + '_ {
    (range.base_array_layer..range.base_array_layer + range.layer_count)
        .flat_map(move |layer| (range.base_mip_level..range.base_mip_level + range.level_count).map(move |mip| (layer, mip)))
}

/// 推断图像的 aspect flags
///
/// 根据 format 自动推断（简化版本）
pub fn infer_image_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => vk::ImageAspectFlags::DEPTH,

        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,

        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }

        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;

    fn image_desc(raw: u64, mip_levels: u32, array_layers: u32) -> ImageRegisterDesc {
        ImageRegisterDesc {
            image: vk::Image::from_raw(raw),
            format: vk::Format::R8G8B8A8_UNORM,
            mip_levels,
            array_layers,
            initial_state: SubresourceState::UNDEFINED,
            debug_name: format!("image-{raw}"),
        }
    }

    #[test]
    fn test_register_and_stale_handle() {
        let table = ResourceStateTable::new();
        let image = table.register_image(image_desc(1, 1, 1)).unwrap();
        assert_eq!(table.len(), 1);

        table.unregister(image).unwrap();
        assert!(table.is_empty());
        assert!(matches!(table.image_state(image, 0, 0), Err(GfxError::InvalidArgument(_))));

        // 新资源复用了 slot，但旧 handle 依然无效
        let _other = table.register_image(image_desc(2, 1, 1)).unwrap();
        assert!(table.image_state(image, 0, 0).is_err());
    }

    #[test]
    fn test_register_rejects_null_and_empty() {
        let table = ResourceStateTable::new();
        assert!(table.register_image(image_desc(0, 1, 1)).is_err());
        assert!(table.register_image(image_desc(1, 0, 1)).is_err());
        assert!(table.register_buffer(vk::Buffer::null(), 16, SubresourceState::UNDEFINED, "b").is_err());
    }

    #[test]
    fn test_per_mip_states_are_independent() {
        let table = ResourceStateTable::new();
        let image = table.register_image(image_desc(1, 4, 1)).unwrap();

        // mip 生成：读 mip 0，写 mip 1
        let requests = [
            TransitionRequest::image(image, SubresourceRange::mip(0), SubresourceState::TRANSFER_SRC),
            TransitionRequest::image(image, SubresourceRange::mip(1), SubresourceState::TRANSFER_DST),
        ];
        let pending = table.transition(&requests).unwrap();
        assert_eq!(pending.image_barriers.len(), 2);

        assert_eq!(table.image_state(image, 0, 0).unwrap(), SubresourceState::TRANSFER_SRC);
        assert_eq!(table.image_state(image, 1, 0).unwrap(), SubresourceState::TRANSFER_DST);
        assert_eq!(table.image_state(image, 2, 0).unwrap(), SubresourceState::UNDEFINED);
    }

    #[test]
    fn test_adjacent_subresources_coalesce() {
        let table = ResourceStateTable::new();
        let image = table.register_image(image_desc(1, 3, 2)).unwrap();

        let pending = table
            .transition(&[TransitionRequest::image(image, SubresourceRange::WHOLE, SubresourceState::SHADER_READ_FRAGMENT)])
            .unwrap();
        assert_eq!(pending.changed_subresources, 6);
        assert_eq!(pending.image_barriers.len(), 1);

        let range = pending.image_barriers[0].inner().subresource_range;
        assert_eq!((range.level_count, range.layer_count), (3, 2));
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn test_mixed_states_split_runs() {
        let table = ResourceStateTable::new();
        let image = table.register_image(image_desc(1, 3, 1)).unwrap();
        table
            .transition(&[TransitionRequest::image(image, SubresourceRange::mip(1), SubresourceState::TRANSFER_DST)])
            .unwrap();

        // mip 0 与 mip 2 同为 UNDEFINED 但不相邻，mip 1 是 TRANSFER_DST
        let pending = table
            .transition(&[TransitionRequest::image(image, SubresourceRange::WHOLE, SubresourceState::SHADER_READ_FRAGMENT)])
            .unwrap();
        assert_eq!(pending.image_barriers.len(), 3);
        assert_eq!(pending.changed_subresources, 3);
    }

    #[test]
    fn test_invalid_batch_does_not_mutate() {
        let table = ResourceStateTable::new();
        let image = table.register_image(image_desc(1, 2, 1)).unwrap();

        let requests = [
            TransitionRequest::image(image, SubresourceRange::mip(0), SubresourceState::TRANSFER_DST),
            TransitionRequest::image(image, SubresourceRange::mip(7), SubresourceState::TRANSFER_DST),
        ];
        assert!(matches!(table.transition(&requests), Err(GfxError::InvalidArgument(_))));
        assert_eq!(table.image_state(image, 0, 0).unwrap(), SubresourceState::UNDEFINED);

        let overlapping = [
            TransitionRequest::image(image, SubresourceRange::WHOLE, SubresourceState::TRANSFER_DST),
            TransitionRequest::image(image, SubresourceRange::mip(1), SubresourceState::TRANSFER_SRC),
        ];
        assert!(matches!(table.transition(&overlapping), Err(GfxError::InvalidArgument(_))));
        assert_eq!(table.image_state(image, 1, 0).unwrap(), SubresourceState::UNDEFINED);
    }

    #[test]
    fn test_null_handle_is_invalid_argument() {
        let table = ResourceStateTable::new();
        let requests = [TransitionRequest::image(
            GfxImageHandle::null(),
            SubresourceRange::WHOLE,
            SubresourceState::TRANSFER_DST,
        )];
        assert!(matches!(table.transition(&requests), Err(GfxError::InvalidArgument(_))));
        assert!(matches!(table.buffer_info(GfxBufferHandle::null()), Err(GfxError::InvalidArgument(_))));
    }

    #[test]
    fn test_queue_family_ownership_transfer() {
        let table = ResourceStateTable::new();
        let buffer = table
            .register_buffer(
                vk::Buffer::from_raw(9),
                64,
                SubresourceState::BUFFER_TRANSFER_DST.on_queue_family(1),
                "vertices",
            )
            .unwrap();

        let pending = table
            .transition(&[TransitionRequest::buffer(buffer, SubresourceState::BUFFER_VERTEX.on_queue_family(0))])
            .unwrap();
        let barrier = pending.buffer_barriers[0].inner();
        assert_eq!((barrier.src_queue_family_index, barrier.dst_queue_family_index), (1, 0));

        // 未指定 family 时保留当前所有者，不产生所有权转移
        let pending = table
            .transition(&[TransitionRequest::buffer(buffer, SubresourceState::BUFFER_UNIFORM_FRAGMENT)])
            .unwrap();
        let barrier = pending.buffer_barriers[0].inner();
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(table.buffer_state(buffer).unwrap().queue_family, 0);
    }

    #[test]
    fn test_set_state_all_skips_barrier() {
        let table = ResourceStateTable::new();
        let image = table.register_image(image_desc(1, 1, 1)).unwrap();
        table.set_state_all(image, SubresourceState::COLOR_ATTACHMENT_WRITE).unwrap();

        let pending = table
            .transition(&[TransitionRequest::image(image, SubresourceRange::WHOLE, SubresourceState::COLOR_ATTACHMENT_WRITE)])
            .unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_infer_image_aspect() {
        assert_eq!(infer_image_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            infer_image_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(infer_image_aspect(vk::Format::B8G8R8A8_SRGB), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn test_journal_rollback_restores_prior_states() {
        let table = ResourceStateTable::new();
        let image = table.register_image(image_desc(1, 2, 1)).unwrap();
        let buffer = table
            .register_buffer(vk::Buffer::from_raw(9), 16, SubresourceState::BUFFER_HOST_WRITE, "ubo")
            .unwrap();

        table.begin_journal();
        table
            .transition(&[TransitionRequest::image(image, SubresourceRange::WHOLE, SubresourceState::DEPTH_ATTACHMENT_WRITE)])
            .unwrap();
        table
            .transition(&[TransitionRequest::image(image, SubresourceRange::mip(0), SubresourceState::SHADER_READ_FRAGMENT)])
            .unwrap();
        table
            .transition(&[TransitionRequest::buffer(buffer, SubresourceState::BUFFER_UNIFORM_FRAGMENT)])
            .unwrap();
        table.set_state_all(image, SubresourceState::PRESENT).unwrap();

        // 2 + 1 + 1 + 2
        assert_eq!(table.rollback_journal(), 6);
        assert_eq!(table.image_state(image, 0, 0).unwrap(), SubresourceState::UNDEFINED);
        assert_eq!(table.image_state(image, 1, 0).unwrap(), SubresourceState::UNDEFINED);
        assert_eq!(table.buffer_state(buffer).unwrap(), SubresourceState::BUFFER_HOST_WRITE);

        // journal 已关闭
        table.set_state_all(image, SubresourceState::PRESENT).unwrap();
        assert_eq!(table.rollback_journal(), 0);
        assert_eq!(table.image_state(image, 0, 0).unwrap(), SubresourceState::PRESENT);
    }

    #[test]
    fn test_journal_commit_keeps_states() {
        let table = ResourceStateTable::new();
        let image = table.register_image(image_desc(1, 1, 1)).unwrap();

        table.begin_journal();
        table
            .transition(&[TransitionRequest::image(image, SubresourceRange::WHOLE, SubresourceState::TRANSFER_DST)])
            .unwrap();
        table.commit_journal();

        assert_eq!(table.rollback_journal(), 0);
        assert_eq!(table.image_state(image, 0, 0).unwrap(), SubresourceState::TRANSFER_DST);
    }

    #[test]
    fn test_journal_skips_unregistered_resources() {
        let table = ResourceStateTable::new();
        let kept = table.register_image(image_desc(1, 1, 1)).unwrap();
        let gone = table.register_image(image_desc(2, 1, 1)).unwrap();

        table.begin_journal();
        table
            .transition(&[
                TransitionRequest::image(kept, SubresourceRange::WHOLE, SubresourceState::TRANSFER_DST),
                TransitionRequest::image(gone, SubresourceRange::WHOLE, SubresourceState::TRANSFER_DST),
            ])
            .unwrap();
        table.unregister(gone).unwrap();

        assert_eq!(table.rollback_journal(), 1);
        assert_eq!(table.image_state(kept, 0, 0).unwrap(), SubresourceState::UNDEFINED);
    }
}
