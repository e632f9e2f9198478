//! Queue 注册表
//!
//! 启动时按能力把各个角色（graphics、present、transfer 以及自定义角色）解析到具体的 queue，
//! 之后映射不再变化。解析时优先复用已经被其他角色选中的 queue，以减少一帧内参与的
//! queue 数量：每多一个 queue 边界就需要一次显式的 semaphore 交接。

use std::{collections::HashMap, fmt, sync::Arc};

use ash::vk;
use bitflags::bitflags;
use ferrule_gfx::{
    basic::color::LabelColor,
    commands::{fence::GfxFence, submit_info::GfxSubmitInfo},
    device::GfxDevice,
    error::GfxResult,
    queue_family::GfxQueueFamily,
};
use itertools::Itertools;
use parking_lot::Mutex;

bitflags! {
    /// 某个 queue 的能力
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct QueueCapabilities: u32 {
        const GRAPHICS = 1;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
        const PRESENT = 1 << 3;
    }
}

impl QueueCapabilities {
    /// graphics / compute queue 隐式支持 transfer
    pub fn from_family(family: &GfxQueueFamily) -> Self {
        let mut caps = Self::empty();
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            caps |= Self::GRAPHICS | Self::TRANSFER;
        }
        if family.queue_flags.contains(vk::QueueFlags::COMPUTE) {
            caps |= Self::COMPUTE | Self::TRANSFER;
        }
        if family.queue_flags.contains(vk::QueueFlags::TRANSFER) {
            caps |= Self::TRANSFER;
        }
        if family.present_supported {
            caps |= Self::PRESENT;
        }
        caps
    }
}

/// 使用 queue 的角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Compute,
    Transfer,
    Present,
    /// 自定义角色，例如 "shadow"
    Named(&'static str),
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graphics => write!(f, "graphics"),
            Self::Compute => write!(f, "compute"),
            Self::Transfer => write!(f, "transfer"),
            Self::Present => write!(f, "present"),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

/// 解析完成的 queue
///
/// 同一个 queue 的提交需要外部同步，这里用一把提交锁保证。
pub struct GfxQueue {
    vk_queue: vk::Queue,
    family: GfxQueueFamily,
    queue_index: u32,
    capabilities: QueueCapabilities,
    shared_with: Vec<QueueRole>,

    submit_lock: Mutex<()>,
}
// getters
impl GfxQueue {
    #[inline]
    pub fn handle(&self) -> vk::Queue {
        self.vk_queue
    }

    #[inline]
    pub fn family(&self) -> &GfxQueueFamily {
        &self.family
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.family.queue_family_index
    }

    #[inline]
    pub fn queue_index(&self) -> u32 {
        self.queue_index
    }

    #[inline]
    pub fn capabilities(&self) -> QueueCapabilities {
        self.capabilities
    }

    /// 解析到这个 queue 上的所有角色
    #[inline]
    pub fn shared_with(&self) -> &[QueueRole] {
        &self.shared_with
    }
}
// tools
impl GfxQueue {
    pub fn submit(&self, device: &dyn GfxDevice, batches: &[GfxSubmitInfo], fence: Option<&GfxFence>) -> GfxResult<()> {
        let _guard = self.submit_lock.lock();
        device.queue_submit(self.vk_queue, batches, fence.map_or(vk::Fence::null(), |f| f.handle()))
    }

    /// 提交包在一个 queue debug region 里，region 与提交在同一把锁内完成
    pub fn submit_in_region(
        &self,
        device: &dyn GfxDevice,
        region: &str,
        batches: &[GfxSubmitInfo],
        fence: Option<&GfxFence>,
    ) -> GfxResult<()> {
        let _guard = self.submit_lock.lock();
        device.queue_begin_label(self.vk_queue, region, LabelColor::COLOR_STAGE);
        let result = device.queue_submit(self.vk_queue, batches, fence.map_or(vk::Fence::null(), |f| f.handle()));
        device.queue_end_label(self.vk_queue);
        result
    }

    pub fn insert_label(&self, device: &dyn GfxDevice, label: &str) {
        let _guard = self.submit_lock.lock();
        device.queue_insert_label(self.vk_queue, label, LabelColor::COLOR_CMD);
    }

    pub fn wait_idle(&self, device: &dyn GfxDevice) -> GfxResult<()> {
        let _guard = self.submit_lock.lock();
        device.queue_wait_idle(self.vk_queue)
    }
}

struct QueueCandidate {
    family: GfxQueueFamily,
    queue_index: u32,
    capabilities: QueueCapabilities,
    roles: Vec<QueueRole>,
}

/// 启动阶段使用的可变构建器
pub struct QueueRegistryBuilder<'a> {
    device: &'a dyn GfxDevice,
    candidates: Vec<QueueCandidate>,
    roles: HashMap<QueueRole, usize>,
}

// new & init
impl<'a> QueueRegistryBuilder<'a> {
    /// 每个 family 中的每个 queue 都是一个候选
    pub fn new(device: &'a dyn GfxDevice) -> Self {
        let candidates = device
            .queue_families()
            .iter()
            .flat_map(|family| {
                (0..family.queue_count).map(move |queue_index| QueueCandidate {
                    family: family.clone(),
                    queue_index,
                    capabilities: QueueCapabilities::from_family(family),
                    roles: vec![],
                })
            })
            .collect_vec();

        Self {
            device,
            candidates,
            roles: HashMap::new(),
        }
    }
}

// tools
impl QueueRegistryBuilder<'_> {
    /// 为 `role` 选择一个具备 `capabilities` 的 queue，找不到返回 `None`
    ///
    /// `min_count` 过滤掉 queue 数量少于它的 family。选择顺序：
    /// 1. 还没有被任何角色选中、能力恰好等于 `capabilities` 的 queue
    /// 2. 已经被 `preferred_shared_with` 中某个角色选中的 queue
    /// 3. 任意具备该能力的 queue
    ///
    /// 同一个角色重复解析时直接返回之前的结果。
    pub fn resolve(
        &mut self,
        role: QueueRole,
        capabilities: QueueCapabilities,
        min_count: u32,
        preferred_shared_with: &[QueueRole],
    ) -> Option<(u32, u32)> {
        if let Some(&index) = self.roles.get(&role) {
            let candidate = &self.candidates[index];
            return Some((candidate.family.queue_family_index, candidate.queue_index));
        }

        let eligible = |c: &QueueCandidate| c.capabilities.contains(capabilities) && c.family.queue_count >= min_count;

        let exclusive = self.candidates.iter().position(|c| eligible(c) && c.roles.is_empty() && c.capabilities == capabilities);
        let shared = || {
            self.candidates
                .iter()
                .position(|c| eligible(c) && c.roles.iter().any(|r| preferred_shared_with.contains(r)))
        };
        let any = || self.candidates.iter().position(|c| eligible(c));

        let index = exclusive.or_else(shared).or_else(any)?;
        let candidate = &mut self.candidates[index];
        candidate.roles.push(role);
        self.roles.insert(role, index);

        log::info!(
            "queue role {role} -> {}#{} (family {}, shared with [{}])",
            candidate.family.name,
            candidate.queue_index,
            candidate.family.queue_family_index,
            candidate.roles.iter().join(", ")
        );
        Some((candidate.family.queue_family_index, candidate.queue_index))
    }

    /// 冻结映射，之后只读
    pub fn build(self) -> QueueRegistry {
        let mut queues = Vec::new();
        let mut candidate_to_queue = HashMap::new();
        for (candidate_index, candidate) in self.candidates.into_iter().enumerate() {
            if candidate.roles.is_empty() {
                continue;
            }
            candidate_to_queue.insert(candidate_index, queues.len());
            queues.push(Arc::new(GfxQueue {
                vk_queue: self.device.get_queue(candidate.family.queue_family_index, candidate.queue_index),
                family: candidate.family,
                queue_index: candidate.queue_index,
                capabilities: candidate.capabilities,
                shared_with: candidate.roles,
                submit_lock: Mutex::new(()),
            }));
        }

        let roles = self
            .roles
            .into_iter()
            .filter_map(|(role, candidate_index)| Some((role, *candidate_to_queue.get(&candidate_index)?)))
            .collect();
        QueueRegistry { queues, roles }
    }
}

/// 只读的 queue 映射
pub struct QueueRegistry {
    queues: Vec<Arc<GfxQueue>>,
    roles: HashMap<QueueRole, usize>,
}

// getters
impl QueueRegistry {
    #[inline]
    pub fn queue(&self, role: QueueRole) -> Option<&Arc<GfxQueue>> {
        self.roles.get(&role).map(|&index| &self.queues[index])
    }

    /// 所有被选中的 queue，每个只出现一次
    #[inline]
    pub fn queues(&self) -> &[Arc<GfxQueue>] {
        &self.queues
    }

    /// 被使用到的 queue family，去重并排序
    pub fn queue_family_indices(&self) -> Vec<u32> {
        self.queues.iter().map(|q| q.queue_family_index()).sorted().dedup().collect()
    }
}

#[cfg(test)]
mod tests {
    use ferrule_gfx::headless::{HeadlessDevice, HeadlessDeviceDesc, HeadlessEvent};

    use super::*;

    /// family 0：graphics + compute + transfer + present，2 个 queue
    /// family 1：compute + transfer，1 个 queue
    /// family 2：transfer，1 个 queue
    fn device() -> HeadlessDevice {
        HeadlessDevice::new(HeadlessDeviceDesc {
            queue_families: vec![
                GfxQueueFamily::new(
                    "graphics",
                    0,
                    vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                    2,
                    true,
                ),
                GfxQueueFamily::new("compute", 1, vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 1, false),
                GfxQueueFamily::new("transfer", 2, vk::QueueFlags::TRANSFER, 1, false),
            ],
            ..Default::default()
        })
    }

    const ALL: QueueCapabilities = QueueCapabilities::all();

    #[test]
    fn test_exclusive_exact_match_first() {
        let device = device();
        let mut builder = QueueRegistryBuilder::new(&device);

        assert_eq!(builder.resolve(QueueRole::Graphics, ALL, 1, &[]), Some((0, 0)));
        // 独立的 transfer family 能力恰好匹配
        assert_eq!(builder.resolve(QueueRole::Transfer, QueueCapabilities::TRANSFER, 1, &[QueueRole::Graphics]), Some((2, 0)));
        assert_eq!(
            builder.resolve(QueueRole::Compute, QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER, 1, &[]),
            Some((1, 0))
        );
    }

    #[test]
    fn test_prefers_queue_shared_with_role() {
        let device = device();
        let mut builder = QueueRegistryBuilder::new(&device);
        builder.resolve(QueueRole::Graphics, ALL, 1, &[]);

        // 没有能力恰好是 PRESENT 的 queue，复用 graphics，而不是 family 0 的第二个 queue
        let present = builder.resolve(QueueRole::Present, QueueCapabilities::PRESENT, 1, &[QueueRole::Graphics]);
        assert_eq!(present, Some((0, 0)));

        let registry = builder.build();
        let graphics = registry.queue(QueueRole::Graphics).unwrap();
        assert!(Arc::ptr_eq(graphics, registry.queue(QueueRole::Present).unwrap()));
        assert_eq!(graphics.shared_with(), &[QueueRole::Graphics, QueueRole::Present]);
        assert_eq!(registry.queues().len(), 1);
    }

    #[test]
    fn test_falls_back_to_any_capable_queue() {
        let device = device();
        let mut builder = QueueRegistryBuilder::new(&device);

        // 没有偏好，也没有恰好匹配的 queue：选第一个具备能力的
        let shadow = builder.resolve(QueueRole::Named("shadow"), QueueCapabilities::GRAPHICS, 1, &[]);
        assert_eq!(shadow, Some((0, 0)));
        assert!(builder.resolve(QueueRole::Named("missing"), QueueCapabilities::PRESENT | QueueCapabilities::COMPUTE, 3, &[]).is_none());
    }

    #[test]
    fn test_min_count_filters_families() {
        let device = device();
        let mut builder = QueueRegistryBuilder::new(&device);

        // 只有 family 0 有 2 个 queue
        assert_eq!(builder.resolve(QueueRole::Transfer, QueueCapabilities::TRANSFER, 2, &[]), Some((0, 0)));
    }

    #[test]
    fn test_registry_families_and_repeat_resolve() {
        let device = device();
        let mut builder = QueueRegistryBuilder::new(&device);
        builder.resolve(QueueRole::Graphics, ALL, 1, &[]);
        builder.resolve(QueueRole::Transfer, QueueCapabilities::TRANSFER, 1, &[]);
        assert_eq!(builder.resolve(QueueRole::Graphics, QueueCapabilities::TRANSFER, 1, &[]), Some((0, 0)));

        let registry = builder.build();
        assert_eq!(registry.queue_family_indices(), vec![0, 2]);
        assert!(registry.queue(QueueRole::Compute).is_none());
    }

    #[test]
    fn test_submit_in_region_wraps_submit() {
        let device = device();
        let mut builder = QueueRegistryBuilder::new(&device);
        builder.resolve(QueueRole::Graphics, ALL, 1, &[]);
        let registry = builder.build();
        let graphics = registry.queue(QueueRole::Graphics).unwrap();

        graphics.submit_in_region(&device, "[F0A]shadow+main", &[GfxSubmitInfo::default()], None).unwrap();
        graphics.wait_idle(&device).unwrap();

        let queue = graphics.handle();
        let events = device.events();
        assert_eq!(
            events[0],
            HeadlessEvent::QueueBeginLabel {
                queue,
                label: "[F0A]shadow+main".to_string()
            }
        );
        assert!(matches!(events[1], HeadlessEvent::Submit { queue: q, .. } if q == queue));
        assert_eq!(events[2], HeadlessEvent::QueueEndLabel { queue });
        assert_eq!(events[3], HeadlessEvent::QueueWaitIdle { queue });
    }

    #[test]
    fn test_failed_submit_still_closes_region() {
        let device = device();
        let mut builder = QueueRegistryBuilder::new(&device);
        builder.resolve(QueueRole::Graphics, ALL, 1, &[]);
        let registry = builder.build();
        let graphics = registry.queue(QueueRole::Graphics).unwrap();

        device.fail_submit_after(0);
        assert!(graphics.submit_in_region(&device, "region", &[], None).is_err());
        assert_eq!(device.events().last(), Some(&HeadlessEvent::QueueEndLabel { queue: graphics.handle() }));
    }
}
