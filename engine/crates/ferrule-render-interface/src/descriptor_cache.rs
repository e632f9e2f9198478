//! 按内容哈希去重的 descriptor set 缓存
//!
//! 相同 layout + 相同 binding 序列只分配一次 descriptor set。条目在 context
//! 生命周期内不会被淘汰，pool 大小需要按场景预留。
//!
//! 条目保存完整的 layout 与 binding 序列，命中时逐项比较；哈希碰撞的请求
//! 会得到一个不进缓存的新 set，不会拿到别人的 set。

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ash::vk::{self, Handle};
use dashmap::{DashMap, mapref::entry::Entry};
use ferrule_gfx::{
    descriptors::{GfxDescriptorBinding, GfxDescriptorResource},
    device::GfxDevice,
    error::GfxResult,
};

/// 缓存中的一项
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorCacheEntry {
    pub hash: u64,
    pub descriptor_set: vk::DescriptorSet,
    pub layout: vk::DescriptorSetLayout,
    pub bindings: Vec<GfxDescriptorBinding>,
}

impl DescriptorCacheEntry {
    #[inline]
    fn matches(&self, layout: vk::DescriptorSetLayout, bindings: &[GfxDescriptorBinding]) -> bool {
        self.layout == layout && self.bindings == bindings
    }
}

#[inline]
fn hash_combine(seed: u64, value: u64) -> u64 {
    seed ^ value.wrapping_add(0x9e3779b9).wrapping_add(seed << 6).wrapping_add(seed >> 2)
}

pub struct DescriptorSetCache {
    device: Arc<dyn GfxDevice>,
    pool: vk::DescriptorPool,

    entries: DashMap<u64, DescriptorCacheEntry>,
    /// 通过 get_or_create 实际分配的次数，包括碰撞时不进缓存的分配
    allocations: AtomicUsize,
    collisions: AtomicUsize,
}

// new & init
impl DescriptorSetCache {
    pub fn new(device: Arc<dyn GfxDevice>, max_sets: u32, pool_sizes: &[vk::DescriptorPoolSize]) -> GfxResult<Self> {
        let pool = device.create_descriptor_pool(max_sets, pool_sizes, "descriptor-cache")?;
        log::info!("descriptor cache created: max sets {max_sets}");
        Ok(Self {
            device,
            pool,
            entries: DashMap::new(),
            allocations: AtomicUsize::new(0),
            collisions: AtomicUsize::new(0),
        })
    }
}

// getters
impl DescriptorSetCache {
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }

    /// 哈希相同但内容不同的请求次数
    #[inline]
    pub fn collision_count(&self) -> usize {
        self.collisions.load(Ordering::Acquire)
    }

    #[inline]
    pub fn pool(&self) -> vk::DescriptorPool {
        self.pool
    }
}

// tools
impl DescriptorSetCache {
    /// 按顺序折叠 layout 和每个 binding 的内容
    ///
    /// 顺序敏感：同样的 binding 换一个顺序会得到不同的哈希
    pub fn hash_bindings(layout: vk::DescriptorSetLayout, bindings: &[GfxDescriptorBinding]) -> u64 {
        let mut seed = hash_combine(0, layout.as_raw());
        for binding in bindings {
            seed = hash_combine(seed, binding.binding as u64);
            seed = hash_combine(seed, binding.descriptor_type.as_raw() as u64);
            match binding.resource {
                GfxDescriptorResource::Buffer { buffer, offset, range } => {
                    seed = hash_combine(seed, buffer.as_raw());
                    seed = hash_combine(seed, offset);
                    seed = hash_combine(seed, range);
                }
                GfxDescriptorResource::Image {
                    image_view,
                    sampler,
                    layout,
                } => {
                    seed = hash_combine(seed, image_view.as_raw());
                    seed = hash_combine(seed, sampler.as_raw());
                    seed = hash_combine(seed, layout.as_raw() as u64);
                }
            }
        }
        seed
    }

    pub fn get(&self, hash: u64) -> Option<vk::DescriptorSet> {
        self.entries.get(&hash).map(|entry| entry.descriptor_set)
    }

    /// 不存在时插入，返回是否插入成功
    pub fn add(&self, entry: DescriptorCacheEntry) -> bool {
        match self.entries.entry(entry.hash) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        }
    }

    /// 命中时直接返回；未命中时分配并写入一个新的 set
    ///
    /// 分配发生在 map 分片的写锁内，并发请求同一内容的线程只会分配一次。
    /// pool 耗尽返回 `ResourceExhausted`，不会自动扩容。
    pub fn get_or_create(
        &self,
        layout: vk::DescriptorSetLayout,
        bindings: &[GfxDescriptorBinding],
    ) -> GfxResult<vk::DescriptorSet> {
        let hash = Self::hash_bindings(layout, bindings);
        if let Some(entry) = self.entries.get(&hash)
            && entry.matches(layout, bindings)
        {
            return Ok(entry.descriptor_set);
        }

        match self.entries.entry(hash) {
            Entry::Occupied(occupied) => {
                if occupied.get().matches(layout, bindings) {
                    return Ok(occupied.get().descriptor_set);
                }
                // 碰撞：保留原条目，这次分配的 set 不进缓存
                drop(occupied);
                self.collisions.fetch_add(1, Ordering::AcqRel);
                log::warn!("descriptor hash collision on {hash:#018x}, allocating an uncached set");
                self.allocate(layout, bindings)
            }
            Entry::Vacant(vacant) => {
                let descriptor_set = self.allocate(layout, bindings)?;
                log::debug!("descriptor set allocated for hash {hash:#018x} ({} bindings)", bindings.len());
                vacant.insert(DescriptorCacheEntry {
                    hash,
                    descriptor_set,
                    layout,
                    bindings: bindings.to_vec(),
                });
                Ok(descriptor_set)
            }
        }
    }

    fn allocate(&self, layout: vk::DescriptorSetLayout, bindings: &[GfxDescriptorBinding]) -> GfxResult<vk::DescriptorSet> {
        let _span = tracy_client::span!("DescriptorSetCache::allocate");
        let descriptor_set = self.device.allocate_descriptor_set(self.pool, layout)?;
        self.device.update_descriptor_set(descriptor_set, bindings);
        self.allocations.fetch_add(1, Ordering::AcqRel);
        Ok(descriptor_set)
    }
}

// destroy
impl DescriptorSetCache {
    /// 随 pool 一起释放所有 set
    pub fn destroy(&self) {
        self.entries.clear();
        self.device.destroy_descriptor_pool(self.pool);
    }
}
