//! 子资源状态定义
//!
//! 封装 Vulkan 的 image layout、pipeline stage、access mask 以及所属的 queue family，
//! 提供预定义的常用状态组合。

use ash::vk;
use ferrule_gfx::error::{GfxError, GfxResult};

/// 一个子资源（image 的某个 layer 的某个 mip，或整个 buffer）的状态
///
/// buffer 的 layout 始终是 `UNDEFINED`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubresourceState {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    /// 拥有该资源的 queue family；`QUEUE_FAMILY_IGNORED` 表示不关心所有权
    pub queue_family: u32,
}

impl Default for SubresourceState {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

const DEPTH_TESTS: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw() | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
);

// new & init
impl SubresourceState {
    #[inline]
    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2, layout: vk::ImageLayout) -> Self {
        Self {
            layout,
            stage,
            access,
            queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    /// image 状态，参数按 layout 在前的顺序给出
    #[inline]
    pub const fn image(layout: vk::ImageLayout, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self::new(stage, access, layout)
    }

    /// buffer 没有 layout
    #[inline]
    pub const fn buffer(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self::new(stage, access, vk::ImageLayout::UNDEFINED)
    }

    #[inline]
    pub const fn on_queue_family(mut self, queue_family: u32) -> Self {
        self.queue_family = queue_family;
        self
    }
}
// 常用状态
impl SubresourceState {
    /// 资源刚创建，内容可以丢弃
    pub const UNDEFINED: Self = Self::image(
        vk::ImageLayout::UNDEFINED,
        vk::PipelineStageFlags2::TOP_OF_PIPE,
        vk::AccessFlags2::NONE,
    );

    /// shadow / gbuffer 等 pass 的颜色输出
    pub const COLOR_ATTACHMENT_WRITE: Self = Self::image(
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    );

    /// shadow map 写入
    pub const DEPTH_ATTACHMENT_WRITE: Self = Self::image(
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        DEPTH_TESTS,
        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
    );

    /// 在 fragment shader 中采样
    pub const SHADER_READ_FRAGMENT: Self = Self::image(
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::PipelineStageFlags2::FRAGMENT_SHADER,
        vk::AccessFlags2::SHADER_SAMPLED_READ,
    );

    pub const TRANSFER_SRC: Self = Self::image(
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_READ,
    );

    pub const TRANSFER_DST: Self = Self::image(
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
    );

    /// 交给 present 的 swapchain image
    pub const PRESENT: Self = Self::image(
        vk::ImageLayout::PRESENT_SRC_KHR,
        vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
        vk::AccessFlags2::NONE,
    );

    /// 拷贝队列通过映射内存写入
    pub const BUFFER_HOST_WRITE: Self = Self::buffer(vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_WRITE);
    pub const BUFFER_TRANSFER_DST: Self =
        Self::buffer(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE);
    pub const BUFFER_VERTEX: Self =
        Self::buffer(vk::PipelineStageFlags2::VERTEX_INPUT, vk::AccessFlags2::VERTEX_ATTRIBUTE_READ);
    pub const BUFFER_UNIFORM_FRAGMENT: Self =
        Self::buffer(vk::PipelineStageFlags2::FRAGMENT_SHADER, vk::AccessFlags2::UNIFORM_READ);
}
// tools
impl SubresourceState {
    /// 所有会产生写入的 access 位
    const WRITE_ACCESS: vk::AccessFlags2 = {
        const WRITES: [vk::AccessFlags2; 7] = [
            vk::AccessFlags2::SHADER_WRITE,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::AccessFlags2::HOST_WRITE,
            vk::AccessFlags2::MEMORY_WRITE,
        ];
        let mut raw = 0;
        let mut i = 0;
        while i < WRITES.len() {
            raw |= WRITES[i].as_raw();
            i += 1;
        }
        vk::AccessFlags2::from_raw(raw)
    };

    #[inline]
    pub fn is_write(&self) -> bool {
        !(self.access & Self::WRITE_ACCESS).is_empty()
    }

    /// 用于 barrier src 的 access：只有写操作需要 make available
    #[inline]
    pub fn src_access(&self) -> vk::AccessFlags2 {
        self.access & Self::WRITE_ACCESS
    }

    /// 把目标状态中未指定的 queue family 替换为当前的所有者
    #[inline]
    pub(crate) fn resolve_queue_family(self, current: &SubresourceState) -> Self {
        if self.queue_family == vk::QUEUE_FAMILY_IGNORED {
            self.on_queue_family(current.queue_family)
        } else {
            self
        }
    }

    /// 两边都是具体的 family 且不同时，才需要所有权转移
    #[inline]
    pub(crate) fn ownership_transfer(from: &SubresourceState, to: &SubresourceState) -> Option<(u32, u32)> {
        let concrete = |f: u32| f != vk::QUEUE_FAMILY_IGNORED;
        (concrete(from.queue_family) && concrete(to.queue_family) && from.queue_family != to.queue_family)
            .then_some((from.queue_family, to.queue_family))
    }
}

/// image 的子资源范围
///
/// count 为 0 表示从 base 开始一直到资源末尾；全部为 0 即整个资源。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

/// 按资源实际大小展开后的范围，count 一定大于 0
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ResolvedRange {
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    /// 整个资源
    pub const WHOLE: Self = Self {
        base_mip_level: 0,
        level_count: 0,
        base_array_layer: 0,
        layer_count: 0,
    };

    #[inline]
    pub const fn new(base_mip_level: u32, level_count: u32, base_array_layer: u32, layer_count: u32) -> Self {
        Self {
            base_mip_level,
            level_count,
            base_array_layer,
            layer_count,
        }
    }

    /// 所有 layer 上的单个 mip
    #[inline]
    pub const fn mip(mip_level: u32) -> Self {
        Self::new(mip_level, 1, 0, 0)
    }

    /// 展开为具体范围，越界时返回 `InvalidArgument`
    pub(crate) fn resolve(&self, mip_levels: u32, array_layers: u32) -> GfxResult<ResolvedRange> {
        let resolve_axis = |base: u32, count: u32, total: u32, axis: &str| -> GfxResult<u32> {
            if base >= total {
                return Err(GfxError::invalid_argument(format!("base {axis} {base} out of range (total {total})")));
            }
            let count = if count == 0 { total - base } else { count };
            if base.checked_add(count).is_none_or(|end| end > total) {
                return Err(GfxError::invalid_argument(format!(
                    "{axis} range [{base}, +{count}) out of range (total {total})"
                )));
            }
            Ok(count)
        };

        let level_count = resolve_axis(self.base_mip_level, self.level_count, mip_levels, "mip")?;
        let layer_count = resolve_axis(self.base_array_layer, self.layer_count, array_layers, "layer")?;
        Ok(ResolvedRange {
            base_mip_level: self.base_mip_level,
            level_count,
            base_array_layer: self.base_array_layer,
            layer_count,
        })
    }
}
