use ash::vk;

/// barrier 一侧的同步范围
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierScope {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl BarrierScope {
    #[inline]
    pub fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self { stage, access }
    }
}

/// 单个 image 的 sync2 barrier
///
/// 默认覆盖 (mip 0, layer 0)，不做 queue family 所有权转移。
#[derive(Clone, Copy, Debug)]
pub struct GfxImageBarrier {
    inner: vk::ImageMemoryBarrier2<'static>,
}

// new & init
impl GfxImageBarrier {
    pub fn for_image(image: vk::Image, aspect_mask: vk::ImageAspectFlags) -> Self {
        let inner = vk::ImageMemoryBarrier2 {
            image,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::UNDEFINED,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        Self { inner }
    }

    #[inline]
    pub fn layouts(mut self, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        self.inner.old_layout = old_layout;
        self.inner.new_layout = new_layout;
        self
    }

    #[inline]
    pub fn scopes(mut self, src: BarrierScope, dst: BarrierScope) -> Self {
        self.inner.src_stage_mask = src.stage;
        self.inner.src_access_mask = src.access;
        self.inner.dst_stage_mask = dst.stage;
        self.inner.dst_access_mask = dst.access;
        self
    }

    /// `None` 表示不转移所有权
    #[inline]
    pub fn ownership(mut self, families: Option<(u32, u32)>) -> Self {
        let (src, dst) = families.unwrap_or((vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED));
        self.inner.src_queue_family_index = src;
        self.inner.dst_queue_family_index = dst;
        self
    }

    #[inline]
    pub fn mips(mut self, base_mip_level: u32, level_count: u32) -> Self {
        self.inner.subresource_range.base_mip_level = base_mip_level;
        self.inner.subresource_range.level_count = level_count;
        self
    }

    #[inline]
    pub fn layers(mut self, base_array_layer: u32, layer_count: u32) -> Self {
        self.inner.subresource_range.base_array_layer = base_array_layer;
        self.inner.subresource_range.layer_count = layer_count;
        self
    }
}
// getters
impl GfxImageBarrier {
    #[inline]
    pub fn inner(&self) -> &vk::ImageMemoryBarrier2<'static> {
        &self.inner
    }

    #[inline]
    pub fn range(&self) -> vk::ImageSubresourceRange {
        self.inner.subresource_range
    }

    #[inline]
    pub fn is_ownership_transfer(&self) -> bool {
        self.inner.src_queue_family_index != self.inner.dst_queue_family_index
    }
}

/// 整个 buffer 的 sync2 barrier
#[derive(Clone, Copy, Debug)]
pub struct GfxBufferBarrier {
    inner: vk::BufferMemoryBarrier2<'static>,
}

// new & init
impl GfxBufferBarrier {
    pub fn whole(buffer: vk::Buffer) -> Self {
        let inner = vk::BufferMemoryBarrier2 {
            buffer,
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            ..Default::default()
        };
        Self { inner }
    }

    #[inline]
    pub fn scopes(mut self, src: BarrierScope, dst: BarrierScope) -> Self {
        self.inner.src_stage_mask = src.stage;
        self.inner.src_access_mask = src.access;
        self.inner.dst_stage_mask = dst.stage;
        self.inner.dst_access_mask = dst.access;
        self
    }

    #[inline]
    pub fn ownership(mut self, families: Option<(u32, u32)>) -> Self {
        let (src, dst) = families.unwrap_or((vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED));
        self.inner.src_queue_family_index = src;
        self.inner.dst_queue_family_index = dst;
        self
    }
}
// getters
impl GfxBufferBarrier {
    #[inline]
    pub fn inner(&self) -> &vk::BufferMemoryBarrier2<'static> {
        &self.inner
    }

    #[inline]
    pub fn is_ownership_transfer(&self) -> bool {
        self.inner.src_queue_family_index != self.inner.dst_queue_family_index
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;

    #[test]
    fn test_image_barrier_defaults_to_first_subresource() {
        let barrier = GfxImageBarrier::for_image(vk::Image::from_raw(7), vk::ImageAspectFlags::COLOR);
        let range = barrier.range();
        assert_eq!((range.base_mip_level, range.level_count), (0, 1));
        assert_eq!((range.base_array_layer, range.layer_count), (0, 1));
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert!(!barrier.is_ownership_transfer());
    }

    #[test]
    fn test_image_barrier_builder() {
        let src = BarrierScope::new(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE);
        let dst = BarrierScope::new(vk::PipelineStageFlags2::FRAGMENT_SHADER, vk::AccessFlags2::SHADER_READ);
        let barrier = GfxImageBarrier::for_image(vk::Image::from_raw(7), vk::ImageAspectFlags::COLOR)
            .layouts(vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .scopes(src, dst)
            .mips(2, 3)
            .layers(1, 4)
            .ownership(Some((0, 1)));

        let inner = barrier.inner();
        assert_eq!(inner.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(inner.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(inner.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(inner.dst_stage_mask, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert_eq!((barrier.range().base_mip_level, barrier.range().level_count), (2, 3));
        assert_eq!((barrier.range().base_array_layer, barrier.range().layer_count), (1, 4));
        assert!(barrier.is_ownership_transfer());
    }

    #[test]
    fn test_buffer_barrier_covers_whole_buffer() {
        let barrier = GfxBufferBarrier::whole(vk::Buffer::from_raw(3)).ownership(None);
        assert_eq!(barrier.inner().offset, 0);
        assert_eq!(barrier.inner().size, vk::WHOLE_SIZE);
        assert_eq!(barrier.inner().src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert!(!barrier.is_ownership_transfer());
    }
}
