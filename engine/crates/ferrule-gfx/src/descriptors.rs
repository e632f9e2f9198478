use ash::vk;

/// 绑定到 descriptor 上的资源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GfxDescriptorResource {
    Buffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    Image {
        image_view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

/// 一个 binding 的完整描述：binding 序号 + descriptor 类型 + 资源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GfxDescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub resource: GfxDescriptorResource,
}

// new
impl GfxDescriptorBinding {
    #[inline]
    pub fn uniform_buffer(binding: u32, buffer: vk::Buffer, offset: vk::DeviceSize, range: vk::DeviceSize) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            resource: GfxDescriptorResource::Buffer { buffer, offset, range },
        }
    }

    #[inline]
    pub fn storage_buffer(binding: u32, buffer: vk::Buffer, offset: vk::DeviceSize, range: vk::DeviceSize) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            resource: GfxDescriptorResource::Buffer { buffer, offset, range },
        }
    }

    #[inline]
    pub fn combined_image_sampler(binding: u32, image_view: vk::ImageView, sampler: vk::Sampler) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            resource: GfxDescriptorResource::Image {
                image_view,
                sampler,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        }
    }

    #[inline]
    pub fn storage_image(binding: u32, image_view: vk::ImageView) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
            resource: GfxDescriptorResource::Image {
                image_view,
                sampler: vk::Sampler::null(),
                layout: vk::ImageLayout::GENERAL,
            },
        }
    }
}
