use ash::vk;

/// 由设备初始化方提供的 queue family 描述
#[derive(Clone, Debug)]
pub struct GfxQueueFamily {
    pub name: String,
    pub queue_family_index: u32,
    pub queue_flags: vk::QueueFlags,
    pub queue_count: u32,
    /// 是否支持向 surface present，没有 surface 时为 false
    pub present_supported: bool,
}

impl GfxQueueFamily {
    pub fn new(
        name: impl Into<String>,
        queue_family_index: u32,
        queue_flags: vk::QueueFlags,
        queue_count: u32,
        present_supported: bool,
    ) -> Self {
        Self {
            name: name.into(),
            queue_family_index,
            queue_flags,
            queue_count,
            present_supported,
        }
    }
}
