use ash::vk;

/// GFX 层与渲染核心共用的错误分类
///
/// - `InvalidArgument` / `ResourceExhausted`：局部错误，调用方可以恢复
/// - `DeviceLost`：致命错误，必须一路传播回帧循环，不允许吞掉或重试
#[derive(Debug, thiserror::Error)]
pub enum GfxError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("vulkan call failed: {0}")]
    Vulkan(vk::Result),
}

pub type GfxResult<T> = Result<T, GfxError>;

// new
impl GfxError {
    #[inline]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    #[inline]
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    #[inline]
    pub fn device_lost(msg: impl Into<String>) -> Self {
        Self::DeviceLost(msg.into())
    }
}

// getters
impl GfxError {
    /// 设备丢失之后任何操作都是未定义的
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost(_))
    }
}

impl From<vk::Result> for GfxError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost(format!("{result}")),
            vk::Result::ERROR_OUT_OF_POOL_MEMORY
            | vk::Result::ERROR_FRAGMENTED_POOL
            | vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS => Self::ResourceExhausted(format!("{result}")),
            other => Self::Vulkan(other),
        }
    }
}
