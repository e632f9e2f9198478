use ash::vk;

use crate::{device::GfxDevice, error::GfxResult};

/// # Destroy
/// 不应该实现 Drop，因为可以 Clone，需要手动 destroy
#[derive(Clone, Debug)]
pub struct GfxFence {
    fence: vk::Fence,
}

// 创建与销毁
impl GfxFence {
    /// # param
    /// * signaled - 是否创建时就 signaled
    pub fn new(device: &dyn GfxDevice, signaled: bool, debug_name: &str) -> GfxResult<Self> {
        let fence = device.create_fence(signaled, debug_name)?;
        Ok(Self { fence })
    }

    #[inline]
    pub fn destroy(self, device: &dyn GfxDevice) {
        device.destroy_fence(self.fence);
    }
}

// getters
impl GfxFence {
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

// tools
impl GfxFence {
    /// 阻塞等待 fence，超时返回 `Ok(false)`
    ///
    /// `timeout_ns` 为 `u64::MAX` 时无限等待
    #[inline]
    pub fn wait(&self, device: &dyn GfxDevice, timeout_ns: u64) -> GfxResult<bool> {
        device.wait_fence(self.fence, timeout_ns)
    }

    #[inline]
    pub fn reset(&self, device: &dyn GfxDevice) -> GfxResult<()> {
        device.reset_fence(self.fence)
    }
}
