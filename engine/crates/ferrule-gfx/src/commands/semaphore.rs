use ash::vk;

use crate::{device::GfxDevice, error::GfxResult};

/// binary semaphore
///
/// # Destroy
/// 可以 Copy，不实现 Drop，需要手动 destroy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GfxSemaphore {
    semaphore: vk::Semaphore,
}

// 创建与销毁
impl GfxSemaphore {
    pub fn new(device: &dyn GfxDevice, debug_name: &str) -> GfxResult<Self> {
        let semaphore = device.create_semaphore(debug_name)?;
        Ok(Self { semaphore })
    }

    #[inline]
    pub fn destroy(self, device: &dyn GfxDevice) {
        device.destroy_semaphore(self.semaphore);
    }
}

// getters
impl GfxSemaphore {
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}
