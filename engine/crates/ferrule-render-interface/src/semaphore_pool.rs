//! 每个 frame slot 一组可复用的 binary semaphore
//!
//! 只有在该 slot 的 fence signal 之后才能 reclaim，否则 GPU 可能仍在等待这些 semaphore。

use std::sync::Arc;

use ferrule_gfx::{
    commands::semaphore::GfxSemaphore,
    device::GfxDevice,
    error::{GfxError, GfxResult},
};
use parking_lot::Mutex;

#[derive(Default)]
struct SlotSemaphores {
    available: Vec<GfxSemaphore>,
    in_use: Vec<GfxSemaphore>,
}

pub struct FrameSemaphorePool {
    device: Arc<dyn GfxDevice>,
    slots: Mutex<Vec<SlotSemaphores>>,
}

// new & init
impl FrameSemaphorePool {
    pub fn new(device: Arc<dyn GfxDevice>, frames_in_flight: usize) -> Self {
        Self {
            device,
            slots: Mutex::new((0..frames_in_flight).map(|_| SlotSemaphores::default()).collect()),
        }
    }
}

// tools
impl FrameSemaphorePool {
    /// 取出一个 semaphore 并标记为 in-use，slot 为空时新建
    pub fn acquire(&self, frame_index: usize) -> GfxResult<GfxSemaphore> {
        let mut slots = self.slots.lock();
        let frames_in_flight = slots.len();
        let slot = slots.get_mut(frame_index).ok_or_else(|| {
            GfxError::invalid_argument(format!("frame index {frame_index} out of range (frames in flight: {frames_in_flight})"))
        })?;

        let semaphore = match slot.available.pop() {
            Some(semaphore) => semaphore,
            None => {
                let name = format!("frame-{frame_index}-semaphore-{}", slot.in_use.len());
                log::debug!("create semaphore {name}");
                GfxSemaphore::new(self.device.as_ref(), &name)?
            }
        };
        slot.in_use.push(semaphore);
        Ok(semaphore)
    }

    /// 把该 slot 所有 in-use 的 semaphore 放回可用列表
    ///
    /// 调用方保证该 slot 的 fence 已经 signal
    pub fn reclaim(&self, frame_index: usize) -> GfxResult<()> {
        let mut slots = self.slots.lock();
        let frames_in_flight = slots.len();
        let slot = slots.get_mut(frame_index).ok_or_else(|| {
            GfxError::invalid_argument(format!("frame index {frame_index} out of range (frames in flight: {frames_in_flight})"))
        })?;

        let SlotSemaphores { available, in_use } = slot;
        available.append(in_use);
        Ok(())
    }
}

// getters
impl FrameSemaphorePool {
    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn available_count(&self, frame_index: usize) -> usize {
        self.slots.lock().get(frame_index).map_or(0, |slot| slot.available.len())
    }

    pub fn in_use_count(&self, frame_index: usize) -> usize {
        self.slots.lock().get(frame_index).map_or(0, |slot| slot.in_use.len())
    }
}

// destroy
impl FrameSemaphorePool {
    /// 调用前需要等待所有 slot 的 fence
    pub fn destroy(&self) {
        let mut slots = self.slots.lock();
        let mut count = 0;
        for slot in slots.iter_mut() {
            for semaphore in slot.available.drain(..).chain(slot.in_use.drain(..)) {
                semaphore.destroy(self.device.as_ref());
                count += 1;
            }
        }
        log::info!("destroyed {count} frame semaphores");
    }
}

#[cfg(test)]
mod tests {
    use ferrule_gfx::headless::{HeadlessDevice, HeadlessDeviceDesc};

    use super::*;

    fn pool(max_semaphores: Option<usize>) -> (Arc<HeadlessDevice>, FrameSemaphorePool) {
        let device = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc {
            max_semaphores,
            ..Default::default()
        }));
        let pool = FrameSemaphorePool::new(device.clone(), 3);
        (device, pool)
    }

    #[test]
    fn test_acquire_then_reclaim_conserves_semaphores() {
        let (device, pool) = pool(None);

        let first = (0..4).map(|_| pool.acquire(1).unwrap()).collect::<Vec<_>>();
        assert_eq!(pool.in_use_count(1), 4);
        assert_eq!(pool.available_count(1), 0);

        pool.reclaim(1).unwrap();
        assert_eq!(pool.in_use_count(1), 0);
        assert_eq!(pool.available_count(1), 4);

        // 多个帧循环之后不会新建，也不会丢失
        for _ in 0..5 {
            let again = (0..4).map(|_| pool.acquire(1).unwrap()).collect::<Vec<_>>();
            assert!(again.iter().all(|s| first.contains(s)));
            pool.reclaim(1).unwrap();
        }
        assert_eq!(device.live_semaphore_count(), 4);
        assert_eq!(pool.available_count(1), 4);
    }

    #[test]
    fn test_slots_are_independent() {
        let (_device, pool) = pool(None);
        let a = pool.acquire(0).unwrap();
        pool.acquire(2).unwrap();
        pool.reclaim(2).unwrap();

        assert_eq!(pool.in_use_count(0), 1);
        assert_eq!(pool.available_count(2), 1);
        assert_ne!(pool.acquire(2).unwrap(), a);
    }

    #[test]
    fn test_out_of_range_frame_index() {
        let (_device, pool) = pool(None);
        assert!(matches!(pool.acquire(3), Err(GfxError::InvalidArgument(_))));
        assert!(matches!(pool.reclaim(7), Err(GfxError::InvalidArgument(_))));
    }

    #[test]
    fn test_creation_failure_is_resource_exhausted() {
        let (_device, pool) = pool(Some(2));
        pool.acquire(0).unwrap();
        pool.acquire(0).unwrap();
        assert!(matches!(pool.acquire(0), Err(GfxError::ResourceExhausted(_))));
        assert_eq!(pool.in_use_count(0), 2);
    }

    #[test]
    fn test_destroy_releases_everything() {
        let (device, pool) = pool(None);
        pool.acquire(0).unwrap();
        pool.acquire(1).unwrap();
        pool.reclaim(1).unwrap();
        pool.destroy();
        assert_eq!(device.live_semaphore_count(), 0);
        assert_eq!(pool.available_count(1), 0);
    }
}
