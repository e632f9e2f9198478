pub struct FrameCounter {
    /// 当前的帧序号，一直累加
    frame_id: u64,
    frames_in_flight: usize,
}
// new & init
impl FrameCounter {
    pub fn new(init_frame_id: u64, frames_in_flight: usize) -> Self {
        Self {
            frame_id: init_frame_id,
            frames_in_flight: frames_in_flight.max(1),
        }
    }
}
// update
impl FrameCounter {
    #[inline]
    pub fn next_frame(&mut self) {
        self.frame_id = self.frame_id.wrapping_add(1);
    }
}
// getters
impl FrameCounter {
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// 当前帧使用的 frame slot
    #[inline]
    pub fn frame_index(&self) -> usize {
        (self.frame_id % self.frames_in_flight as u64) as usize
    }

    /// A, B, C...
    #[inline]
    pub fn frame_label(&self) -> char {
        char::from_u32('A' as u32 + (self.frame_index() % 26) as u32).unwrap_or('?')
    }

    #[inline]
    pub fn frame_name(&self) -> String {
        format!("[F{}{}]", self.frame_id, self.frame_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_index_wraps() {
        let mut counter = FrameCounter::new(0, 3);
        let indices = (0..7)
            .map(|_| {
                let index = counter.frame_index();
                counter.next_frame();
                index
            })
            .collect::<Vec<_>>();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(counter.frame_id(), 7);
    }

    #[test]
    fn test_frame_name() {
        let counter = FrameCounter::new(4, 3);
        assert_eq!(counter.frame_label(), 'B');
        assert_eq!(counter.frame_name(), "[F4B]");
    }
}
