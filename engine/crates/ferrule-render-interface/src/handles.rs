use slotmap::{Key, new_key_type};

// 内部 Key，不直接暴露给使用者
new_key_type! {
    /// 状态表中一条资源记录的 Key
    pub struct InnerResourceHandle;
}

/// 指向一个已注册 image 的状态记录
///
/// 默认值是 null handle。资源注销后 handle 失效（代际索引），不会指向新资源。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GfxImageHandle {
    pub(crate) inner: InnerResourceHandle,
}

/// 指向一个已注册 buffer 的状态记录
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GfxBufferHandle {
    pub(crate) inner: InnerResourceHandle,
}

impl GfxImageHandle {
    #[inline]
    pub fn null() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.inner.is_null()
    }
}

impl GfxBufferHandle {
    #[inline]
    pub fn null() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.inner.is_null()
    }
}

/// image 或 buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GfxResourceHandle {
    Image(GfxImageHandle),
    Buffer(GfxBufferHandle),
}

impl GfxResourceHandle {
    #[inline]
    pub(crate) fn inner(&self) -> InnerResourceHandle {
        match self {
            Self::Image(h) => h.inner,
            Self::Buffer(h) => h.inner,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.inner().is_null()
    }
}

impl From<GfxImageHandle> for GfxResourceHandle {
    fn from(handle: GfxImageHandle) -> Self {
        Self::Image(handle)
    }
}

impl From<GfxBufferHandle> for GfxResourceHandle {
    fn from(handle: GfxBufferHandle) -> Self {
        Self::Buffer(handle)
    }
}
