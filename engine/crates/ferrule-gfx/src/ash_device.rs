use std::{collections::HashMap, ffi::CString, sync::Arc};

use ash::vk;
use itertools::Itertools;
use parking_lot::Mutex;
use vk_mem::Alloc;

use crate::{
    commands::submit_info::GfxSubmitInfo,
    descriptors::{GfxDescriptorBinding, GfxDescriptorResource},
    device::{GfxBufferWrite, GfxDevice},
    error::{GfxError, GfxResult},
    queue_family::GfxQueueFamily,
};

/// host-visible buffer 及其 vma 分配
struct AshHostBuffer {
    allocation: vk_mem::Allocation,
    size: vk::DeviceSize,
}

/// 基于 ash + vk-mem 的设备实现
///
/// 接管外部创建的 `ash::Device` 的所有权，在 [`AshDevice::destroy`] 中销毁。
/// 需要 Vulkan 1.3（synchronization2）。
pub struct AshDevice {
    device: ash::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    allocator: vk_mem::Allocator,

    queue_families: Vec<GfxQueueFamily>,

    /// 每个 buffer 单独加锁，不同 buffer 的写入可以并行
    host_buffers: Mutex<HashMap<vk::Buffer, Arc<Mutex<AshHostBuffer>>>>,
}

// new & init
impl AshDevice {
    /// # param
    /// * queue_families - 设备初始化方已经创建好 queue 的 family 列表
    /// * enable_debug_utils - 是否加载 VK_EXT_debug_utils，用于 label 和对象命名
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_families: Vec<GfxQueueFamily>,
        enable_debug_utils: bool,
    ) -> GfxResult<Self> {
        let mut vma_ci = vk_mem::AllocatorCreateInfo::new(instance, &device, physical_device);
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
        let allocator = unsafe { vk_mem::Allocator::new(vma_ci)? };

        let debug_utils = enable_debug_utils.then(|| ash::ext::debug_utils::Device::new(instance, &device));

        log::info!(
            "AshDevice created, queue families: [{}]",
            queue_families.iter().map(|f| format!("{}#{}", f.name, f.queue_family_index)).join(", ")
        );

        Ok(Self {
            device,
            debug_utils,
            allocator,
            queue_families,
            host_buffers: Mutex::new(HashMap::new()),
        })
    }

    pub fn destroy(self) {
        let Self {
            device,
            allocator,
            host_buffers,
            ..
        } = self;

        for (buffer, host_buffer) in host_buffers.into_inner() {
            let mut host_buffer = host_buffer.lock();
            unsafe {
                allocator.destroy_buffer(buffer, &mut host_buffer.allocation);
            }
        }
        // allocator 必须先于 device 销毁
        drop(allocator);
        unsafe {
            device.destroy_device(None);
        }
        log::info!("AshDevice destroyed");
    }
}

// tools
impl AshDevice {
    #[inline]
    pub fn ash_device(&self) -> &ash::Device {
        &self.device
    }

    fn set_debug_name(&self, handle: impl vk::Handle, debug_name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(debug_name) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default().object_handle(handle).object_name(name.as_c_str());
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&name_info) } {
            log::warn!("failed to set debug name {debug_name}: {e}");
        }
    }

    fn label<'a>(name: &'a CString, color: [f32; 4]) -> vk::DebugUtilsLabelEXT<'a> {
        vk::DebugUtilsLabelEXT::default().label_name(name.as_c_str()).color(color)
    }

    fn host_buffer(&self, buffer: vk::Buffer) -> GfxResult<Arc<Mutex<AshHostBuffer>>> {
        self.host_buffers
            .lock()
            .get(&buffer)
            .cloned()
            .ok_or_else(|| GfxError::invalid_argument(format!("buffer {buffer:?} is not a host buffer")))
    }
}

impl GfxDevice for AshDevice {
    fn backend_name(&self) -> &str {
        "vulkan"
    }

    fn queue_families(&self) -> &[GfxQueueFamily] {
        &self.queue_families
    }

    fn get_queue(&self, queue_family_index: u32, queue_index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(queue_family_index, queue_index) }
    }

    fn create_semaphore(&self, debug_name: &str) -> GfxResult<vk::Semaphore> {
        let semaphore = unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
        self.set_debug_name(semaphore, debug_name);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_fence(&self, signaled: bool, debug_name: &str) -> GfxResult<vk::Fence> {
        let fence_flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default().flags(fence_flags), None)? };
        self.set_debug_name(fence, debug_name);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GfxResult<bool> {
        match unsafe { self.device.wait_for_fences(std::slice::from_ref(&fence), true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> GfxResult<()> {
        unsafe { self.device.reset_fences(std::slice::from_ref(&fence))? };
        Ok(())
    }

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
        debug_name: &str,
    ) -> GfxResult<vk::CommandPool> {
        let pool = unsafe {
            self.device.create_command_pool(
                &vk::CommandPoolCreateInfo::default().queue_family_index(queue_family_index).flags(flags),
                None,
            )?
        };
        self.set_debug_name(pool, debug_name);
        Ok(pool)
    }

    fn reset_command_pool(&self, command_pool: vk::CommandPool) -> GfxResult<()> {
        unsafe { self.device.reset_command_pool(command_pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES)? };
        Ok(())
    }

    fn destroy_command_pool(&self, command_pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(command_pool, None) }
    }

    fn allocate_command_buffer(
        &self,
        command_pool: vk::CommandPool,
        debug_name: &str,
    ) -> GfxResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&info)? }
            .into_iter()
            .next()
            .ok_or_else(|| GfxError::resource_exhausted("no command buffer allocated"))?;
        self.set_debug_name(command_buffer, debug_name);
        Ok(command_buffer)
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> GfxResult<()> {
        unsafe {
            self.device.begin_command_buffer(command_buffer, &vk::CommandBufferBeginInfo::default().flags(usage))?;
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
    ) {
        let dependency_info = vk::DependencyInfo::default()
            .image_memory_barriers(image_barriers)
            .buffer_memory_barriers(buffer_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(command_buffer, &dependency_info) }
    }

    fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, label_name: &str, label_color: [f32; 4]) {
        let (Some(debug_utils), Ok(name)) = (&self.debug_utils, CString::new(label_name)) else {
            return;
        };
        unsafe { debug_utils.cmd_begin_debug_utils_label(command_buffer, &Self::label(&name, label_color)) }
    }

    fn cmd_end_label(&self, command_buffer: vk::CommandBuffer) {
        if let Some(debug_utils) = &self.debug_utils {
            unsafe { debug_utils.cmd_end_debug_utils_label(command_buffer) }
        }
    }

    fn cmd_insert_label(&self, command_buffer: vk::CommandBuffer, label_name: &str, label_color: [f32; 4]) {
        let (Some(debug_utils), Ok(name)) = (&self.debug_utils, CString::new(label_name)) else {
            return;
        };
        unsafe { debug_utils.cmd_insert_debug_utils_label(command_buffer, &Self::label(&name, label_color)) }
    }

    fn queue_submit(&self, queue: vk::Queue, batches: &[GfxSubmitInfo], fence: vk::Fence) -> GfxResult<()> {
        // batches 的存在是有必要的，submit_infos 引用的是 batches 的内存
        let submit_infos = batches.iter().map(|b| b.submit_info()).collect_vec();
        unsafe { self.device.queue_submit2(queue, &submit_infos, fence)? };
        Ok(())
    }

    fn queue_begin_label(&self, queue: vk::Queue, label_name: &str, label_color: [f32; 4]) {
        let (Some(debug_utils), Ok(name)) = (&self.debug_utils, CString::new(label_name)) else {
            return;
        };
        unsafe { debug_utils.queue_begin_debug_utils_label(queue, &Self::label(&name, label_color)) }
    }

    fn queue_end_label(&self, queue: vk::Queue) {
        if let Some(debug_utils) = &self.debug_utils {
            unsafe { debug_utils.queue_end_debug_utils_label(queue) }
        }
    }

    fn queue_insert_label(&self, queue: vk::Queue, label_name: &str, label_color: [f32; 4]) {
        let (Some(debug_utils), Ok(name)) = (&self.debug_utils, CString::new(label_name)) else {
            return;
        };
        unsafe { debug_utils.queue_insert_debug_utils_label(queue, &Self::label(&name, label_color)) }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> GfxResult<()> {
        unsafe { self.device.queue_wait_idle(queue)? };
        Ok(())
    }

    fn device_wait_idle(&self) -> GfxResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        debug_name: &str,
    ) -> GfxResult<vk::DescriptorPool> {
        let pool_ci = vk::DescriptorPoolCreateInfo::default().max_sets(max_sets).pool_sizes(pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&pool_ci, None)? };
        self.set_debug_name(pool, debug_name);
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, descriptor_pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(descriptor_pool, None) }
    }

    fn allocate_descriptor_set(
        &self,
        descriptor_pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> GfxResult<vk::DescriptorSet> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(descriptor_pool)
            .set_layouts(std::slice::from_ref(&layout));
        unsafe { self.device.allocate_descriptor_sets(&alloc_info)? }
            .into_iter()
            .next()
            .ok_or_else(|| GfxError::resource_exhausted("no descriptor set allocated"))
    }

    fn update_descriptor_set(&self, descriptor_set: vk::DescriptorSet, bindings: &[GfxDescriptorBinding]) {
        // 先把所有 info 放到稳定的内存里，write 再引用它们
        let buffer_infos = bindings
            .iter()
            .map(|b| match b.resource {
                GfxDescriptorResource::Buffer { buffer, offset, range } => {
                    vk::DescriptorBufferInfo::default().buffer(buffer).offset(offset).range(range)
                }
                GfxDescriptorResource::Image { .. } => vk::DescriptorBufferInfo::default(),
            })
            .collect_vec();
        let image_infos = bindings
            .iter()
            .map(|b| match b.resource {
                GfxDescriptorResource::Image {
                    image_view,
                    sampler,
                    layout,
                } => vk::DescriptorImageInfo::default().image_view(image_view).sampler(sampler).image_layout(layout),
                GfxDescriptorResource::Buffer { .. } => vk::DescriptorImageInfo::default(),
            })
            .collect_vec();

        let writes = bindings
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(descriptor_set)
                    .dst_binding(b.binding)
                    .descriptor_type(b.descriptor_type);
                match b.resource {
                    GfxDescriptorResource::Buffer { .. } => {
                        write.buffer_info(std::slice::from_ref(&buffer_infos[i]))
                    }
                    GfxDescriptorResource::Image { .. } => write.image_info(std::slice::from_ref(&image_infos[i])),
                }
            })
            .collect_vec();

        unsafe { self.device.update_descriptor_sets(&writes, &[]) }
    }

    fn create_host_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        debug_name: &str,
    ) -> GfxResult<vk::Buffer> {
        let buffer_ci = vk::BufferCreateInfo::default().size(size).usage(usage);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ..Default::default()
        };
        let (buffer, allocation) = unsafe { self.allocator.create_buffer(&buffer_ci, &alloc_ci)? };
        self.set_debug_name(buffer, debug_name);

        self.host_buffers.lock().insert(buffer, Arc::new(Mutex::new(AshHostBuffer { allocation, size })));
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let Some(host_buffer) = self.host_buffers.lock().remove(&buffer) else {
            log::warn!("destroy_buffer: unknown buffer {buffer:?}");
            return;
        };
        let mut host_buffer = host_buffer.lock();
        unsafe { self.allocator.destroy_buffer(buffer, &mut host_buffer.allocation) }
    }

    fn write_buffer(&self, buffer: vk::Buffer, writes: &[GfxBufferWrite<'_>]) -> GfxResult<()> {
        let _span = tracy_client::span!("AshDevice::write_buffer");

        let host_buffer = self.host_buffer(buffer)?;
        let mut host_buffer = host_buffer.lock();
        for write in writes {
            if write.offset + write.data.len() as vk::DeviceSize > host_buffer.size {
                return Err(GfxError::invalid_argument(format!(
                    "write [{}, +{}) out of buffer size {}",
                    write.offset,
                    write.data.len(),
                    host_buffer.size
                )));
            }
        }

        unsafe {
            let mapped_ptr = self.allocator.map_memory(&mut host_buffer.allocation)?;
            for write in writes {
                std::ptr::copy_nonoverlapping(
                    write.data.as_ptr(),
                    mapped_ptr.add(write.offset as usize),
                    write.data.len(),
                );
            }
        }
        // 非 coherent 内存需要 flush，coherent 内存上 flush 是空操作
        let flush_result = writes.iter().try_for_each(|write| {
            self.allocator.flush_allocation(&host_buffer.allocation, write.offset, write.data.len() as vk::DeviceSize)
        });
        unsafe { self.allocator.unmap_memory(&mut host_buffer.allocation) };
        flush_result?;
        Ok(())
    }
}
