//! 渲染核心的配置
//!
//! 所有字段都有默认值，TOML 中只需要写出想要覆盖的部分。

use std::{path::Path, time::Duration};

use anyhow::Context;
use ash::vk;
use ferrule_gfx::error::{GfxError, GfxResult};
use serde::Deserialize;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RenderCoreConfig {
    pub frames_in_flight: usize,
    /// update 任务与拷贝任务使用的 worker 线程数
    pub worker_threads: usize,
    /// fence 等待的诊断超时，`None` 表示无限等待
    pub fence_timeout_ms: Option<u64>,

    pub max_descriptor_sets: u32,
    pub uniform_buffer_descriptors: u32,
    pub storage_buffer_descriptors: u32,
    pub combined_image_sampler_descriptors: u32,
    pub storage_image_descriptors: u32,
}

impl Default for RenderCoreConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            worker_threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
            fence_timeout_ms: None,
            max_descriptor_sets: 1024,
            uniform_buffer_descriptors: 1024,
            storage_buffer_descriptors: 1024,
            combined_image_sampler_descriptors: 1024,
            storage_image_descriptors: 256,
        }
    }
}

// new & init
impl RenderCoreConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = ferrule_crate_tools::config::parse_toml(content)?;
        config.validate().context("渲染配置不合法")?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config: Self = ferrule_crate_tools::config::load_toml(path.as_ref())?;
        config.validate().with_context(|| format!("渲染配置不合法: {:?}", path.as_ref()))?;
        Ok(config)
    }
}

// getters
impl RenderCoreConfig {
    pub fn validate(&self) -> GfxResult<()> {
        if self.frames_in_flight == 0 {
            return Err(GfxError::invalid_argument("frames_in_flight must be at least 1"));
        }
        if self.worker_threads == 0 {
            return Err(GfxError::invalid_argument("worker_threads must be at least 1"));
        }
        if self.max_descriptor_sets == 0 {
            return Err(GfxError::invalid_argument("max_descriptor_sets must be at least 1"));
        }
        Ok(())
    }

    #[inline]
    pub fn fence_timeout(&self) -> Option<Duration> {
        self.fence_timeout_ms.map(Duration::from_millis)
    }

    /// 数量为 0 的类型不会出现在结果中
    pub fn descriptor_pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        [
            (vk::DescriptorType::UNIFORM_BUFFER, self.uniform_buffer_descriptors),
            (vk::DescriptorType::STORAGE_BUFFER, self.storage_buffer_descriptors),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, self.combined_image_sampler_descriptors),
            (vk::DescriptorType::STORAGE_IMAGE, self.storage_image_descriptors),
        ]
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
        .collect()
    }
}
