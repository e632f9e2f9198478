//! Vulkan GFX 抽象层
//!
//! 所有 GPU 调用都经过 [`device::GfxDevice`] trait，由显式构造的设备对象承载，
//! 不再依赖全局单例。提供两个实现：
//! - [`ash_device::AshDevice`]：基于 ash + vk-mem 的真实 Vulkan 后端
//! - [`headless::HeadlessDevice`]：不访问 GPU 的空后端，记录所有命令，用于测试与离线工具

pub mod ash_device;
pub mod basic;
pub mod commands;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod headless;
pub mod queue_family;
