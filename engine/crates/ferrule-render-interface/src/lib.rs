//! GPU 资源生命周期与跨 queue 同步
//!
//! - 资源状态表 + barrier 批处理
//! - queue 注册表与多 queue 的帧提交顺序
//! - 按 frame slot 复用的 semaphore 池
//! - 延迟的 host 拷贝队列
//! - 按内容去重的 descriptor set 缓存

pub mod barrier;
pub mod config;
pub mod copy_queue;
pub mod descriptor_cache;
pub mod frame_counter;
pub mod frame_slot;
pub mod handles;
pub mod queue_registry;
pub mod render_context;
pub mod resource_state;
pub mod semaphore_pool;
pub mod state_table;
pub mod submission;
