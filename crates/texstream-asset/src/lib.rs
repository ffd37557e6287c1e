//! 纹理流送与驻留管理
//!
//! 纹理在三个驻留状态之间移动：`OnStorage` (只有元数据)、`OnSystemRam`、`Resident` (在 GPU 上)。
//! 读取、解码、拷贝到 staging 都在后台的 streaming worker 中完成，
//! 真正修改 GPU 状态的操作以命令的形式交给主线程执行。
//!
//! - [`manager::TextureGpuManager`]: 入口，创建纹理、请求驻留状态变化、每帧 `update`
//! - [`worker`]: streaming worker 的一轮处理
//! - [`staging`]: staging texture 的预算、复用与回收
//! - [`texture_pool`]: 把相同形状的 2D 纹理合并到一张 array texture 中
//! - [`scheduled`]: 每张纹理的任务队列与驻留状态机
//! - [`metadata_cache`]: 在读取文件之前预测纹理的形状

pub mod archive;
pub mod codec;
pub mod command_buffer;
pub mod config;
pub mod error;
pub mod filters;
pub mod image;
pub mod listener;
pub mod load_request;
pub mod manager;
pub mod metadata_cache;
pub mod multiload;
pub mod queued_image;
pub mod scheduled;
pub mod staging;
pub mod texture;
pub mod texture_pool;
pub mod worker;

pub use config::StreamingConfig;
pub use error::StreamingError;
pub use listener::{TextureEventReason, TextureListener};
pub use manager::{MemoryUsage, TextureCreateInfo, TextureGpuManager, TransitionOptions};
pub use texture::{GpuPageOutStrategy, GpuResidency, TextureFlags, TextureGpu, TextureHandle};
