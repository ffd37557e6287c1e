//! texstream 的 GFX 层
//!
//! 流送系统只关心"要把多少字节拷贝到哪张纹理的哪个区域"，
//! 具体的图形 API (descriptor、command buffer、shader) 都被挡在 [`backend::GpuBackend`] 之后。
//!
//! - [`pixel_format`]: 像素格式以及字节数计算
//! - [`texture_desc`]: 纹理的形状描述 (分辨率、mip、类型) 和拷贝区域
//! - [`backend`]: GPU 后端 trait
//! - [`headless`]: 纯内存的后端实现，用于测试和没有 GPU 的环境

pub mod backend;
pub mod headless;
pub mod pixel_format;
pub mod texture_desc;
