use std::time::Duration;

use texstream_gfx::texture_desc::{TextureBox, TextureDesc};

use crate::error::StreamingError;
use crate::filters::TextureFilter;
use crate::image::PixelBuffer;
use crate::staging::{StagingRegion, StagingTexture};
use crate::texture::{GpuResidency, TextureHandle};

/// worker 线程产生、主线程执行的延迟操作
///
/// 带有 `generation` 的命令只对同一代的加载有效；纹理重新发起加载后，旧的命令会被忽略。
pub enum Command {
    /// 第一个 slice 解码完成，形状已经确定：分配内存并切换驻留状态
    TransitionToLoaded {
        texture: TextureHandle,
        generation: u32,
        desc: TextureDesc,
        residency: GpuResidency,
        sysram_copy: Option<PixelBuffer>,
        update_metadata_cache: bool,
    },
    /// metadata cache 的预测和真实数据不一致，需要释放内存并重新加载
    OutOfDateCache {
        texture: TextureHandle,
        generation: u32,
        actual: TextureDesc,
    },
    ExceptionThrown {
        texture: TextureHandle,
        error: StreamingError,
    },
    /// 从 staging 拷贝到纹理，`dst_box` 是相对于纹理自身的区域
    UploadFromStagingTex {
        texture: TextureHandle,
        generation: u32,
        region: StagingRegion,
        dst_box: TextureBox,
        mip: u8,
    },
    /// 所有数据都已上传：执行 filter 的 serial 阶段，通知 ReadyForRendering
    NotifyDataIsReady {
        texture: TextureHandle,
        generation: u32,
        filters: Vec<Box<dyn TextureFilter>>,
        sysram_copy: Option<PixelBuffer>,
    },
    LogProfiling {
        texture_name: String,
        decode_time: Duration,
        size_bytes: usize,
    },
}

impl Command {
    pub fn texture(&self) -> Option<TextureHandle> {
        match self {
            Self::TransitionToLoaded { texture, .. }
            | Self::OutOfDateCache { texture, .. }
            | Self::ExceptionThrown { texture, .. }
            | Self::UploadFromStagingTex { texture, .. }
            | Self::NotifyDataIsReady { texture, .. } => Some(*texture),
            Self::LogProfiling { .. } => None,
        }
    }
}

/// 命令的执行者，只存在于主线程
pub trait CommandExecutor {
    fn transition_to_loaded(
        &mut self,
        texture: TextureHandle,
        generation: u32,
        desc: TextureDesc,
        residency: GpuResidency,
        sysram_copy: Option<PixelBuffer>,
        update_metadata_cache: bool,
    );

    fn out_of_date_cache(&mut self, texture: TextureHandle, generation: u32, actual: TextureDesc);

    fn exception_thrown(&mut self, texture: TextureHandle, error: StreamingError);

    /// # Params
    /// * `src` - staging 中这次拷贝的那段内存
    fn upload_from_staging(
        &mut self,
        texture: TextureHandle,
        generation: u32,
        src: &[u8],
        src_box: &TextureBox,
        dst_box: &TextureBox,
        mip: u8,
    );

    fn notify_data_is_ready(
        &mut self,
        texture: TextureHandle,
        generation: u32,
        filters: Vec<Box<dyn TextureFilter>>,
        sysram_copy: Option<PixelBuffer>,
    );

    fn log_profiling(&mut self, texture_name: &str, decode_time: Duration, size_bytes: usize) {
        log::info!(
            "[profiling] '{}': decoded {} bytes in {:.3} ms",
            texture_name,
            size_bytes,
            decode_time.as_secs_f64() * 1000.0
        );
    }
}

/// 一个线程录制的命令
///
/// worker 录制一份，主线程执行另一份，两份在 streaming 锁内交换，不会同时被两个线程访问。
#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    #[inline]
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// 按照录制顺序执行所有命令，每个命令只执行一次，执行后缓冲区为空
    ///
    /// # Params
    /// * `staging` - 本轮上传引用的 staging texture，按 id 查找
    pub fn execute(&mut self, staging: &[StagingTexture], executor: &mut dyn CommandExecutor) {
        let _span = tracy_client::span!("CommandBuffer::execute");

        for command in self.commands.drain(..) {
            match command {
                Command::TransitionToLoaded {
                    texture,
                    generation,
                    desc,
                    residency,
                    sysram_copy,
                    update_metadata_cache,
                } => executor.transition_to_loaded(texture, generation, desc, residency, sysram_copy, update_metadata_cache),
                Command::OutOfDateCache {
                    texture,
                    generation,
                    actual,
                } => executor.out_of_date_cache(texture, generation, actual),
                Command::ExceptionThrown { texture, error } => executor.exception_thrown(texture, error),
                Command::UploadFromStagingTex {
                    texture,
                    generation,
                    region,
                    dst_box,
                    mip,
                } => match staging.iter().find(|s| s.id() == region.staging) {
                    Some(s) => executor.upload_from_staging(
                        texture,
                        generation,
                        s.region_data(&region),
                        &region.src_box,
                        &dst_box,
                        mip,
                    ),
                    None => log::error!("upload references staging texture {:?} that is not in use", region.staging),
                },
                Command::NotifyDataIsReady {
                    texture,
                    generation,
                    filters,
                    sysram_copy,
                } => executor.notify_data_is_ready(texture, generation, filters, sysram_copy),
                Command::LogProfiling {
                    texture_name,
                    decode_time,
                    size_bytes,
                } => executor.log_profiling(&texture_name, decode_time, size_bytes),
            }
        }
    }

    /// 丢弃所有命令 (关闭时)
    pub fn clear(&mut self) {
        self.commands.clear();
    }
}
