use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use slotmap::SlotMap;

use crate::backend::{GpuBackend, GpuTextureId, copy_box_into_mip_chain, mip_offset};
use crate::pixel_format::PixelFormat;
use crate::texture_desc::{TextureBox, TextureDesc};

struct HeadlessTexture {
    desc: TextureDesc,
    name: String,
    data: Vec<u8>,
}

/// 纯内存的 GPU 后端
///
/// - 纹理内容保存在系统内存中，上传的结果可以被读回验证
/// - GPU 是"瞬时"的：帧一旦结束就立即完成；等待尚未结束的帧相当于一次强制提交
/// - 记录 stall / flush 等次数，便于测试观察预算回收的行为
pub struct HeadlessGpu {
    textures: Mutex<SlotMap<GpuTextureId, HeadlessTexture>>,

    frames_in_flight: u32,
    /// 当前正在录制的帧
    frame_count: AtomicU64,
    /// 所有 `< completed_frames` 的帧都已经完成
    completed_frames: AtomicU64,

    stall_count: AtomicUsize,
    flush_count: AtomicUsize,
    upload_count: AtomicUsize,
}

impl Default for HeadlessGpu {
    fn default() -> Self {
        Self::new(3)
    }
}

// new & init
impl HeadlessGpu {
    pub fn new(frames_in_flight: u32) -> Self {
        // 从 frames_in_flight 开始计数，保证 "frame_count - frames_in_flight" 不会下溢
        let start_frame = frames_in_flight as u64;
        Self {
            textures: Mutex::new(SlotMap::with_key()),
            frames_in_flight,
            frame_count: AtomicU64::new(start_frame),
            completed_frames: AtomicU64::new(start_frame),
            stall_count: AtomicUsize::new(0),
            flush_count: AtomicUsize::new(0),
            upload_count: AtomicUsize::new(0),
        }
    }
}

// frame
impl HeadlessGpu {
    /// 结束当前帧：之前提交的工作全部完成
    pub fn advance_frame(&self) {
        let frame = self.frame_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.completed_frames.fetch_max(frame, Ordering::AcqRel);
    }
}

// 统计与调试
impl HeadlessGpu {
    /// `wait_for_frame` 真正发生阻塞的次数
    pub fn stall_count(&self) -> usize {
        self.stall_count.load(Ordering::Acquire)
    }

    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::Acquire)
    }

    pub fn upload_count(&self) -> usize {
        self.upload_count.load(Ordering::Acquire)
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.lock().map(|textures| textures.len()).unwrap_or(0)
    }

    pub fn texture_desc(&self, texture: GpuTextureId) -> Option<TextureDesc> {
        let textures = self.textures.lock().ok()?;
        textures.get(texture).map(|t| t.desc)
    }

    pub fn texture_name(&self, texture: GpuTextureId) -> Option<String> {
        let textures = self.textures.lock().ok()?;
        textures.get(texture).map(|t| t.name.clone())
    }

    /// 读取纹理的完整内容 (所有 mip)
    pub fn texture_data(&self, texture: GpuTextureId) -> Option<Vec<u8>> {
        let textures = self.textures.lock().ok()?;
        textures.get(texture).map(|t| t.data.clone())
    }
}

impl GpuBackend for HeadlessGpu {
    fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Acquire)
    }

    fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    fn is_frame_finished(&self, frame: u64) -> bool {
        frame < self.completed_frames.load(Ordering::Acquire)
    }

    fn wait_for_frame(&self, frame: u64) {
        if self.is_frame_finished(frame) {
            return;
        }
        // 等待一个还没有完成的帧：先提交，再等 GPU 追上
        self.flush();
        self.stall_count.fetch_add(1, Ordering::AcqRel);
        self.completed_frames.fetch_max(frame + 1, Ordering::AcqRel);
    }

    fn flush(&self) {
        self.flush_count.fetch_add(1, Ordering::AcqRel);
    }

    fn create_texture(&self, desc: &TextureDesc, name: &str) -> anyhow::Result<GpuTextureId> {
        anyhow::ensure!(desc.is_valid(), "invalid texture desc for '{}': {:?}", name, desc);

        let mut textures = self.textures.lock().map_err(|_| anyhow::anyhow!("headless gpu poisoned"))?;
        let id = textures.insert(HeadlessTexture {
            desc: *desc,
            name: name.to_string(),
            data: vec![0u8; desc.size_bytes()],
        });
        log::debug!("HeadlessGpu: create texture '{}' {:?}", name, desc);
        Ok(id)
    }

    fn destroy_texture(&self, texture: GpuTextureId) {
        if let Ok(mut textures) = self.textures.lock()
            && textures.remove(texture).is_none()
        {
            log::warn!("HeadlessGpu: destroying unknown texture {:?}", texture);
        }
    }

    fn upload_from_staging(
        &self,
        src: &[u8],
        src_box: &TextureBox,
        dst: GpuTextureId,
        dst_box: &TextureBox,
        mip: u8,
    ) -> anyhow::Result<()> {
        let _span = tracy_client::span!("HeadlessGpu::upload_from_staging");
        let mut textures = self.textures.lock().map_err(|_| anyhow::anyhow!("headless gpu poisoned"))?;
        let texture = textures.get_mut(dst).ok_or_else(|| anyhow::anyhow!("unknown gpu texture {:?}", dst))?;
        let desc = texture.desc;
        copy_box_into_mip_chain(&mut texture.data, &desc, mip, dst_box, src, src_box)?;
        self.upload_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn download_texture(&self, texture: GpuTextureId) -> anyhow::Result<Vec<u8>> {
        self.texture_data(texture)
            .ok_or_else(|| anyhow::anyhow!("unknown gpu texture {:?}", texture))
    }

    fn generate_mipmaps(&self, texture: GpuTextureId) -> anyhow::Result<()> {
        let mut textures = self.textures.lock().map_err(|_| anyhow::anyhow!("headless gpu poisoned"))?;
        let texture = textures
            .get_mut(texture)
            .ok_or_else(|| anyhow::anyhow!("unknown gpu texture {:?}", texture))?;
        let desc = texture.desc;

        // 只处理每通道 8bit 的非压缩格式，其他格式保持原样
        let channels = match desc.format.family() {
            PixelFormat::R8Unorm => 1,
            PixelFormat::Rg8Unorm => 2,
            PixelFormat::Rgba8Unorm | PixelFormat::Bgra8Unorm => 4,
            _ => return Ok(()),
        };

        let layers = desc.num_slices() as usize;
        for mip in 1..desc.num_mips {
            let (src_w, src_h, _) = desc.mip_extent(mip - 1);
            let (dst_w, dst_h, _) = desc.mip_extent(mip);
            let src_base = mip_offset(&desc, mip - 1);
            let dst_base = mip_offset(&desc, mip);
            let src_image = desc.format.bytes_per_image(src_w, src_h);
            let dst_image = desc.format.bytes_per_image(dst_w, dst_h);

            for layer in 0..layers {
                for y in 0..dst_h as usize {
                    for x in 0..dst_w as usize {
                        for c in 0..channels {
                            let mut sum = 0u32;
                            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                                let sx = (x * 2 + dx).min(src_w as usize - 1);
                                let sy = (y * 2 + dy).min(src_h as usize - 1);
                                let idx = src_base + layer * src_image + (sy * src_w as usize + sx) * channels + c;
                                sum += texture.data[idx] as u32;
                            }
                            let idx = dst_base + layer * dst_image + (y * dst_w as usize + x) * channels + c;
                            texture.data[idx] = (sum / 4) as u8;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
