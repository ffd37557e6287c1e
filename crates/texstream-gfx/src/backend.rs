use slotmap::new_key_type;

use crate::texture_desc::{TextureBox, TextureDesc};

// GPU 纹理的句柄，由后端分配
// 使用 slotmap 的 generational index，已经销毁的纹理句柄不会被误用
new_key_type! { pub struct GpuTextureId; }

/// 流送系统看到的 GPU
///
/// 所有的方法都是 `&self`：后端会同时被主线程 (上传、创建纹理) 和 worker 线程
/// (staging texture 的帧同步) 使用，内部可变性由实现者负责。
///
/// # 帧模型
/// - `frame_count` 是 CPU 正在录制的帧序号，一直累加
/// - 一帧提交以后，GPU 完成的时间点不确定；`is_frame_finished` 用于非阻塞查询
/// - `wait_for_frame` 会阻塞直到该帧完成，必要时先提交 (flush) 当前的命令
pub trait GpuBackend: Send + Sync {
    /// 当前正在录制的帧序号
    fn frame_count(&self) -> u64;

    /// 同时在 GPU 上飞行的帧数 (frames in flight)
    fn frames_in_flight(&self) -> u32;

    fn is_frame_finished(&self, frame: u64) -> bool;

    /// 阻塞等待指定帧完成
    fn wait_for_frame(&self, frame: u64);

    /// 提交所有已经录制的命令
    fn flush(&self);

    /// 分配一张 GPU 纹理，此时纹理内容未定义
    fn create_texture(&self, desc: &TextureDesc, name: &str) -> anyhow::Result<GpuTextureId>;

    fn destroy_texture(&self, texture: GpuTextureId);

    /// 从 staging 内存拷贝到 GPU 纹理 (GPU -> GPU)
    ///
    /// # Params
    /// * `src` - staging texture 中映射出来的那段内存，排列方式由 `src_box` 描述
    /// * `dst_box` - 目标纹理中的区域，尺寸必须和 `src_box` 一致
    /// * `mip` - 目标 mip 层级
    fn upload_from_staging(
        &self,
        src: &[u8],
        src_box: &TextureBox,
        dst: GpuTextureId,
        dst_box: &TextureBox,
        mip: u8,
    ) -> anyhow::Result<()>;

    /// 把整张纹理 (所有 mip，紧密排列) 读回到系统内存
    fn download_texture(&self, texture: GpuTextureId) -> anyhow::Result<Vec<u8>>;

    /// 在 GPU 上根据 mip 0 生成剩余的 mip
    fn generate_mipmaps(&self, texture: GpuTextureId) -> anyhow::Result<()>;
}

/// 纹理数据在内存中的排列方式：mip 优先，然后是 slice/depth，最后是行
///
/// 返回指定 mip 的起始偏移
pub fn mip_offset(desc: &TextureDesc, mip: u8) -> usize {
    (0..mip).map(|m| desc.mip_size_bytes(m)).sum()
}

/// 把 `src` 中描述为 `src_box` 的数据拷贝到 `dst`（一条紧密排列的 mip 链）中 `dst_box` 的位置
///
/// 后端实现和系统内存副本的写入都使用这个函数，保证两边的排列一致。
pub fn copy_box_into_mip_chain(
    dst: &mut [u8],
    desc: &TextureDesc,
    mip: u8,
    dst_box: &TextureBox,
    src: &[u8],
    src_box: &TextureBox,
) -> anyhow::Result<()> {
    anyhow::ensure!(mip < desc.num_mips, "mip {} out of range ({} mips)", mip, desc.num_mips);
    anyhow::ensure!(src_box.equal_size(dst_box), "src and dst box must have the same size");

    let format = desc.format;
    let (mip_w, mip_h, _) = desc.mip_extent(mip);
    let mip_row_bytes = format.bytes_per_row(mip_w);
    let mip_image_bytes = format.bytes_per_image(mip_w, mip_h);
    let base = mip_offset(desc, mip);

    let (block_x, block_y) = if format.is_compressed() { (4, 4) } else { (1, 1) };
    let row_bytes = format.bytes_per_row(dst_box.width);
    let rows = dst_box.height.div_ceil(block_y) as usize;
    let x_bytes = if format.is_compressed() {
        (dst_box.x / block_x) as usize * format.compressed_block_bytes()
    } else {
        dst_box.x as usize * format.bytes_per_pixel()
    };
    let y_rows = (dst_box.y / block_y) as usize;
    let dst_layer_start = dst_box.z.max(dst_box.slice_start) as usize;

    for layer in 0..src_box.depth_or_slices() as usize {
        for row in 0..rows {
            let src_offset = layer * src_box.bytes_per_image + row * src_box.bytes_per_row;
            let dst_offset =
                base + (dst_layer_start + layer) * mip_image_bytes + (y_rows + row) * mip_row_bytes + x_bytes;

            let src_row = src
                .get(src_offset..src_offset + row_bytes)
                .ok_or_else(|| anyhow::anyhow!("source region out of bounds"))?;
            let dst_row = dst
                .get_mut(dst_offset..dst_offset + row_bytes)
                .ok_or_else(|| anyhow::anyhow!("destination region out of bounds"))?;
            dst_row.copy_from_slice(src_row);
        }
    }

    Ok(())
}
