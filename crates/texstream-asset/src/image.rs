use std::sync::Arc;

use image::imageops::FilterType;
use texstream_gfx::backend::{copy_box_into_mip_chain, mip_offset};
use texstream_gfx::pixel_format::PixelFormat;
use texstream_gfx::texture_desc::{TextureBox, TextureDesc, TextureType};

/// 图片的像素内存
///
/// 区分"引擎持有"和"调用者持有"两种情况，释放逻辑只有一条路径：
/// - `Owned`: 引擎持有 (auto delete)，可以直接移动给纹理作为 system ram 副本
/// - `Shared`: 调用者持有，引擎只读；需要修改或转移所有权时会拷贝一份
#[derive(Debug, Clone)]
pub enum PixelBuffer {
    Owned(Vec<u8>),
    Shared(Arc<[u8]>),
}

impl PixelBuffer {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => bytes,
            Self::Shared(bytes) => bytes,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    #[inline]
    pub fn is_engine_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }

    /// 取出字节；调用者持有的内存会被拷贝
    pub fn into_vec(self) -> Vec<u8> {
        match self {
            Self::Owned(bytes) => bytes,
            Self::Shared(bytes) => bytes.to_vec(),
        }
    }

    /// 可写访问；调用者持有的内存会先被拷贝成引擎持有
    pub fn make_mut(&mut self) -> &mut Vec<u8> {
        if let Self::Shared(bytes) = self {
            *self = Self::Owned(bytes.to_vec());
        }
        match self {
            Self::Owned(bytes) => bytes,
            Self::Shared(_) => unreachable!(),
        }
    }
}

/// CPU 端的图片：一条完整的 mip 链
///
/// 内存排列和 GPU 后端的约定一致：mip 优先，然后是 slice/depth，最后是行，紧密排列。
#[derive(Debug, Clone)]
pub struct Image {
    desc: TextureDesc,
    data: PixelBuffer,
}

// new & init
impl Image {
    pub fn new(desc: TextureDesc, data: Vec<u8>) -> anyhow::Result<Self> {
        Self::load_dynamic_image(PixelBuffer::Owned(data), desc)
    }

    /// 包装一段已经存在的像素内存
    ///
    /// # Params
    /// * `data` - `Shared` 表示内存归调用者所有，引擎永远不会释放它
    pub fn load_dynamic_image(data: PixelBuffer, desc: TextureDesc) -> anyhow::Result<Self> {
        anyhow::ensure!(desc.is_valid(), "invalid image description: {:?}", desc);
        anyhow::ensure!(
            data.len() == desc.size_bytes(),
            "image data is {} bytes, but {}x{}x{} {} with {} mips needs {} bytes",
            data.len(),
            desc.width,
            desc.height,
            desc.depth_or_slices,
            desc.format,
            desc.num_mips,
            desc.size_bytes()
        );
        Ok(Self { desc, data })
    }

    /// 加载失败时使用的 2x2 棋盘格
    pub fn fallback() -> Self {
        Self::checkerboard(TextureDesc::new_2d(2, 2, 1, PixelFormat::Rgba8Unorm))
    }

    /// 任意形状的棋盘格
    ///
    /// 多文件 cubemap 的非首个面加载失败时，需要一张和其他面尺寸一致的替代图。
    pub fn checkerboard(desc: TextureDesc) -> Self {
        const PINK: [u8; 4] = [255, 0, 255, 255];
        const BLACK: [u8; 4] = [0, 0, 0, 255];

        let format = desc.format;
        let mut data = Vec::with_capacity(desc.size_bytes());
        for mip in 0..desc.num_mips {
            let (w, h, d) = desc.mip_extent(mip);
            let layers = d * desc.num_slices();
            let (cols, rows, texel_bytes) = if format.is_compressed() {
                (w.div_ceil(4), h.div_ceil(4), format.compressed_block_bytes())
            } else {
                (w, h, format.bytes_per_pixel())
            };

            for _ in 0..layers {
                for y in 0..rows {
                    for x in 0..cols {
                        let lit = (x + y) % 2 == 0;
                        match format.family() {
                            PixelFormat::Rgba8Unorm | PixelFormat::Bgra8Unorm => {
                                data.extend_from_slice(if lit { &PINK } else { &BLACK })
                            }
                            _ => data.extend(std::iter::repeat_n(if lit { 0xff } else { 0x00 }, texel_bytes)),
                        }
                    }
                }
            }
        }

        Self {
            desc,
            data: PixelBuffer::Owned(data),
        }
    }
}

// getter
impl Image {
    #[inline]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.desc.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.desc.height
    }

    #[inline]
    pub fn depth_or_slices(&self) -> u32 {
        self.desc.depth_or_slices
    }

    #[inline]
    pub fn num_mips(&self) -> u8 {
        self.desc.num_mips
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.desc.format
    }

    #[inline]
    pub fn texture_type(&self) -> TextureType {
        self.desc.texture_type
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_engine_owned(&self) -> bool {
        self.data.is_engine_owned()
    }

    pub fn into_buffer(self) -> PixelBuffer {
        self.data
    }

    /// 指定 mip 的数据 (所有 slice)
    pub fn mip_data(&self, mip: u8) -> &[u8] {
        let start = mip_offset(&self.desc, mip);
        &self.data()[start..start + self.desc.mip_size_bytes(mip)]
    }

    /// 指定 mip 中某一个 slice (或 3D 纹理的某一层 depth) 的数据
    pub fn slice_data(&self, mip: u8, slice: u32) -> &[u8] {
        let (w, h, _) = self.desc.mip_extent(mip);
        let image_bytes = self.desc.format.bytes_per_image(w, h);
        let start = slice as usize * image_bytes;
        &self.mip_data(mip)[start..start + image_bytes]
    }

    /// 描述指定 mip 内存排列的 box (包含所有 slice)
    pub fn mip_box(&self, mip: u8) -> TextureBox {
        let (w, h, d) = self.desc.mip_extent(mip);
        let is_3d = self.desc.texture_type.is_3d();
        TextureBox::new(w, h, d, if is_3d { 1 } else { self.desc.num_slices() }, self.desc.format)
    }

    /// mip 中的 slice 数量 (3D 纹理为该 mip 的深度)
    pub fn mip_depth_or_slices(&self, mip: u8) -> u32 {
        self.mip_box(mip).depth_or_slices()
    }
}

// 修改
impl Image {
    /// 只修改格式的解释方式 (例如 UNORM -> sRGB)，内存布局必须完全一致
    pub fn reinterpret_format(&mut self, format: PixelFormat) -> anyhow::Result<()> {
        anyhow::ensure!(
            format.family() == self.desc.format.family(),
            "cannot reinterpret {} as {}",
            self.desc.format,
            format
        );
        self.desc.format = format;
        Ok(())
    }

    /// 把单 slice 的 `src` 的所有 mip 拷贝到当前图片的第 `slice` 个 slice
    ///
    /// 多文件 cubemap 组装 system ram 副本时使用。
    pub fn copy_into_slice(&mut self, slice: u32, src: &Image) -> anyhow::Result<()> {
        anyhow::ensure!(slice < self.desc.num_slices(), "slice {} out of range", slice);
        anyhow::ensure!(
            src.width() == self.width() && src.height() == self.height() && src.format() == self.format(),
            "source face does not match the destination"
        );

        let desc = self.desc;
        let dst = self.data.make_mut();
        for mip in 0..desc.num_mips.min(src.num_mips()) {
            let src_box = src.mip_box(mip);
            let mut dst_box = src_box;
            dst_box.num_slices = 1;
            dst_box.slice_start = slice;
            let mut one_slice = src_box;
            one_slice.num_slices = 1;
            copy_box_into_mip_chain(dst, &desc, mip, &dst_box, src.slice_data(mip, 0), &one_slice)?;
        }
        Ok(())
    }

    /// 使用 image crate 的重采样在 CPU 上生成完整的 mip 链
    ///
    /// 只支持每通道 8bit 的非压缩 2D 格式，其余格式返回错误。
    pub fn generate_mipmaps(&mut self) -> anyhow::Result<()> {
        let desc = self.desc;
        anyhow::ensure!(!desc.texture_type.is_3d(), "software mipmaps of 3D textures are not supported");

        let max_mips = TextureDesc::max_mips(desc.width, desc.height, 1);
        if desc.num_mips >= max_mips {
            return Ok(());
        }

        let mut data = Vec::with_capacity(TextureDesc { num_mips: max_mips, ..desc }.size_bytes());
        data.extend_from_slice(self.mip_data(0));
        for mip in 1..max_mips {
            let (w, h, _) = desc.mip_extent(mip);
            for slice in 0..desc.num_slices() {
                let resized = resize_slice(desc.format, desc.width, desc.height, self.slice_data(0, slice), w, h)?;
                data.extend_from_slice(&resized);
            }
        }

        self.desc.num_mips = max_mips;
        self.data = PixelBuffer::Owned(data);
        Ok(())
    }

    /// 扩展 mip 链的长度，新增的 mip 内容为 0 (由 GPU 生成)
    pub fn extend_mips(&mut self, num_mips: u8) {
        if num_mips <= self.desc.num_mips {
            return;
        }
        let mut new_desc = self.desc;
        new_desc.num_mips = num_mips;
        let bytes = self.data.make_mut();
        bytes.resize(new_desc.size_bytes(), 0);
        self.desc = new_desc;
    }

    /// 法线贴图只保留 RG 两个通道
    pub fn convert_to_rg8(&mut self) -> anyhow::Result<()> {
        if self.desc.format == PixelFormat::Rg8Unorm {
            return Ok(());
        }
        anyhow::ensure!(
            self.desc.format.family() == PixelFormat::Rgba8Unorm,
            "normal map conversion requires RGBA8, got {}",
            self.desc.format
        );

        let rg = self.data().chunks_exact(4).flat_map(|texel| [texel[0], texel[1]]).collect();
        self.desc.format = PixelFormat::Rg8Unorm;
        self.data = PixelBuffer::Owned(rg);
        Ok(())
    }
}

fn resize_slice(format: PixelFormat, width: u32, height: u32, data: &[u8], new_width: u32, new_height: u32) -> anyhow::Result<Vec<u8>> {
    let bad_size = || anyhow::anyhow!("slice data does not match {}x{} {}", width, height, format);

    let resized = match format.family() {
        PixelFormat::R8Unorm => {
            let src = image::GrayImage::from_raw(width, height, data.to_vec()).ok_or_else(bad_size)?;
            image::imageops::resize(&src, new_width, new_height, FilterType::Triangle).into_raw()
        }
        PixelFormat::Rg8Unorm => {
            let src = image::GrayAlphaImage::from_raw(width, height, data.to_vec()).ok_or_else(bad_size)?;
            image::imageops::resize(&src, new_width, new_height, FilterType::Triangle).into_raw()
        }
        // BGRA 的通道顺序不影响逐通道的滤波
        PixelFormat::Rgba8Unorm | PixelFormat::Bgra8Unorm => {
            let src = image::RgbaImage::from_raw(width, height, data.to_vec()).ok_or_else(bad_size)?;
            image::imageops::resize(&src, new_width, new_height, FilterType::Triangle).into_raw()
        }
        other => anyhow::bail!("software mipmaps are not supported for {}", other),
    };
    Ok(resized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_is_2x2_checkerboard() {
        let image = Image::fallback();
        assert_eq!((image.width(), image.height(), image.num_mips()), (2, 2, 1));
        assert_eq!(image.format(), PixelFormat::Rgba8Unorm);
        assert_eq!(&image.data()[0..4], &[255, 0, 255, 255]);
        assert_eq!(&image.data()[4..8], &[0, 0, 0, 255]);
    }

    #[test]
    fn test_wrong_size_is_rejected() {
        let desc = TextureDesc::new_2d(4, 4, 1, PixelFormat::Rgba8Unorm);
        assert!(Image::new(desc, vec![0; 63]).is_err());
        assert!(Image::new(desc, vec![0; 64]).is_ok());
    }

    #[test]
    fn test_shared_buffer_is_copied_on_write() {
        let desc = TextureDesc::new_2d(2, 1, 1, PixelFormat::R8Unorm);
        let shared: Arc<[u8]> = Arc::from(vec![10u8, 20]);
        let mut image = Image::load_dynamic_image(PixelBuffer::Shared(shared.clone()), desc).unwrap();
        assert!(!image.is_engine_owned());

        image.extend_mips(2);
        assert!(image.is_engine_owned());
        assert_eq!(image.data(), &[10, 20, 0]);
        // 调用者的内存不受影响
        assert_eq!(&*shared, &[10, 20]);
    }

    #[test]
    fn test_generate_mipmaps_builds_full_chain() {
        let desc = TextureDesc::new_2d(4, 2, 1, PixelFormat::Rgba8Unorm);
        let mut image = Image::new(desc, vec![128; 4 * 2 * 4]).unwrap();
        image.generate_mipmaps().unwrap();

        assert_eq!(image.num_mips(), 3);
        assert_eq!(image.size_bytes(), (8 + 2 + 1) * 4);
        // 常量颜色在重采样后保持不变
        assert!(image.mip_data(2).iter().all(|&b| b == 128));
    }

    #[test]
    fn test_copy_into_slice() {
        let cube = TextureDesc {
            width: 1,
            height: 1,
            depth_or_slices: 6,
            num_mips: 1,
            format: PixelFormat::R8Unorm,
            texture_type: TextureType::TypeCube,
        };
        let mut dst = Image::new(cube, vec![0; 6]).unwrap();
        let face = Image::new(TextureDesc::new_2d(1, 1, 1, PixelFormat::R8Unorm), vec![7]).unwrap();

        dst.copy_into_slice(4, &face).unwrap();
        assert_eq!(dst.data(), &[0, 0, 0, 0, 7, 0]);
        assert_eq!(dst.slice_data(0, 4), &[7]);
    }

    #[test]
    fn test_convert_to_rg8() {
        let desc = TextureDesc::new_2d(1, 1, 1, PixelFormat::Rgba8Unorm);
        let mut image = Image::new(desc, vec![1, 2, 3, 4]).unwrap();
        image.convert_to_rg8().unwrap();
        assert_eq!(image.format(), PixelFormat::Rg8Unorm);
        assert_eq!(image.data(), &[1, 2]);
    }
}
