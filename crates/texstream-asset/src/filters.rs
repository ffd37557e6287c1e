use bitflags::bitflags;
use texstream_gfx::backend::{GpuBackend, GpuTextureId};
use texstream_gfx::texture_desc::TextureDesc;

use crate::image::Image;
use crate::texture::TextureFlags;

bitflags! {
    /// 加载时对图片做的处理
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FilterFlags: u32 {
        /// 在 CPU 上生成完整的 mip 链
        const GENERATE_SW_MIPMAPS = 1 << 0;
        /// 上传完成后由 GPU 生成 mip
        const GENERATE_HW_MIPMAPS = 1 << 1;
        /// 法线贴图：只保留 RG 通道
        const PREPARE_FOR_NORMAL_MAPPING = 1 << 2;
    }
}

/// 加载过程中的一个处理步骤
///
/// 分两个阶段执行：
/// - streaming 阶段：worker 线程，图片解码之后、拷贝到 staging 之前，可以修改图片
/// - serial 阶段：主线程，纹理的所有数据上传完成以后，由 `NotifyDataIsReady` 命令触发
///
/// filter 对象随 command 从 worker 线程转移到主线程，执行完 serial 阶段后销毁。
pub trait TextureFilter: Send {
    fn name(&self) -> &'static str;

    fn run_streaming(&mut self, image: &mut Image) -> anyhow::Result<()>;

    fn run_serial(&mut self, _backend: &dyn GpuBackend, _texture: GpuTextureId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 根据 flags 创建这次加载需要的 filter，顺序即执行顺序
pub fn create_filters(filters: FilterFlags, texture_flags: TextureFlags) -> Vec<Box<dyn TextureFilter>> {
    let mut result: Vec<Box<dyn TextureFilter>> = Vec::new();

    if filters.contains(FilterFlags::PREPARE_FOR_NORMAL_MAPPING) {
        result.push(Box::new(PrepareForNormalMapping));
    } else if texture_flags.contains(TextureFlags::PREFERS_LOADING_AS_SRGB) {
        // 法线贴图不是颜色数据，不做 sRGB 转换
        result.push(Box::new(LoadAsSrgb));
    }

    if filters.contains(FilterFlags::GENERATE_SW_MIPMAPS) {
        result.push(Box::new(GenerateSwMipmaps));
    } else if filters.contains(FilterFlags::GENERATE_HW_MIPMAPS) {
        result.push(Box::new(GenerateHwMipmaps { needs_generation: false }));
    }

    result
}

/// 依次执行 streaming 阶段
///
/// 失败的 filter 只记录日志，图片保持该 filter 执行之前的状态。
pub fn run_streaming_filters(filters: &mut [Box<dyn TextureFilter>], image: &mut Image, name: &str) {
    for filter in filters.iter_mut() {
        if let Err(e) = filter.run_streaming(image) {
            log::warn!("filter '{}' skipped for '{}': {}", filter.name(), name, e);
        }
    }
}

struct LoadAsSrgb;

impl TextureFilter for LoadAsSrgb {
    fn name(&self) -> &'static str {
        "load_as_srgb"
    }

    fn run_streaming(&mut self, image: &mut Image) -> anyhow::Result<()> {
        let srgb = image.format().srgb_equivalent();
        image.reinterpret_format(srgb)
    }
}

struct PrepareForNormalMapping;

impl TextureFilter for PrepareForNormalMapping {
    fn name(&self) -> &'static str {
        "prepare_for_normal_mapping"
    }

    fn run_streaming(&mut self, image: &mut Image) -> anyhow::Result<()> {
        if image.format().is_compressed() {
            // 压缩格式 (例如 BC5) 已经是离线处理好的
            return Ok(());
        }
        image.convert_to_rg8()
    }
}

struct GenerateSwMipmaps;

impl TextureFilter for GenerateSwMipmaps {
    fn name(&self) -> &'static str {
        "generate_sw_mipmaps"
    }

    fn run_streaming(&mut self, image: &mut Image) -> anyhow::Result<()> {
        if image.num_mips() > 1 {
            return Ok(());
        }
        image.generate_mipmaps()
    }
}

struct GenerateHwMipmaps {
    needs_generation: bool,
}

impl TextureFilter for GenerateHwMipmaps {
    fn name(&self) -> &'static str {
        "generate_hw_mipmaps"
    }

    /// 预留完整的 mip 链 (内容为 0)，真正的内容在 serial 阶段生成
    fn run_streaming(&mut self, image: &mut Image) -> anyhow::Result<()> {
        if image.num_mips() > 1 || image.format().is_compressed() {
            return Ok(());
        }
        let max_mips = TextureDesc::max_mips(image.width(), image.height(), image.desc().depth());
        image.extend_mips(max_mips);
        self.needs_generation = max_mips > 1;
        Ok(())
    }

    fn run_serial(&mut self, backend: &dyn GpuBackend, texture: GpuTextureId) -> anyhow::Result<()> {
        if self.needs_generation {
            backend.generate_mipmaps(texture)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use texstream_gfx::headless::HeadlessGpu;
    use texstream_gfx::pixel_format::PixelFormat;

    use super::*;

    fn rgba_image(width: u32, height: u32) -> Image {
        let desc = TextureDesc::new_2d(width, height, 1, PixelFormat::Rgba8Unorm);
        Image::new(desc, vec![200; (width * height * 4) as usize]).unwrap()
    }

    #[test]
    fn test_srgb_is_skipped_for_normal_maps() {
        let filters = create_filters(FilterFlags::PREPARE_FOR_NORMAL_MAPPING, TextureFlags::PREFERS_LOADING_AS_SRGB);
        let names: Vec<_> = filters.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["prepare_for_normal_mapping"]);
    }

    #[test]
    fn test_srgb_and_sw_mips() {
        let mut filters = create_filters(FilterFlags::GENERATE_SW_MIPMAPS, TextureFlags::PREFERS_LOADING_AS_SRGB);
        let mut image = rgba_image(4, 4);
        run_streaming_filters(&mut filters, &mut image, "test");

        assert_eq!(image.format(), PixelFormat::Rgba8UnormSrgb);
        assert_eq!(image.num_mips(), 3);
    }

    #[test]
    fn test_hw_mips_generated_in_serial_stage() {
        let mut filters = create_filters(FilterFlags::GENERATE_HW_MIPMAPS, TextureFlags::empty());
        let mut image = rgba_image(2, 2);
        run_streaming_filters(&mut filters, &mut image, "test");
        assert_eq!(image.num_mips(), 2);
        // 新增的 mip 还没有内容
        assert!(image.mip_data(1).iter().all(|&b| b == 0));

        let gpu = HeadlessGpu::default();
        let id = gpu.create_texture(image.desc(), "hw").unwrap();
        let mip0 = image.mip_box(0);
        gpu.upload_from_staging(image.mip_data(0), &mip0, id, &mip0, 0).unwrap();

        for filter in filters.iter_mut() {
            filter.run_serial(&gpu, id).unwrap();
        }
        let data = gpu.texture_data(id).unwrap();
        assert_eq!(&data[16..20], &[200, 200, 200, 200]);
    }
}
