use std::io::Cursor;
use std::sync::Arc;

use texstream_gfx::pixel_format::PixelFormat;
use texstream_gfx::texture_desc::{TextureDesc, TextureType};

use crate::image::Image;

/// 把字节流解码为 [`Image`]
///
/// 解码器运行在 worker 线程或者 multiload 线程池中，必须是无状态的。
pub trait ImageDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// 负责的文件扩展名 (小写，不带 `.`)；空表示作为兜底的解码器
    fn extensions(&self) -> &'static [&'static str];

    fn decode(&self, name: &str, bytes: &[u8]) -> anyhow::Result<Image>;
}

/// 基于 image crate 的通用解码器 (png / jpg / bmp / tga / ...)
///
/// 统一转换为 RGBA8，只有一个 mip。
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardImageDecoder;

impl ImageDecoder for StandardImageDecoder {
    fn name(&self) -> &'static str {
        "image"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[]
    }

    fn decode(&self, name: &str, bytes: &[u8]) -> anyhow::Result<Image> {
        let _span = tracy_client::span!("StandardImageDecoder::decode");

        let img = image::load_from_memory(bytes).map_err(|e| anyhow::anyhow!("{}: {}", name, e))?;
        // 强制转换为 RGBA8
        let rgba = img.into_rgba8();
        let (width, height) = rgba.dimensions();

        Image::new(TextureDesc::new_2d(width, height, 1, PixelFormat::Rgba8Unorm), rgba.into_raw())
    }
}

/// 引擎自己的原始纹理格式
///
/// 一个小的 header 加上紧密排列的 mip 链，支持任意 [`PixelFormat`] 和纹理类型，
/// 一个文件就可以放下整个 cubemap。
///
/// ```text
/// magic "TXSR" | version u32 | width u32 | height u32 | depth_or_slices u32
/// | num_mips u32 | texture_type u32 | format name len u32 | format name | data
/// ```
/// 所有整数都是小端。
#[derive(Debug, Default, Clone, Copy)]
pub struct RawTextureCodec;

impl RawTextureCodec {
    const MAGIC: &'static [u8; 4] = b"TXSR";
    const VERSION: u32 = 1;

    pub fn encode(image: &Image) -> Vec<u8> {
        let desc = image.desc();
        let format_name = desc.format.as_str().as_bytes();

        let mut bytes = Vec::with_capacity(32 + format_name.len() + image.size_bytes());
        bytes.extend_from_slice(Self::MAGIC);
        for value in [
            Self::VERSION,
            desc.width,
            desc.height,
            desc.depth_or_slices,
            desc.num_mips as u32,
            desc.texture_type.as_u32(),
            format_name.len() as u32,
        ] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.extend_from_slice(format_name);
        bytes.extend_from_slice(image.data());
        bytes
    }
}

impl ImageDecoder for RawTextureCodec {
    fn name(&self) -> &'static str {
        "rawtex"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rawtex"]
    }

    fn decode(&self, name: &str, bytes: &[u8]) -> anyhow::Result<Image> {
        let mut cursor = Cursor::new(bytes);
        let mut read_u32 = || -> anyhow::Result<u32> {
            let pos = cursor.position() as usize;
            let word = bytes
                .get(pos..pos + 4)
                .ok_or_else(|| anyhow::anyhow!("{}: truncated header", name))?;
            cursor.set_position((pos + 4) as u64);
            Ok(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        };

        anyhow::ensure!(bytes.starts_with(Self::MAGIC), "{}: not a rawtex file", name);
        read_u32()?;
        let version = read_u32()?;
        anyhow::ensure!(version == Self::VERSION, "{}: unsupported rawtex version {}", name, version);

        let width = read_u32()?;
        let height = read_u32()?;
        let depth_or_slices = read_u32()?;
        let num_mips = read_u32()?;
        let texture_type = read_u32()?;
        let name_len = read_u32()? as usize;

        let header_len = 4 + 7 * 4;
        let format_name = bytes
            .get(header_len..header_len + name_len)
            .ok_or_else(|| anyhow::anyhow!("{}: truncated format name", name))?;
        let format: PixelFormat = std::str::from_utf8(format_name)?
            .parse()
            .map_err(|e: String| anyhow::anyhow!("{}: {}", name, e))?;

        let desc = TextureDesc {
            width,
            height,
            depth_or_slices,
            num_mips: u8::try_from(num_mips)?,
            format,
            texture_type: TextureType::from_u32(texture_type)
                .ok_or_else(|| anyhow::anyhow!("{}: unknown texture type {}", name, texture_type))?,
        };
        Image::new(desc, bytes[header_len + name_len..].to_vec())
    }
}

/// 按扩展名选择解码器
#[derive(Clone)]
pub struct ImageCodecs {
    decoders: Vec<Arc<dyn ImageDecoder>>,
    fallback: Arc<dyn ImageDecoder>,
}

impl Default for ImageCodecs {
    fn default() -> Self {
        Self {
            decoders: vec![Arc::new(RawTextureCodec)],
            fallback: Arc::new(StandardImageDecoder),
        }
    }
}

impl ImageCodecs {
    /// 后注册的解码器优先
    pub fn register(&mut self, decoder: Arc<dyn ImageDecoder>) {
        self.decoders.insert(0, decoder);
    }

    pub fn decoder_for(&self, name: &str) -> &dyn ImageDecoder {
        let ext = file_extension(name).to_ascii_lowercase();
        self.decoders
            .iter()
            .find(|decoder| decoder.extensions().contains(&ext.as_str()))
            .unwrap_or(&self.fallback)
            .as_ref()
    }

    pub fn decode(&self, name: &str, bytes: &[u8]) -> anyhow::Result<Image> {
        let decoder = self.decoder_for(name);
        log::debug!("decoding '{}' with '{}'", name, decoder.name());
        decoder.decode(name, bytes)
    }
}

/// `a/b/sky.PNG` -> `PNG`
pub fn file_extension(name: &str) -> &str {
    let file = name.rsplit(['\\', '/']).next().unwrap_or(name);
    file.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
}
