use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 流送系统支持的像素格式
///
/// 只覆盖了纹理资源常见的格式。sRGB 和 UNORM 的变体属于同一个 family，
/// staging texture 是按 family 来匹配的 (字节布局完全一致，只是采样时的解释不同)。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PixelFormat {
    Unknown,
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    R16Float,
    Rgba16Float,
    R32Float,
    Rgba32Float,
    Bc1Unorm,
    Bc1UnormSrgb,
    Bc3Unorm,
    Bc3UnormSrgb,
    Bc5Unorm,
    Bc7Unorm,
    Bc7UnormSrgb,
}

const ALL_FORMATS: [PixelFormat; 18] = [
    PixelFormat::Unknown,
    PixelFormat::R8Unorm,
    PixelFormat::Rg8Unorm,
    PixelFormat::Rgba8Unorm,
    PixelFormat::Rgba8UnormSrgb,
    PixelFormat::Bgra8Unorm,
    PixelFormat::Bgra8UnormSrgb,
    PixelFormat::R16Float,
    PixelFormat::Rgba16Float,
    PixelFormat::R32Float,
    PixelFormat::Rgba32Float,
    PixelFormat::Bc1Unorm,
    PixelFormat::Bc1UnormSrgb,
    PixelFormat::Bc3Unorm,
    PixelFormat::Bc3UnormSrgb,
    PixelFormat::Bc5Unorm,
    PixelFormat::Bc7Unorm,
    PixelFormat::Bc7UnormSrgb,
];

// 属性查询
impl PixelFormat {
    pub fn all() -> &'static [PixelFormat] {
        &ALL_FORMATS
    }

    /// 是否是块压缩格式 (4x4 block)
    #[inline]
    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            Self::Bc1Unorm
                | Self::Bc1UnormSrgb
                | Self::Bc3Unorm
                | Self::Bc3UnormSrgb
                | Self::Bc5Unorm
                | Self::Bc7Unorm
                | Self::Bc7UnormSrgb
        )
    }

    #[inline]
    pub fn is_srgb(self) -> bool {
        matches!(self, Self::Rgba8UnormSrgb | Self::Bgra8UnormSrgb | Self::Bc1UnormSrgb | Self::Bc3UnormSrgb | Self::Bc7UnormSrgb)
    }

    /// 非压缩格式：每个像素的字节数
    ///
    /// 压缩格式返回 0，需要使用 [`Self::compressed_block_bytes`]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Unknown => 0,
            Self::R8Unorm => 1,
            Self::Rg8Unorm => 2,
            Self::Rgba8Unorm | Self::Rgba8UnormSrgb | Self::Bgra8Unorm | Self::Bgra8UnormSrgb => 4,
            Self::R16Float => 2,
            Self::Rgba16Float => 8,
            Self::R32Float => 4,
            Self::Rgba32Float => 16,
            _ => 0,
        }
    }

    /// 压缩格式：每个 4x4 block 的字节数
    pub fn compressed_block_bytes(self) -> usize {
        match self {
            Self::Bc1Unorm | Self::Bc1UnormSrgb => 8,
            Self::Bc3Unorm | Self::Bc3UnormSrgb | Self::Bc5Unorm | Self::Bc7Unorm | Self::Bc7UnormSrgb => 16,
            _ => 0,
        }
    }

    /// 同一个 family 的格式有完全相同的内存布局
    pub fn family(self) -> PixelFormat {
        match self {
            Self::Rgba8UnormSrgb => Self::Rgba8Unorm,
            Self::Bgra8UnormSrgb => Self::Bgra8Unorm,
            Self::Bc1UnormSrgb => Self::Bc1Unorm,
            Self::Bc3UnormSrgb => Self::Bc3Unorm,
            Self::Bc7UnormSrgb => Self::Bc7Unorm,
            other => other,
        }
    }

    /// 对应的 sRGB 格式；没有 sRGB 变体的格式原样返回
    pub fn srgb_equivalent(self) -> PixelFormat {
        match self {
            Self::Rgba8Unorm => Self::Rgba8UnormSrgb,
            Self::Bgra8Unorm => Self::Bgra8UnormSrgb,
            Self::Bc1Unorm => Self::Bc1UnormSrgb,
            Self::Bc3Unorm => Self::Bc3UnormSrgb,
            Self::Bc7Unorm => Self::Bc7UnormSrgb,
            other => other,
        }
    }
}

// 尺寸计算
impl PixelFormat {
    /// 一行数据的字节数 (紧密排列)
    ///
    /// 压缩格式返回的是一行 block 的字节数
    pub fn bytes_per_row(self, width: u32) -> usize {
        if self.is_compressed() {
            width.div_ceil(4) as usize * self.compressed_block_bytes()
        } else {
            width as usize * self.bytes_per_pixel()
        }
    }

    /// 一个 2D 切片的字节数
    pub fn bytes_per_image(self, width: u32, height: u32) -> usize {
        let rows = if self.is_compressed() { height.div_ceil(4) } else { height };
        self.bytes_per_row(width) * rows as usize
    }

    /// 一块 (width, height, depth, slices) 区域的总字节数
    ///
    /// # Params
    /// * `depth` - 3D 纹理的深度，非 3D 纹理传 1
    /// * `slices` - 数组纹理的切片数，非数组纹理传 1
    pub fn size_bytes(self, width: u32, height: u32, depth: u32, slices: u32) -> usize {
        self.bytes_per_image(width, height) * depth as usize * slices as usize
    }
}

impl PixelFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "PFG_UNKNOWN",
            Self::R8Unorm => "PFG_R8_UNORM",
            Self::Rg8Unorm => "PFG_RG8_UNORM",
            Self::Rgba8Unorm => "PFG_RGBA8_UNORM",
            Self::Rgba8UnormSrgb => "PFG_RGBA8_UNORM_SRGB",
            Self::Bgra8Unorm => "PFG_BGRA8_UNORM",
            Self::Bgra8UnormSrgb => "PFG_BGRA8_UNORM_SRGB",
            Self::R16Float => "PFG_R16_FLOAT",
            Self::Rgba16Float => "PFG_RGBA16_FLOAT",
            Self::R32Float => "PFG_R32_FLOAT",
            Self::Rgba32Float => "PFG_RGBA32_FLOAT",
            Self::Bc1Unorm => "PFG_BC1_UNORM",
            Self::Bc1UnormSrgb => "PFG_BC1_UNORM_SRGB",
            Self::Bc3Unorm => "PFG_BC3_UNORM",
            Self::Bc3UnormSrgb => "PFG_BC3_UNORM_SRGB",
            Self::Bc5Unorm => "PFG_BC5_UNORM",
            Self::Bc7Unorm => "PFG_BC7_UNORM",
            Self::Bc7UnormSrgb => "PFG_BC7_UNORM_SRGB",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_FORMATS
            .iter()
            .copied()
            .find(|format| format.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown pixel format: {s}"))
    }
}

impl TryFrom<String> for PixelFormat {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PixelFormat> for String {
    fn from(value: PixelFormat) -> Self {
        value.as_str().to_string()
    }
}
