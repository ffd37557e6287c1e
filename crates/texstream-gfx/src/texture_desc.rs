use serde::{Deserialize, Serialize};

use crate::pixel_format::PixelFormat;

/// 纹理类型
///
/// 数值与 metadata cache 文件中的 `texture_type` 字段一一对应，不能随意调整顺序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TextureType {
    #[default]
    Unknown = 0,
    Type1D = 1,
    Type1DArray = 2,
    Type2D = 3,
    Type2DArray = 4,
    TypeCube = 5,
    TypeCubeArray = 6,
    Type3D = 7,
}

impl TextureType {
    pub fn from_u32(value: u32) -> Option<Self> {
        let ty = match value {
            0 => Self::Unknown,
            1 => Self::Type1D,
            2 => Self::Type1DArray,
            3 => Self::Type2D,
            4 => Self::Type2DArray,
            5 => Self::TypeCube,
            6 => Self::TypeCubeArray,
            7 => Self::Type3D,
            _ => return None,
        };
        Some(ty)
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    #[inline]
    pub fn is_cubemap(self) -> bool {
        matches!(self, Self::TypeCube | Self::TypeCubeArray)
    }

    #[inline]
    pub fn is_3d(self) -> bool {
        self == Self::Type3D
    }
}

/// 纹理的"形状"：分辨率、格式、mip 数量和类型
///
/// 对于 3D 纹理 `depth_or_slices` 是深度，其余类型是数组切片数 (cubemap 为 6 的倍数)。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth_or_slices: u32,
    pub num_mips: u8,
    pub format: PixelFormat,
    pub texture_type: TextureType,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            depth_or_slices: 1,
            num_mips: 1,
            format: PixelFormat::Unknown,
            texture_type: TextureType::Unknown,
        }
    }
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, num_mips: u8, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            depth_or_slices: 1,
            num_mips,
            format,
            texture_type: TextureType::Type2D,
        }
    }

    /// 完整 mip 链的长度：`floor(log2(max(w, h, d))) + 1`
    pub fn max_mips(width: u32, height: u32, depth: u32) -> u8 {
        let max_dim = width.max(height).max(depth).max(1);
        (32 - max_dim.leading_zeros()) as u8
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        if self.texture_type.is_3d() { self.depth_or_slices } else { 1 }
    }

    #[inline]
    pub fn num_slices(&self) -> u32 {
        if self.texture_type.is_3d() { 1 } else { self.depth_or_slices }
    }

    /// 指定 mip 层级的 (width, height, depth)
    pub fn mip_extent(&self, mip: u8) -> (u32, u32, u32) {
        (
            (self.width >> mip).max(1),
            (self.height >> mip).max(1),
            (self.depth() >> mip).max(1),
        )
    }

    /// 指定 mip 层级 (包含所有切片) 的字节数
    pub fn mip_size_bytes(&self, mip: u8) -> usize {
        let (w, h, d) = self.mip_extent(mip);
        self.format.size_bytes(w, h, d, self.num_slices())
    }

    /// 整个 mip 链的字节数
    pub fn size_bytes(&self) -> usize {
        (0..self.num_mips).map(|mip| self.mip_size_bytes(mip)).sum()
    }

    /// 是否是一个合法的、可以分配 GPU 资源的描述
    pub fn is_valid(&self) -> bool {
        self.width >= 1
            && self.height >= 1
            && self.depth_or_slices >= 1
            && self.num_mips >= 1
            && self.format != PixelFormat::Unknown
            && self.texture_type != TextureType::Unknown
    }
}

/// 一块纹理区域
///
/// 既用来描述 staging texture 中的一段映射内存，也用来描述目标纹理中的一个子区域。
/// `bytes_per_row` 和 `bytes_per_image` 描述的是源数据的排列方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureBox {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub slice_start: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub num_slices: u32,
    pub bytes_per_row: usize,
    pub bytes_per_image: usize,
}

impl TextureBox {
    pub fn new(width: u32, height: u32, depth: u32, num_slices: u32, format: PixelFormat) -> Self {
        Self {
            x: 0,
            y: 0,
            z: 0,
            slice_start: 0,
            width,
            height,
            depth,
            num_slices,
            bytes_per_row: format.bytes_per_row(width),
            bytes_per_image: format.bytes_per_image(width, height),
        }
    }

    #[inline]
    pub fn depth_or_slices(&self) -> u32 {
        self.depth.max(self.num_slices)
    }

    /// 区域的总字节数
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.bytes_per_image * self.depth_or_slices() as usize
    }

    pub fn equal_size(&self, other: &TextureBox) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.depth == other.depth
            && self.num_slices == other.num_slices
    }

    /// `other` 是否完全落在当前区域内
    pub fn fully_contains(&self, other: &TextureBox) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.z >= self.z
            && other.slice_start >= self.slice_start
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
            && other.z + other.depth <= self.z + self.depth
            && other.slice_start + other.num_slices <= self.slice_start + self.num_slices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_mips() {
        assert_eq!(TextureDesc::max_mips(1, 1, 1), 1);
        assert_eq!(TextureDesc::max_mips(256, 256, 1), 9);
        assert_eq!(TextureDesc::max_mips(300, 17, 1), 9);
    }

    #[test]
    fn test_mip_chain_size() {
        let desc = TextureDesc::new_2d(4, 4, 3, PixelFormat::Rgba8Unorm);
        // 4x4 + 2x2 + 1x1
        assert_eq!(desc.size_bytes(), (16 + 4 + 1) * 4);
        assert_eq!(desc.mip_extent(5), (1, 1, 1));
    }

    #[test]
    fn test_cube_slices() {
        let desc = TextureDesc {
            width: 8,
            height: 8,
            depth_or_slices: 6,
            num_mips: 1,
            format: PixelFormat::R8Unorm,
            texture_type: TextureType::TypeCube,
        };
        assert_eq!(desc.depth(), 1);
        assert_eq!(desc.num_slices(), 6);
        assert_eq!(desc.size_bytes(), 8 * 8 * 6);
    }

    #[test]
    fn test_box_containment() {
        let full = TextureBox::new(16, 16, 1, 6, PixelFormat::Rgba8Unorm);
        let mut face = TextureBox::new(16, 16, 1, 1, PixelFormat::Rgba8Unorm);
        face.slice_start = 5;
        assert!(full.fully_contains(&face));
        face.slice_start = 6;
        assert!(!full.fully_contains(&face));
    }
}
