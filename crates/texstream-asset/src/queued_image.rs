use crate::filters::TextureFilter;
use crate::image::Image;
use crate::load_request::SLICE_ALL;
use crate::texture::TextureHandle;

/// 还没有完全上传的图片
///
/// staging 的空间不一定能一次放下所有的 mip，每个 (mip, slice) 是否还需要上传记录在 bitset 中，
/// bitset 清空时这张图片才算处理完成。
pub struct QueuedImage {
    pub texture: TextureHandle,
    pub texture_name: String,
    pub generation: u32,
    pub image: Image,
    /// 上传到目标纹理的哪个 slice (或 3D 纹理的 depth)，[`SLICE_ALL`] 表示整张纹理
    pub dst_slice_or_depth: u32,
    /// 执行过 streaming 阶段的 filter，完成后随 `NotifyDataIsReady` 交给主线程
    pub filters: Vec<Box<dyn TextureFilter>>,
    /// 上传完成后图片作为系统内存副本交给主线程
    pub keep_sysram_copy: bool,

    num_slices: u32,
    pending: Vec<u64>,
}

impl QueuedImage {
    pub fn new(
        texture: TextureHandle,
        texture_name: String,
        generation: u32,
        image: Image,
        dst_slice_or_depth: u32,
        filters: Vec<Box<dyn TextureFilter>>,
    ) -> Self {
        let num_slices = image.depth_or_slices().max(1);
        let num_bits = image.num_mips() as usize * num_slices as usize;
        let mut queued = Self {
            texture,
            texture_name,
            generation,
            image,
            dst_slice_or_depth,
            filters,
            keep_sysram_copy: false,
            num_slices,
            pending: vec![0; num_bits.div_ceil(64)],
        };

        // 3D 纹理越往后的 mip 深度越小，只标记真实存在的 (mip, depth)
        for mip in 0..queued.image.num_mips() {
            for slice in 0..queued.image.mip_depth_or_slices(mip) {
                let (word, mask) = queued.bit(mip, slice);
                queued.pending[word] |= mask;
            }
        }
        queued
    }

    #[inline]
    fn bit(&self, mip: u8, slice: u32) -> (usize, u64) {
        let index = mip as usize * self.num_slices as usize + slice as usize;
        (index / 64, 1u64 << (index % 64))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.iter().all(|&word| word == 0)
    }

    #[inline]
    pub fn is_mip_slice_queued(&self, mip: u8, slice: u32) -> bool {
        let (word, mask) = self.bit(mip, slice);
        self.pending[word] & mask != 0
    }

    #[inline]
    pub fn unqueue_mip_slice(&mut self, mip: u8, slice: u32) {
        let (word, mask) = self.bit(mip, slice);
        self.pending[word] &= !mask;
    }

    /// 还有数据没上传的最小 mip；全部完成时返回 `None`
    pub fn min_mip(&self) -> Option<u8> {
        self.pending
            .iter()
            .enumerate()
            .find(|&(_, &word)| word != 0)
            .map(|(i, &word)| ((i * 64 + word.trailing_zeros() as usize) / self.num_slices as usize) as u8)
    }

    /// 还有数据没上传的最大 mip + 1；全部完成时返回 0
    pub fn max_mip_plus_one(&self) -> u8 {
        self.pending
            .iter()
            .enumerate()
            .rev()
            .find(|&(_, &word)| word != 0)
            .map(|(i, &word)| {
                let last_bit = i * 64 + 64 - word.leading_zeros() as usize;
                last_bit.div_ceil(self.num_slices as usize) as u8
            })
            .unwrap_or(0)
    }

    /// 是否只是多文件 cubemap 中的一个面
    #[inline]
    pub fn is_partial(&self) -> bool {
        self.dst_slice_or_depth != SLICE_ALL
    }
}

#[cfg(test)]
mod tests {
    use slotmap::KeyData;
    use texstream_gfx::pixel_format::PixelFormat;
    use texstream_gfx::texture_desc::{TextureDesc, TextureType};

    use super::*;

    fn queued(desc: TextureDesc) -> QueuedImage {
        let image = Image::new(desc, vec![0; desc.size_bytes()]).unwrap();
        QueuedImage::new(TextureHandle::from(KeyData::from_ffi(1)), "t".to_string(), 0, image, SLICE_ALL, Vec::new())
    }

    #[test]
    fn test_mip_range_shrinks_as_slices_are_uploaded() {
        let mut q = queued(TextureDesc {
            width: 4,
            height: 4,
            depth_or_slices: 6,
            num_mips: 3,
            format: PixelFormat::Rgba8Unorm,
            texture_type: TextureType::TypeCube,
        });
        assert_eq!(q.min_mip(), Some(0));
        assert_eq!(q.max_mip_plus_one(), 3);

        for slice in 0..6 {
            q.unqueue_mip_slice(0, slice);
        }
        assert_eq!(q.min_mip(), Some(1));
        for slice in 0..6 {
            q.unqueue_mip_slice(2, slice);
        }
        assert_eq!(q.max_mip_plus_one(), 2);
        assert!(!q.is_empty());

        for slice in 0..6 {
            q.unqueue_mip_slice(1, slice);
        }
        assert!(q.is_empty());
        assert_eq!(q.min_mip(), None);
    }

    #[test]
    fn test_large_mip_chain_exceeds_one_word() {
        // 12 mips * 6 slices = 72 bit
        let q = queued(TextureDesc {
            width: 2048,
            height: 1,
            depth_or_slices: 6,
            num_mips: 12,
            format: PixelFormat::R8Unorm,
            texture_type: TextureType::TypeCube,
        });
        assert!(q.is_mip_slice_queued(11, 5));
        assert_eq!(q.max_mip_plus_one(), 12);
    }

    #[test]
    fn test_volume_only_marks_existing_depth() {
        let q = queued(TextureDesc {
            width: 4,
            height: 4,
            depth_or_slices: 4,
            num_mips: 3,
            format: PixelFormat::R8Unorm,
            texture_type: TextureType::Type3D,
        });
        assert!(q.is_mip_slice_queued(0, 3));
        assert!(q.is_mip_slice_queued(1, 1));
        assert!(!q.is_mip_slice_queued(1, 2));
        assert!(q.is_mip_slice_queued(2, 0));
        assert!(!q.is_mip_slice_queued(2, 1));
    }
}
