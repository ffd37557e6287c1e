use bitflags::bitflags;
use slotmap::new_key_type;
use texstream_gfx::backend::GpuTextureId;
use texstream_gfx::pixel_format::PixelFormat;
use texstream_gfx::texture_desc::{TextureDesc, TextureType};

use crate::error::StreamingError;
use crate::filters::FilterFlags;
use crate::image::PixelBuffer;
use crate::texture_pool::TexturePoolId;

// 纹理句柄
// worker 线程和 command 只持有句柄，纹理本身只存在于主线程；
// 句柄失效 (纹理已销毁) 可以被检测到，不会访问到已经释放的纹理
new_key_type! { pub struct TextureHandle; }

/// 纹理数据所在的位置
///
/// `OnStorage -> OnSystemRam -> Resident`，允许跳级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GpuResidency {
    /// 只有元数据，没有占用任何内存
    #[default]
    OnStorage,
    /// 数据在系统内存中
    OnSystemRam,
    /// 数据在 GPU 上
    Resident,
}

/// 从 GPU 换出时如何处理数据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GpuPageOutStrategy {
    /// 直接丢弃，之后需要重新从磁盘加载
    Discard,
    /// 换出到 OnSystemRam 时从 GPU 读回
    #[default]
    SaveToSystemRam,
    /// 常驻时也保留一份系统内存副本，换出时不需要读回
    AlwaysKeepSystemRamCopy,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureFlags: u32 {
        /// 使用 texture pool 中的一个 slice，而不是单独的 GPU 纹理
        const AUTOMATIC_BATCHING = 1 << 0;
        /// 颜色数据，可以的话使用 sRGB 格式
        const PREFERS_LOADING_AS_SRGB = 1 << 1;
        /// 手动填充内容 (render target 等)，不从文件加载
        const MANUAL = 1 << 2;
    }
}

/// 纹理在 texture pool 中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolSlot {
    pub pool: TexturePoolId,
    pub slice: u32,
}

/// 由 manager 管理的纹理
///
/// 只存在于主线程。形状 (分辨率、格式、mip、类型) 只有在 `OnStorage` 时可以修改，
/// 一旦分配了内存就被冻结，直到回到 `OnStorage`。
#[derive(Debug)]
pub struct TextureGpu {
    name: String,
    alias: String,
    resource_group: String,

    page_out_strategy: GpuPageOutStrategy,
    flags: TextureFlags,
    filters: FilterFlags,
    /// 期望使用的 texture pool，0 表示自动
    requested_pool_id: u32,

    desc: TextureDesc,

    residency: GpuResidency,
    /// 所有排队的任务完成之后的驻留状态
    next_residency: GpuResidency,
    /// 还有多少次驻留状态的变化没有完成
    pending_residency_changes: u32,
    data_ready: bool,

    gpu_texture: Option<GpuTextureId>,
    pool_slot: Option<PoolSlot>,
    sysram_copy: Option<PixelBuffer>,

    /// 每次重新发起加载都会加一，用来丢弃过期的加载结果
    load_generation: u32,
}

// new & init
impl TextureGpu {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        alias: String,
        resource_group: String,
        page_out_strategy: GpuPageOutStrategy,
        flags: TextureFlags,
        filters: FilterFlags,
        initial_type: TextureType,
        requested_pool_id: u32,
    ) -> Self {
        Self {
            name,
            alias,
            resource_group,
            page_out_strategy,
            flags,
            filters,
            requested_pool_id,
            desc: TextureDesc {
                texture_type: initial_type,
                ..Default::default()
            },
            residency: GpuResidency::OnStorage,
            next_residency: GpuResidency::OnStorage,
            pending_residency_changes: 0,
            data_ready: false,
            gpu_texture: None,
            pool_slot: None,
            sysram_copy: None,
            load_generation: 0,
        }
    }
}

// getter
impl TextureGpu {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    #[inline]
    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    #[inline]
    pub fn page_out_strategy(&self) -> GpuPageOutStrategy {
        self.page_out_strategy
    }

    #[inline]
    pub fn flags(&self) -> TextureFlags {
        self.flags
    }

    #[inline]
    pub fn filters(&self) -> FilterFlags {
        self.filters
    }

    #[inline]
    pub fn requested_pool_id(&self) -> u32 {
        self.requested_pool_id
    }

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
    pub fn pixel_format(&self) -> PixelFormat {
        self.desc.format
    }

    #[inline]
    pub fn texture_type(&self) -> TextureType {
        self.desc.texture_type
    }

    #[inline]
    pub fn residency(&self) -> GpuResidency {
        self.residency
    }

    #[inline]
    pub fn next_residency(&self) -> GpuResidency {
        self.next_residency
    }

    #[inline]
    pub fn pending_residency_changes(&self) -> u32 {
        self.pending_residency_changes
    }

    /// 数据已经全部上传到 GPU，可以用于渲染
    #[inline]
    pub fn is_data_ready(&self) -> bool {
        self.data_ready && self.residency == GpuResidency::Resident
    }

    /// 形状已经确定 (可能来自 metadata cache)，可以据此创建依赖它的资源
    #[inline]
    pub fn is_metadata_ready(&self) -> bool {
        self.residency == GpuResidency::Resident && self.next_residency == GpuResidency::Resident
    }

    #[inline]
    pub fn is_manual(&self) -> bool {
        self.flags.contains(TextureFlags::MANUAL)
    }

    #[inline]
    pub fn has_automatic_batching(&self) -> bool {
        self.flags.contains(TextureFlags::AUTOMATIC_BATCHING)
    }

    #[inline]
    pub fn gpu_texture(&self) -> Option<GpuTextureId> {
        self.gpu_texture
    }

    #[inline]
    pub fn pool_slot(&self) -> Option<PoolSlot> {
        self.pool_slot
    }

    #[inline]
    pub fn sysram_copy(&self) -> Option<&[u8]> {
        self.sysram_copy.as_ref().map(|buffer| buffer.as_slice())
    }

    #[inline]
    pub fn load_generation(&self) -> u32 {
        self.load_generation
    }

    /// 纹理完整数据的字节数
    pub fn size_bytes(&self) -> usize {
        if self.desc.is_valid() { self.desc.size_bytes() } else { 0 }
    }
}

// 形状：只允许在 OnStorage 时修改
impl TextureGpu {
    fn check_shape_mutable(&self) -> Result<(), StreamingError> {
        if self.residency != GpuResidency::OnStorage {
            return Err(StreamingError::invalid_state(
                &self.name,
                format!("shape can only be changed while OnStorage (currently {:?})", self.residency),
            ));
        }
        Ok(())
    }

    pub fn set_resolution(&mut self, width: u32, height: u32, depth_or_slices: u32) -> anyhow::Result<()> {
        self.check_shape_mutable()?;
        self.desc.width = width;
        self.desc.height = height;
        self.desc.depth_or_slices = depth_or_slices;
        Ok(())
    }

    pub fn set_pixel_format(&mut self, format: PixelFormat) -> anyhow::Result<()> {
        self.check_shape_mutable()?;
        self.desc.format = if self.flags.contains(TextureFlags::PREFERS_LOADING_AS_SRGB) {
            format.srgb_equivalent()
        } else {
            format
        };
        Ok(())
    }

    pub fn set_num_mips(&mut self, num_mips: u8) -> anyhow::Result<()> {
        self.check_shape_mutable()?;
        self.desc.num_mips = num_mips;
        Ok(())
    }

    pub fn set_texture_type(&mut self, texture_type: TextureType) -> anyhow::Result<()> {
        self.check_shape_mutable()?;
        self.desc.texture_type = texture_type;
        Ok(())
    }

    pub(crate) fn set_desc(&mut self, desc: TextureDesc) -> Result<(), StreamingError> {
        self.check_shape_mutable()?;
        self.desc = desc;
        Ok(())
    }
}

// 状态修改，只由 manager 调用
impl TextureGpu {
    pub(crate) fn set_residency(&mut self, residency: GpuResidency) {
        self.residency = residency;
    }

    pub(crate) fn set_next_residency(&mut self, residency: GpuResidency) {
        self.next_residency = residency;
    }

    pub(crate) fn add_pending_residency_change(&mut self) {
        self.pending_residency_changes += 1;
    }

    pub(crate) fn remove_pending_residency_change(&mut self) {
        debug_assert!(self.pending_residency_changes > 0, "'{}': pending residency changes underflow", self.name);
        self.pending_residency_changes = self.pending_residency_changes.saturating_sub(1);
    }

    pub(crate) fn set_data_ready(&mut self, ready: bool) {
        self.data_ready = ready;
    }

    pub(crate) fn set_gpu_texture(&mut self, texture: Option<GpuTextureId>) {
        self.gpu_texture = texture;
    }

    pub(crate) fn set_pool_slot(&mut self, slot: Option<PoolSlot>) {
        self.pool_slot = slot;
    }

    pub(crate) fn set_sysram_copy(&mut self, copy: Option<PixelBuffer>) {
        self.sysram_copy = copy;
    }

    pub(crate) fn take_sysram_copy(&mut self) -> Option<PixelBuffer> {
        self.sysram_copy.take()
    }

    pub(crate) fn bump_load_generation(&mut self) -> u32 {
        self.load_generation = self.load_generation.wrapping_add(1);
        self.load_generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(flags: TextureFlags) -> TextureGpu {
        TextureGpu::new(
            "brick.png".to_string(),
            "brick".to_string(),
            String::new(),
            GpuPageOutStrategy::Discard,
            flags,
            FilterFlags::empty(),
            TextureType::Type2D,
            0,
        )
    }

    #[test]
    fn test_shape_is_frozen_outside_storage() {
        let mut tex = texture(TextureFlags::empty());
        tex.set_resolution(64, 32, 1).unwrap();
        tex.set_pixel_format(PixelFormat::Rgba8Unorm).unwrap();
        assert_eq!((tex.width(), tex.height()), (64, 32));

        tex.set_residency(GpuResidency::Resident);
        let err = tex.set_resolution(16, 16, 1).unwrap_err();
        assert!(matches!(err.downcast_ref::<StreamingError>(), Some(StreamingError::InvalidState { .. })));
        assert_eq!(tex.width(), 64);
    }

    #[test]
    fn test_srgb_preference_applies_to_format() {
        let mut tex = texture(TextureFlags::PREFERS_LOADING_AS_SRGB);
        tex.set_pixel_format(PixelFormat::Bc1Unorm).unwrap();
        assert_eq!(tex.pixel_format(), PixelFormat::Bc1UnormSrgb);
    }

    #[test]
    fn test_readiness() {
        let mut tex = texture(TextureFlags::empty());
        assert!(!tex.is_metadata_ready());

        tex.set_residency(GpuResidency::Resident);
        tex.set_next_residency(GpuResidency::Resident);
        assert!(tex.is_metadata_ready());
        assert!(!tex.is_data_ready());

        tex.set_data_ready(true);
        assert!(tex.is_data_ready());
    }
}
