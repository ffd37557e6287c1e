use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use texstream_gfx::backend::{GpuBackend, GpuTextureId};
use texstream_gfx::pixel_format::PixelFormat;
use texstream_gfx::texture_desc::{TextureDesc, TextureType};

use crate::error::StreamingError;
use crate::texture::{PoolSlot, TextureHandle};

new_key_type! { pub struct TexturePoolId; }

/// 新建 texture pool 时分配多少个 slice
///
/// 分辨率越高，一个 pool 中的 slice 越少。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSlicesPolicy {
    /// (最大分辨率, slice 数)，按分辨率从小到大排列
    pub thresholds: Vec<(u32, u16)>,
    /// 超过所有阈值时使用
    pub fallback: u16,
}

impl Default for PoolSlicesPolicy {
    fn default() -> Self {
        Self {
            thresholds: vec![(256, 16), (512, 8), (1024, 4)],
            fallback: 2,
        }
    }
}

impl PoolSlicesPolicy {
    pub fn num_slices_for(&self, width: u32, height: u32) -> u16 {
        let max_res = width.max(height);
        self.thresholds
            .iter()
            .find(|&&(resolution, _)| max_res <= resolution)
            .map(|&(_, slices)| slices)
            .unwrap_or(self.fallback)
            .max(1)
    }
}

/// 把多张同尺寸、同格式的纹理放进同一张 2D array 纹理
pub struct TexturePool {
    /// 用户可见的 id (metadata cache 中的 `poolId`)，0 表示自动创建的
    pool_id: u32,
    master: GpuTextureId,
    desc: TextureDesc,
    used_slots: Vec<TextureHandle>,
    /// 释放后可以复用的 slice
    available_slots: Vec<u32>,
    /// 曾经分配过的最大 slice + 1
    used_memory: u32,
    /// 手动预留的 pool，空了也不会被销毁
    manual: bool,
}

// getter
impl TexturePool {
    #[inline]
    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    #[inline]
    pub fn master_texture(&self) -> GpuTextureId {
        self.master
    }

    #[inline]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[inline]
    pub fn used_slots(&self) -> &[TextureHandle] {
        &self.used_slots
    }

    #[inline]
    pub fn used_memory(&self) -> u32 {
        self.used_memory
    }

    #[inline]
    pub fn is_manual(&self) -> bool {
        self.manual
    }

    #[inline]
    pub fn num_slices(&self) -> u32 {
        self.desc.depth_or_slices
    }

    #[inline]
    pub fn has_free_slot(&self) -> bool {
        !self.available_slots.is_empty() || self.used_memory < self.num_slices()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used_slots.is_empty()
    }

    fn matches(&self, desc: &TextureDesc, requested_pool_id: u32) -> bool {
        (requested_pool_id == 0 || self.pool_id == requested_pool_id)
            && self.desc.width == desc.width
            && self.desc.height == desc.height
            && self.desc.format == desc.format
            && self.desc.num_mips == desc.num_mips
    }
}

#[derive(Default)]
pub struct TexturePoolAllocator {
    pools: SlotMap<TexturePoolId, TexturePool>,
    policy: PoolSlicesPolicy,
}

// new & init
impl TexturePoolAllocator {
    pub fn new(policy: PoolSlicesPolicy) -> Self {
        Self {
            pools: SlotMap::with_key(),
            policy,
        }
    }
}

// getter
impl TexturePoolAllocator {
    #[inline]
    pub fn pool(&self, id: TexturePoolId) -> Option<&TexturePool> {
        self.pools.get(id)
    }

    #[inline]
    pub fn pools(&self) -> impl Iterator<Item = (TexturePoolId, &TexturePool)> {
        self.pools.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// 所有 pool 占用的 GPU 内存
    pub fn total_bytes(&self) -> usize {
        self.pools.values().map(|pool| pool.desc.size_bytes()).sum()
    }
}

impl TexturePoolAllocator {
    fn create_pool(
        &mut self,
        backend: &dyn GpuBackend,
        pool_id: u32,
        desc: TextureDesc,
        manual: bool,
    ) -> anyhow::Result<TexturePoolId> {
        let name = format!("_InternalTexPool{}x{}x{}_{}", desc.width, desc.height, desc.depth_or_slices, desc.format);
        let master = backend.create_texture(&desc, &name)?;
        log::info!("create texture pool '{}' (poolId {}, manual: {})", name, pool_id, manual);

        Ok(self.pools.insert(TexturePool {
            pool_id,
            master,
            desc,
            used_slots: Vec::with_capacity(desc.depth_or_slices as usize),
            available_slots: Vec::new(),
            used_memory: 0,
            manual,
        }))
    }

    /// 手动预留一个 pool，之后 `pool_id` 相同的纹理都会放进这里
    #[allow(clippy::too_many_arguments)]
    pub fn reserve_pool_id(
        &mut self,
        backend: &dyn GpuBackend,
        pool_id: u32,
        width: u32,
        height: u32,
        num_slices: u32,
        num_mips: u8,
        format: PixelFormat,
    ) -> anyhow::Result<TexturePoolId> {
        if self.pools.values().any(|pool| pool.manual && pool.pool_id == pool_id) {
            return Err(StreamingError::InvalidRequest(format!("pool id {} has already been reserved", pool_id)).into());
        }
        let desc = TextureDesc {
            width,
            height,
            depth_or_slices: num_slices,
            num_mips,
            format,
            texture_type: TextureType::Type2DArray,
        };
        anyhow::ensure!(desc.is_valid(), "invalid texture pool: {:?}", desc);
        self.create_pool(backend, pool_id, desc, true)
    }

    /// 为纹理分配一个 slice；没有合适的 pool 时创建新的
    pub fn reserve_slot(
        &mut self,
        backend: &dyn GpuBackend,
        texture: TextureHandle,
        desc: &TextureDesc,
        requested_pool_id: u32,
    ) -> anyhow::Result<PoolSlot> {
        let found = self
            .pools
            .iter()
            .find(|(_, pool)| pool.has_free_slot() && pool.matches(desc, requested_pool_id))
            .map(|(id, _)| id);

        let pool_id = match found {
            Some(id) => id,
            None => {
                let num_slices = self.policy.num_slices_for(desc.width, desc.height);
                let pool_desc = TextureDesc {
                    depth_or_slices: num_slices as u32,
                    texture_type: TextureType::Type2DArray,
                    ..*desc
                };
                self.create_pool(backend, requested_pool_id, pool_desc, false)?
            }
        };

        let pool = &mut self.pools[pool_id];
        // 优先复用释放过的 slice
        let slice = match pool.available_slots.pop() {
            Some(slice) => slice,
            None => {
                pool.used_memory += 1;
                pool.used_memory - 1
            }
        };
        pool.used_slots.push(texture);

        Ok(PoolSlot { pool: pool_id, slice })
    }

    /// 释放纹理占用的 slice；自动创建的 pool 空了之后会被销毁
    pub fn release_slot(&mut self, backend: &dyn GpuBackend, texture: TextureHandle, slot: PoolSlot) {
        let Some(pool) = self.pools.get_mut(slot.pool) else {
            log::error!("release slot from a texture pool that does not exist: {:?}", slot);
            return;
        };

        match pool.used_slots.iter().position(|&t| t == texture) {
            Some(index) => {
                pool.used_slots.swap_remove(index);
            }
            None => log::error!("texture {:?} is not in texture pool {:?}", texture, slot.pool),
        }

        if pool.used_memory == slot.slice + 1 {
            pool.used_memory -= 1;
        } else {
            pool.available_slots.push(slot.slice);
        }

        if pool.is_empty() && !pool.manual {
            let master = pool.master;
            self.pools.remove(slot.pool);
            backend.destroy_texture(master);
            log::info!("destroy empty texture pool {:?}", slot.pool);
        }
    }

    pub fn destroy_all(&mut self, backend: &dyn GpuBackend) {
        for (_, pool) in self.pools.drain() {
            backend.destroy_texture(pool.master);
        }
    }

    /// 手动预留的 pool，用于导出 metadata cache
    pub fn reserved_pools(&self) -> impl Iterator<Item = &TexturePool> {
        self.pools.values().filter(|pool| pool.manual)
    }
}

#[cfg(test)]
mod tests {
    use slotmap::KeyData;
    use texstream_gfx::headless::HeadlessGpu;

    use super::*;

    fn handle(i: u64) -> TextureHandle {
        TextureHandle::from(KeyData::from_ffi(i))
    }

    #[test]
    fn test_num_slices_policy() {
        let policy = PoolSlicesPolicy::default();
        assert_eq!(policy.num_slices_for(128, 256), 16);
        assert_eq!(policy.num_slices_for(512, 64), 8);
        assert_eq!(policy.num_slices_for(1024, 1024), 4);
        assert_eq!(policy.num_slices_for(4096, 16), 2);
    }

    #[test]
    fn test_slots_are_reused_and_pool_destroyed_when_empty() {
        let gpu = HeadlessGpu::default();
        let mut allocator = TexturePoolAllocator::new(PoolSlicesPolicy {
            thresholds: vec![],
            fallback: 2,
        });
        let desc = TextureDesc::new_2d(32, 32, 1, PixelFormat::Rgba8Unorm);

        let a = allocator.reserve_slot(&gpu, handle(1), &desc, 0).unwrap();
        let b = allocator.reserve_slot(&gpu, handle(2), &desc, 0).unwrap();
        assert_eq!((a.pool, a.slice), (b.pool, 0));
        assert_eq!(b.slice, 1);

        // pool 满了，创建第二个
        let c = allocator.reserve_slot(&gpu, handle(3), &desc, 0).unwrap();
        assert_ne!(c.pool, a.pool);
        assert_eq!(allocator.len(), 2);
        assert_eq!(gpu.live_texture_count(), 2);

        // 释放非末尾的 slice 进入可复用列表
        allocator.release_slot(&gpu, handle(1), a);
        let d = allocator.reserve_slot(&gpu, handle(4), &desc, 0).unwrap();
        assert_eq!((d.pool, d.slice), (a.pool, 0));

        allocator.release_slot(&gpu, handle(3), c);
        assert_eq!(allocator.len(), 1);
        assert_eq!(gpu.live_texture_count(), 1);

        // 末尾的 slice 直接收缩 used_memory
        allocator.release_slot(&gpu, handle(2), b);
        assert_eq!(allocator.pool(a.pool).unwrap().used_memory(), 1);
    }

    #[test]
    fn test_reserved_pool_survives_empty() {
        let gpu = HeadlessGpu::default();
        let mut allocator = TexturePoolAllocator::default();
        let id = allocator
            .reserve_pool_id(&gpu, 7, 64, 64, 4, 1, PixelFormat::Bc1Unorm)
            .unwrap();
        assert!(allocator.reserve_pool_id(&gpu, 7, 64, 64, 4, 1, PixelFormat::Bc1Unorm).is_err());

        let desc = TextureDesc::new_2d(64, 64, 1, PixelFormat::Bc1Unorm);
        let slot = allocator.reserve_slot(&gpu, handle(1), &desc, 7).unwrap();
        assert_eq!(slot.pool, id);

        allocator.release_slot(&gpu, handle(1), slot);
        assert!(allocator.pool(id).is_some());
        assert_eq!(allocator.reserved_pools().count(), 1);
    }
}
