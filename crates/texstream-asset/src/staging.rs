use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use texstream_gfx::backend::GpuBackend;
use texstream_gfx::pixel_format::PixelFormat;
use texstream_gfx::texture_desc::TextureBox;

/// 复用中的 staging 至少要用掉这么多百分比的容量
pub const DEFAULT_CONSUMPTION_RATIO: usize = 50;

/// 一段记录在 usage stats 中、多少轮没有被 worker 使用就会被遗忘
const USAGE_STATS_LOOP_COUNT: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StagingTextureId(pub u64);

/// staging 中映射出来的一段内存
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingRegion {
    pub staging: StagingTextureId,
    pub offset: usize,
    /// 这段内存中数据的排列方式
    pub src_box: TextureBox,
}

/// CPU 可写、GPU 可读的中转内存
///
/// 同一个 family 的任意形状都可以放进来，只要总字节数不超过容量。
/// 映射是一个简单的 bump allocator：`start_map_region` 之后依次向后分配，直到主线程把它还回 pool。
#[derive(Debug)]
pub struct StagingTexture {
    id: StagingTextureId,
    format_family: PixelFormat,
    width: u32,
    height: u32,
    depth: u32,
    num_slices: u32,

    data: Vec<u8>,
    cursor: usize,
    /// GPU 最后一次读取这块内存的帧
    last_frame_used: u64,
}

// new & init
impl StagingTexture {
    fn new(id: StagingTextureId, width: u32, height: u32, depth: u32, num_slices: u32, format: PixelFormat, frame: u64) -> Self {
        let family = format.family();
        let capacity = family.size_bytes(width, height, depth, num_slices);
        Self {
            id,
            format_family: family,
            width,
            height,
            depth,
            num_slices,
            data: vec![0; capacity],
            cursor: 0,
            last_frame_used: frame,
        }
    }
}

// getter
impl StagingTexture {
    #[inline]
    pub fn id(&self) -> StagingTextureId {
        self.id
    }

    #[inline]
    pub fn format_family(&self) -> PixelFormat {
        self.format_family
    }

    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn last_frame_used(&self) -> u64 {
        self.last_frame_used
    }

    #[inline]
    pub fn mapped_bytes(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn region_data(&self, region: &StagingRegion) -> &[u8] {
        &self.data[region.offset..region.offset + region.src_box.size_bytes()]
    }

    pub fn region_data_mut(&mut self, region: &StagingRegion) -> &mut [u8] {
        &mut self.data[region.offset..region.offset + region.src_box.size_bytes()]
    }

    pub fn describe(&self) -> String {
        format!(
            "{}x{}x{}x{} {} ({} bytes)",
            self.width,
            self.height,
            self.depth,
            self.num_slices,
            self.format_family,
            self.size_bytes()
        )
    }
}

// tools
impl StagingTexture {
    /// 格式兼容，并且容量足够放下这块区域
    pub fn supports_format(&self, width: u32, height: u32, depth: u32, num_slices: u32, format: PixelFormat) -> bool {
        format.family() == self.format_family && format.size_bytes(width, height, depth, num_slices) <= self.size_bytes()
    }

    #[inline]
    pub fn is_smaller_than(&self, other: &StagingTexture) -> bool {
        self.size_bytes() < other.size_bytes()
    }

    /// GPU 可能还在读取上一次映射的内容
    pub fn upload_will_stall(&self, backend: &dyn GpuBackend) -> bool {
        !backend.is_frame_finished(self.last_frame_used)
    }

    /// 开始一轮新的映射，之前的内容作废
    pub fn start_map_region(&mut self, backend: &dyn GpuBackend) {
        if self.upload_will_stall(backend) {
            backend.wait_for_frame(self.last_frame_used);
        }
        self.cursor = 0;
    }

    /// 分配一段紧密排列的内存；剩余空间不足时返回 `None`
    pub fn map_region(&mut self, width: u32, height: u32, depth: u32, num_slices: u32, format: PixelFormat) -> Option<StagingRegion> {
        if format.family() != self.format_family {
            return None;
        }
        let src_box = TextureBox::new(width, height, depth, num_slices, format);
        let size = src_box.size_bytes();
        if self.cursor + size > self.size_bytes() {
            return None;
        }

        let region = StagingRegion {
            staging: self.id,
            offset: self.cursor,
            src_box,
        };
        self.cursor += size;
        Some(region)
    }

    /// 这一轮的映射结束；映射过内容就意味着 GPU 会在 `frame` 中读取它
    pub fn stop_map_region(&mut self, frame: u64) {
        if self.cursor > 0 {
            self.last_frame_used = frame;
        }
        self.cursor = 0;
    }
}

/// 所有 staging texture 的所有者
///
/// - `available` 中的 staging 按照还回来的先后排列，越靠前的越久没有使用
/// - 借出去的 staging (预热列表、worker、主线程) 只记录字节数，用于预算
pub struct StagingTexturePool {
    backend: Arc<dyn GpuBackend>,
    available: Vec<StagingTexture>,
    in_use_bytes: usize,
    max_budget_bytes: usize,
    next_id: u64,
}

// new & init
impl StagingTexturePool {
    pub fn new(backend: Arc<dyn GpuBackend>, max_budget_bytes: usize) -> Self {
        Self {
            backend,
            available: Vec::new(),
            in_use_bytes: 0,
            max_budget_bytes,
            next_id: 0,
        }
    }
}

// getter
impl StagingTexturePool {
    #[inline]
    pub fn backend(&self) -> &dyn GpuBackend {
        self.backend.as_ref()
    }

    #[inline]
    pub fn available(&self) -> &[StagingTexture] {
        &self.available
    }

    #[inline]
    pub fn available_bytes(&self) -> usize {
        self.available.iter().map(StagingTexture::size_bytes).sum()
    }

    #[inline]
    pub fn in_use_bytes(&self) -> usize {
        self.in_use_bytes
    }

    /// 所有 staging 占用的内存
    #[inline]
    pub fn consumed_bytes(&self) -> usize {
        self.available_bytes() + self.in_use_bytes
    }

    #[inline]
    pub fn max_budget_bytes(&self) -> usize {
        self.max_budget_bytes
    }

    pub fn set_max_budget_bytes(&mut self, bytes: usize) {
        self.max_budget_bytes = bytes;
    }
}

impl StagingTexturePool {
    /// 借出一个 staging texture
    ///
    /// 优先选择容量最小、并且不会导致 GPU 等待的可复用 staging；
    /// 没有合适的就检查预算，必要时等待 GPU 或者释放内存，最后再创建新的。
    ///
    /// # Params
    /// * `min_consumption_ratio` - 百分比；复用的 staging 中，这次请求至少要占用这么多容量，
    ///   避免小请求占用大的 staging。0 表示不限制
    pub fn get_staging_texture(
        &mut self,
        width: u32,
        height: u32,
        depth: u32,
        num_slices: u32,
        format: PixelFormat,
        min_consumption_ratio: usize,
    ) -> StagingTexture {
        let _span = tracy_client::span!("StagingTexturePool::get_staging_texture");
        debug_assert!(min_consumption_ratio <= 100, "invalid consumption ratio");

        let backend = self.backend.as_ref();
        let mut best: Option<usize> = None;
        for (i, staging) in self.available.iter().enumerate() {
            if staging.supports_format(width, height, depth, num_slices, format)
                && best.is_none_or(|b| staging.is_smaller_than(&self.available[b]))
                && !staging.upload_will_stall(backend)
            {
                best = Some(i);
            }
        }

        if let Some(b) = best
            && min_consumption_ratio != 0
        {
            let required = format.size_bytes(width, height, depth, num_slices);
            if required * 100 / self.available[b].size_bytes().max(1) < min_consumption_ratio {
                best = None;
            }
        }

        if let Some(b) = best {
            return self.take_available(b);
        }

        if let Some(staging) = self.check_staging_texture_limits(width, height, depth, num_slices, format, min_consumption_ratio) {
            return staging;
        }

        self.create_staging_texture(width, height, depth, num_slices, format)
    }

    fn take_available(&mut self, index: usize) -> StagingTexture {
        let staging = self.available.remove(index);
        self.in_use_bytes += staging.size_bytes();
        staging
    }

    fn create_staging_texture(&mut self, width: u32, height: u32, depth: u32, num_slices: u32, format: PixelFormat) -> StagingTexture {
        let id = StagingTextureId(self.next_id);
        self.next_id += 1;

        // 新建的 staging 没有被 GPU 使用过
        let frame = self.backend.frame_count().saturating_sub(self.backend.frames_in_flight() as u64);
        let staging = StagingTexture::new(id, width, height, depth, num_slices, format, frame);
        log::debug!("create staging texture {:?}: {}", id, staging.describe());

        self.in_use_bytes += staging.size_bytes();
        staging
    }

    /// 预算检查
    ///
    /// 预算足够时返回 `None`，由调用者创建新的 staging。
    /// 超出预算时先等待 GPU 用完可复用的 staging，从中找一个合适的；
    /// 还是没有的话，从最久没用的开始销毁，直到可以放下这次请求。
    pub fn check_staging_texture_limits(
        &mut self,
        width: u32,
        height: u32,
        depth: u32,
        num_slices: u32,
        format: PixelFormat,
        min_consumption_ratio: usize,
    ) -> Option<StagingTexture> {
        let required = format.size_bytes(width, height, depth, num_slices);
        let mut consumed = self.consumed_bytes();
        if consumed + required <= self.max_budget_bytes {
            return None;
        }

        log::warn!("Texture memory budget exceeded. Stalling GPU.");

        let mut waited_frames = BTreeSet::new();
        let mut best: Option<usize> = None;
        for (i, staging) in self.available.iter().enumerate() {
            if best.is_some() {
                break;
            }
            if waited_frames.insert(staging.last_frame_used) {
                self.backend.wait_for_frame(staging.last_frame_used);
            }

            if staging.supports_format(width, height, depth, num_slices, format) {
                let ratio = required * 100 / staging.size_bytes().max(1);
                if ratio >= min_consumption_ratio {
                    best = Some(i);
                }
            }
        }

        if let Some(b) = best {
            return Some(self.take_available(b));
        }

        log::warn!("Stalling was not enough. Freeing memory.");
        let mut num_destroyed = 0;
        for staging in &self.available {
            if consumed + required <= self.max_budget_bytes {
                break;
            }
            consumed -= staging.size_bytes();
            log::debug!("destroy staging texture {:?}: {}", staging.id, staging.describe());
            num_destroyed += 1;
        }
        self.available.drain(..num_destroyed);
        None
    }

    /// 归还一个 staging；不会修改它的 `last_frame_used`
    pub fn return_staging_texture(&mut self, staging: StagingTexture) {
        self.in_use_bytes = self.in_use_bytes.saturating_sub(staging.size_bytes());
        self.available.push(staging);
    }

    /// 销毁超过 `num_frames_threshold` 帧没有使用的 staging
    pub fn destroy_unused(&mut self, frame_count: u64, num_frames_threshold: u64) {
        // 按照归还的顺序排列，只需要从头开始检查
        let num_stale = self
            .available
            .iter()
            .take_while(|staging| frame_count.saturating_sub(staging.last_frame_used) > num_frames_threshold)
            .count();
        for staging in self.available.drain(..num_stale) {
            log::debug!("destroy unused staging texture {:?}: {}", staging.id, staging.describe());
        }
    }

    /// 销毁所有可复用的 staging；借出去的由持有者负责
    pub fn destroy_all(&mut self) {
        self.available.clear();
    }
}

/// 一种 family 的 staging 需求统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageStats {
    pub width: u32,
    pub height: u32,
    pub format_family: PixelFormat,
    pub accum_size_bytes: usize,
    /// 还剩多少轮没有被使用就会被移除
    pub loop_count: u32,
}

impl UsageStats {
    pub fn new(width: u32, height: u32, depth_or_slices: u32, format_family: PixelFormat) -> Self {
        Self {
            width,
            height,
            format_family,
            accum_size_bytes: format_family.size_bytes(width, height, depth_or_slices, 1),
            loop_count: 0,
        }
    }
}

/// 常驻的最小 staging 预算
///
/// 保证每种 family 至少有一个能放下 `min_resolution x min_resolution x min_num_slices` 的 staging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetEntry {
    pub format_family: PixelFormat,
    pub min_resolution: u32,
    pub min_num_slices: u32,
}

impl BudgetEntry {
    pub fn new(format_family: PixelFormat, min_resolution: u32, min_num_slices: u32) -> Self {
        Self {
            format_family: format_family.family(),
            min_resolution,
            min_num_slices,
        }
    }

    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.format_family
            .size_bytes(self.min_resolution, self.min_resolution, 1, self.min_num_slices)
    }

    /// 大的排在前面
    pub fn sort(entries: &mut [BudgetEntry]) {
        entries.sort_by(|l, r| r.size_bytes().cmp(&l.size_bytes()));
    }

    /// 默认的预算：常见的颜色、压缩和法线贴图格式
    pub fn default_budget() -> Vec<BudgetEntry> {
        let mut entries = vec![
            BudgetEntry::new(PixelFormat::Rgba8Unorm, 4096, 2),
            BudgetEntry::new(PixelFormat::Bc1Unorm, 4096, 2),
            BudgetEntry::new(PixelFormat::Bc3Unorm, 4096, 1),
            BudgetEntry::new(PixelFormat::Bc5Unorm, 4096, 1),
        ];
        Self::sort(&mut entries);
        entries
    }
}

/// worker 使用的 staging 相关数据
///
/// `available` 是主线程为 worker 预先准备好并开始映射的 staging，按照容量从小到大排列。
#[derive(Default)]
pub struct StreamingData {
    pub available: Vec<StagingTexture>,
    /// 这一轮 worker 的需求
    pub usage_stats: Vec<UsageStats>,
    /// 之前几轮需求的平滑结果
    pub prev_stats: Vec<UsageStats>,
    /// 这一轮已经映射的字节数
    pub bytes_preloaded: usize,
}

// worker 线程
impl StreamingData {
    /// 为一块区域找 staging 内存
    ///
    /// 先在 worker 已经在用的 staging 中找，再从预热的列表中取。
    /// 无论是否成功都会记录到 usage stats 中，主线程据此准备下一轮的 staging。
    ///
    /// # return
    /// 成功时返回 staging 在 `worker_used` 中的下标以及映射出来的区域
    pub fn map_streaming_region(
        &mut self,
        worker_used: &mut Vec<StagingTexture>,
        width: u32,
        height: u32,
        depth: u32,
        num_slices: u32,
        format: PixelFormat,
    ) -> Option<(usize, StagingRegion)> {
        let mut result = None;

        for (i, staging) in worker_used.iter_mut().enumerate() {
            if staging.supports_format(width, height, depth, num_slices, format)
                && let Some(region) = staging.map_region(width, height, depth, num_slices, format)
            {
                result = Some((i, region));
                break;
            }
        }

        if result.is_none() {
            let mut found = None;
            for (i, staging) in self.available.iter_mut().enumerate() {
                if staging.supports_format(width, height, depth, num_slices, format)
                    && let Some(region) = staging.map_region(width, height, depth, num_slices, format)
                {
                    found = Some((i, region));
                    break;
                }
            }
            if let Some((i, region)) = found {
                worker_used.push(self.available.remove(i));
                result = Some((worker_used.len() - 1, region));
            }
        }

        self.record_usage(width, height, depth.max(num_slices), format);
        result
    }

    fn record_usage(&mut self, width: u32, height: u32, depth_or_slices: u32, format: PixelFormat) {
        let family = format.family();
        let required = family.size_bytes(width, height, depth_or_slices, 1);

        match self.usage_stats.iter_mut().find(|stats| stats.format_family == family) {
            Some(stats) => {
                stats.width = stats.width.max(width);
                stats.height = stats.height.max(height);
                stats.accum_size_bytes += required;
            }
            None => self.usage_stats.push(UsageStats::new(width, height, depth_or_slices, family)),
        }
        self.bytes_preloaded += required;
    }

    /// 把这一轮的需求合并到平滑结果中：取平均值，但是不小于这一轮的需求
    pub fn merge_usage_stats_into_prev_stats(&mut self) {
        for stats in self.usage_stats.drain(..) {
            match self.prev_stats.iter_mut().find(|prev| prev.format_family == stats.format_family) {
                Some(prev) => {
                    prev.width = stats.width.max((prev.width + stats.width) / 2);
                    prev.height = stats.height.max((prev.height + stats.height) / 2);
                    prev.accum_size_bytes = stats
                        .accum_size_bytes
                        .max((prev.accum_size_bytes + stats.accum_size_bytes) / 2);
                    prev.loop_count = USAGE_STATS_LOOP_COUNT;
                }
                None => self.prev_stats.push(UsageStats {
                    loop_count: USAGE_STATS_LOOP_COUNT,
                    ..stats
                }),
            }
        }
    }
}

// 主线程 (持有 streaming 锁)
impl StreamingData {
    /// 为 worker 的下一轮准备 staging
    ///
    /// 按照需求统计和最小预算挑选 (或创建) staging 并开始映射，用不上的还给 pool。
    pub fn fulfill_budget(&mut self, pool: &mut StagingTexturePool, budget: &[BudgetEntry]) {
        let _span = tracy_client::span!("StreamingData::fulfill_budget");

        self.available.sort_by(|l, r| l.size_bytes().cmp(&r.size_bytes()));

        let mut kept = Vec::new();
        self.fulfill_usage_stats(pool, &mut kept);
        self.fulfill_minimum_budget(pool, budget, &mut kept);

        // 剩下的没有需求，归还给 pool
        let frame = pool.backend().frame_count();
        for mut staging in self.available.drain(..) {
            staging.stop_map_region(frame);
            pool.return_staging_texture(staging);
        }

        kept.sort_by(|l: &StagingTexture, r: &StagingTexture| match l.size_bytes().cmp(&r.size_bytes()) {
            Ordering::Equal => l.id.cmp(&r.id),
            other => other,
        });
        self.available = kept;
        self.bytes_preloaded = 0;
    }

    fn fulfill_usage_stats(&mut self, pool: &mut StagingTexturePool, kept: &mut Vec<StagingTexture>) {
        let mut i = 0;
        while i < self.prev_stats.len() {
            let stats = &mut self.prev_stats[i];
            stats.loop_count = stats.loop_count.saturating_sub(1);
            if stats.loop_count == 0 {
                // 太久没有需求了
                self.prev_stats.swap_remove(i);
                continue;
            }

            let stats = *stats;
            let one_slice = stats.format_family.size_bytes(stats.width, stats.height, 1, 1).max(1);
            let num_slices = stats.accum_size_bytes.div_ceil(one_slice) as u32;

            let supported = self
                .available
                .iter()
                .position(|s| s.supports_format(stats.width, stats.height, 1, num_slices, stats.format_family));
            match supported {
                Some(index) => kept.push(self.available.remove(index)),
                None => {
                    let mut staging = pool.get_staging_texture(
                        stats.width,
                        stats.height,
                        1,
                        num_slices,
                        stats.format_family,
                        DEFAULT_CONSUMPTION_RATIO,
                    );
                    staging.start_map_region(pool.backend());
                    kept.push(staging);
                }
            }
            i += 1;
        }
    }

    fn fulfill_minimum_budget(&mut self, pool: &mut StagingTexturePool, budget: &[BudgetEntry], kept: &mut Vec<StagingTexture>) {
        for entry in budget {
            let supports = |s: &StagingTexture| {
                s.format_family() == entry.format_family
                    && s.supports_format(entry.min_resolution, entry.min_resolution, 1, entry.min_num_slices, entry.format_family)
            };

            if let Some(index) = self.available.iter().position(supports) {
                kept.push(self.available.remove(index));
                continue;
            }
            // fulfill_usage_stats 可能已经准备好了
            if kept.iter().any(supports) {
                continue;
            }

            let mut staging = pool.get_staging_texture(
                entry.min_resolution,
                entry.min_resolution,
                1,
                entry.min_num_slices,
                entry.format_family,
                DEFAULT_CONSUMPTION_RATIO,
            );
            staging.start_map_region(pool.backend());
            kept.push(staging);
        }
    }

    /// 把预热的 staging 全部还给 pool
    pub fn release_all(&mut self, pool: &mut StagingTexturePool) {
        let frame = pool.backend().frame_count();
        for mut staging in self.available.drain(..) {
            staging.stop_map_region(frame);
            pool.return_staging_texture(staging);
        }
    }
}

#[cfg(test)]
mod tests {
    use texstream_gfx::headless::HeadlessGpu;

    use super::*;

    fn pool(gpu: &Arc<HeadlessGpu>, budget: usize) -> StagingTexturePool {
        StagingTexturePool::new(gpu.clone(), budget)
    }

    #[test]
    fn test_map_region_is_bump_allocated() {
        let gpu = Arc::new(HeadlessGpu::default());
        let mut pool = pool(&gpu, 1 << 20);
        let mut staging = pool.get_staging_texture(4, 4, 1, 1, PixelFormat::Rgba8Unorm, 0);
        staging.start_map_region(gpu.as_ref());

        assert!(staging.supports_format(2, 2, 1, 1, PixelFormat::Rgba8UnormSrgb));
        assert!(!staging.supports_format(2, 2, 1, 1, PixelFormat::R8Unorm));

        let a = staging.map_region(2, 2, 1, 1, PixelFormat::Rgba8Unorm).unwrap();
        let b = staging.map_region(2, 2, 1, 2, PixelFormat::Rgba8Unorm).unwrap();
        assert_eq!((a.offset, b.offset), (0, 16));
        assert_eq!(staging.mapped_bytes(), 48);
        // 64 字节只剩 16
        assert!(staging.map_region(2, 2, 1, 2, PixelFormat::Rgba8Unorm).is_none());
    }

    #[test]
    fn test_best_fit_and_consumption_ratio() {
        let gpu = Arc::new(HeadlessGpu::default());
        let mut pool = pool(&gpu, 1 << 20);
        let big = pool.get_staging_texture(64, 64, 1, 1, PixelFormat::Rgba8Unorm, 0);
        let small = pool.get_staging_texture(16, 16, 1, 1, PixelFormat::Rgba8Unorm, 0);
        let (big_id, small_id) = (big.id(), small.id());
        pool.return_staging_texture(big);
        pool.return_staging_texture(small);
        assert_eq!(pool.in_use_bytes(), 0);

        // 两个都是刚创建的，没有被 GPU 使用过，选最小的
        let picked = pool.get_staging_texture(8, 8, 1, 1, PixelFormat::Rgba8Unorm, 0);
        assert_eq!(picked.id(), small_id);
        pool.return_staging_texture(picked);

        let picked = pool.get_staging_texture(20, 20, 1, 1, PixelFormat::Rgba8Unorm, 0);
        assert_eq!(picked.id(), big_id);
        // 4x4 只占 16x16 的 6%，不能复用，创建新的
        let fresh = pool.get_staging_texture(4, 4, 1, 1, PixelFormat::Rgba8Unorm, 50);
        assert_ne!(fresh.id(), small_id);
        assert_ne!(fresh.id(), big_id);
    }

    #[test]
    fn test_budget_stalls_then_frees() {
        let gpu = Arc::new(HeadlessGpu::default());
        let mut pool = pool(&gpu, 1024);

        // 12x12 RGBA8 = 576 字节，GPU 在当前帧使用
        let mut a = pool.get_staging_texture(12, 12, 1, 1, PixelFormat::Rgba8Unorm, 0);
        let a_id = a.id();
        a.start_map_region(gpu.as_ref());
        a.map_region(12, 12, 1, 1, PixelFormat::Rgba8Unorm).unwrap();
        a.stop_map_region(gpu.frame_count());
        pool.return_staging_texture(a);
        assert!(pool.available()[0].upload_will_stall(gpu.as_ref()));

        // 再申请一个同样大小的会超出预算：等待 GPU 之后复用 a
        let again = pool.get_staging_texture(12, 12, 1, 1, PixelFormat::Rgba8Unorm, 0);
        assert_eq!(again.id(), a_id);
        assert_eq!(gpu.stall_count(), 1);
        pool.return_staging_texture(again);

        // 14x14 = 784 字节，a 放不下：销毁 a 之后再创建
        let c = pool.get_staging_texture(14, 14, 1, 1, PixelFormat::Rgba8Unorm, 0);
        assert_ne!(c.id(), a_id);
        assert!(pool.available().is_empty());
        assert!(pool.consumed_bytes() <= pool.max_budget_bytes());
        assert_eq!(pool.consumed_bytes(), 784);
    }

    #[test]
    fn test_exactly_full_budget_does_not_stall() {
        let gpu = Arc::new(HeadlessGpu::default());
        let mut pool = pool(&gpu, 1024);

        // 16x8 RGBA8 = 512 字节，GPU 在当前帧使用
        let mut a = pool.get_staging_texture(16, 8, 1, 1, PixelFormat::Rgba8Unorm, 0);
        let a_id = a.id();
        a.start_map_region(gpu.as_ref());
        a.map_region(16, 8, 1, 1, PixelFormat::Rgba8Unorm).unwrap();
        a.stop_map_region(gpu.frame_count());
        pool.return_staging_texture(a);

        // 512 + 512 正好等于预算，直接创建
        let b = pool.get_staging_texture(16, 8, 1, 1, PixelFormat::Rgba8Unorm, 0);
        assert_ne!(b.id(), a_id);
        assert_eq!(gpu.stall_count(), 0);
        assert_eq!(pool.consumed_bytes(), 1024);
    }

    #[test]
    fn test_destroy_unused_after_threshold() {
        let gpu = Arc::new(HeadlessGpu::new(2));
        let mut pool = pool(&gpu, 1 << 20);
        let mut staging = pool.get_staging_texture(4, 4, 1, 1, PixelFormat::R8Unorm, 0);
        staging.map_region(4, 4, 1, 1, PixelFormat::R8Unorm).unwrap();
        staging.stop_map_region(gpu.frame_count());
        pool.return_staging_texture(staging);

        for _ in 0..4 {
            gpu.advance_frame();
        }
        pool.destroy_unused(gpu.frame_count(), 4);
        assert_eq!(pool.available().len(), 1);

        gpu.advance_frame();
        pool.destroy_unused(gpu.frame_count(), 4);
        assert!(pool.available().is_empty());
    }

    #[test]
    fn test_usage_stats_decay() {
        let mut data = StreamingData::default();
        let mut used = Vec::new();
        // 没有预热的 staging，映射失败，但需求被记录下来
        assert!(
            data.map_streaming_region(&mut used, 8, 8, 1, 1, PixelFormat::Rgba8Unorm)
                .is_none()
        );
        data.map_streaming_region(&mut used, 4, 16, 1, 1, PixelFormat::Rgba8UnormSrgb);
        assert_eq!(data.bytes_preloaded, 256 + 256);

        data.merge_usage_stats_into_prev_stats();
        assert!(data.usage_stats.is_empty());
        let prev = data.prev_stats[0];
        assert_eq!((prev.width, prev.height, prev.accum_size_bytes, prev.loop_count), (8, 16, 512, 15));

        // 需求变小：取平均
        data.map_streaming_region(&mut used, 2, 2, 1, 1, PixelFormat::Rgba8Unorm);
        data.merge_usage_stats_into_prev_stats();
        let prev = data.prev_stats[0];
        assert_eq!((prev.width, prev.height, prev.accum_size_bytes), (5, 9, 264));
    }

    #[test]
    fn test_fulfill_budget_prepares_staging() {
        let gpu = Arc::new(HeadlessGpu::default());
        let mut pool = pool(&gpu, 1 << 20);
        let mut data = StreamingData::default();
        let budget = [BudgetEntry::new(PixelFormat::Rgba8Unorm, 16, 1)];

        data.fulfill_budget(&mut pool, &budget);
        assert_eq!(data.available.len(), 1);
        assert_eq!(data.available[0].size_bytes(), 16 * 16 * 4);
        assert_eq!(pool.in_use_bytes(), 16 * 16 * 4);

        // worker 使用预热的 staging
        let mut used = Vec::new();
        let (index, region) = data
            .map_streaming_region(&mut used, 8, 8, 1, 1, PixelFormat::Rgba8Unorm)
            .unwrap();
        assert_eq!((index, region.offset), (0, 0));
        assert!(data.available.is_empty());

        // 下一轮重新准备，需求统计带来一个 8x8 的 staging，预算再准备一个 16x16
        data.merge_usage_stats_into_prev_stats();
        data.fulfill_budget(&mut pool, &budget);
        assert_eq!(data.available.len(), 2);
        assert_eq!(data.bytes_preloaded, 0);
    }

    #[test]
    fn test_budget_entries_sorted_biggest_first() {
        let budget = BudgetEntry::default_budget();
        assert_eq!(budget[0].format_family, PixelFormat::Rgba8Unorm);
        assert!(budget.windows(2).all(|w| w[0].size_bytes() >= w[1].size_bytes()));
    }
}
