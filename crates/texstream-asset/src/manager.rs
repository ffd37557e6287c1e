use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use crossbeam_utils::sync::Parker;
use itertools::Itertools;
use slotmap::SlotMap;
use texstream_gfx::backend::{GpuBackend, GpuTextureId};
use texstream_gfx::pixel_format::PixelFormat;
use texstream_gfx::texture_desc::{TextureBox, TextureDesc, TextureType};

use crate::archive::ResourceGroups;
use crate::codec::ImageCodecs;
use crate::command_buffer::CommandExecutor;
use crate::config::StreamingConfig;
use crate::error::StreamingError;
use crate::filters::{FilterFlags, TextureFilter};
use crate::image::{Image, PixelBuffer};
use crate::listener::{EventQueue, ListenerId, Listeners, TextureEventReason, TextureListener};
use crate::load_request::{LoadRequest, LoadTransition, SLICE_ALL, ShapeSource};
use crate::metadata_cache::{MetadataCache, MetadataCacheEntry, ReservedPool};
use crate::multiload::MultiLoadPool;
use crate::scheduled::{ScheduledTask, ScheduledTasks};
use crate::staging::BudgetEntry;
use crate::texture::{GpuPageOutStrategy, GpuResidency, TextureFlags, TextureGpu, TextureHandle};
use crate::texture_pool::TexturePoolAllocator;
use crate::worker::{StreamingContext, ThreadData, describe_desc, spawn_streaming_thread};

/// 创建纹理需要的信息，只有元数据，不会读取任何文件
#[derive(Debug, Clone)]
pub struct TextureCreateInfo {
    /// 资源名，用于从资源组中读取
    pub name: String,
    /// 全局唯一的名字，缺省时和 `name` 相同
    pub alias: Option<String>,
    pub page_out_strategy: GpuPageOutStrategy,
    pub flags: TextureFlags,
    pub initial_type: TextureType,
    /// 为空时搜索所有资源组
    pub resource_group: String,
    pub filters: FilterFlags,
    /// 期望使用的 texture pool，0 表示自动
    pub pool_id: u32,
}

impl TextureCreateInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            page_out_strategy: GpuPageOutStrategy::default(),
            flags: TextureFlags::empty(),
            initial_type: TextureType::Type2D,
            resource_group: String::new(),
            filters: FilterFlags::empty(),
            pool_id: 0,
        }
    }
}

/// `transition_to` 的可选参数
#[derive(Debug, Default)]
pub struct TransitionOptions {
    /// 直接使用这张图片，不从资源组读取；图片的缓冲区是否由引擎持有见 [`PixelBuffer`]
    pub image: Option<Image>,
    /// 纹理已经常驻，只重新上传数据
    pub reupload_only: bool,
    /// 不经过 multiload 线程池
    pub skip_multiload: bool,
}

/// 内存使用情况的快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub staging_available_bytes: usize,
    pub staging_in_use_bytes: usize,
    /// 单独分配的 GPU 纹理
    pub texture_bytes: usize,
    /// 所有 texture pool 的 master texture
    pub pool_bytes: usize,
    pub sysram_bytes: usize,

    pub num_on_storage: usize,
    pub num_on_system_ram: usize,
    pub num_resident: usize,
}

/// 纹理流送系统的入口
///
/// ## 线程
/// - 主线程：拥有所有的纹理，执行 command buffer，派发事件
/// - streaming worker：解码、运行 filter、拷贝到 staging、录制命令
/// - multiload 线程池 (可选)：只负责读取和解码
///
/// 主线程需要每帧调用 [`TextureGpuManager::update`]。
pub struct TextureGpuManager {
    pub(crate) backend: Arc<dyn GpuBackend>,

    context: Arc<StreamingContext>,
    streaming_thread: Option<thread::JoinHandle<()>>,
    multiload: Option<MultiLoadPool>,
    /// worker 完成一轮之后唤醒主线程
    main_parker: Parker,
    main_data: ThreadData,
    inbox: Sender<LoadRequest>,

    pub(crate) textures: SlotMap<TextureHandle, TextureGpu>,
    pub(crate) aliases: HashMap<String, TextureHandle>,
    pub(crate) scheduled: ScheduledTasks,
    pub(crate) pools: TexturePoolAllocator,
    pub(crate) metadata_cache: MetadataCache,

    pub(crate) events: EventQueue,
    listeners: Listeners,
    /// 已经销毁、等待告诉 worker 忘掉的纹理
    pub(crate) destroyed: Vec<TextureHandle>,

    try_lock_failures: u32,
    config: StreamingConfig,
}

// new & init
impl TextureGpuManager {
    pub fn new(backend: Arc<dyn GpuBackend>, groups: Arc<ResourceGroups>, config: StreamingConfig) -> anyhow::Result<Self> {
        Self::new_with_codecs(backend, groups, Arc::new(ImageCodecs::default()), config)
    }

    pub fn new_with_codecs(
        backend: Arc<dyn GpuBackend>,
        groups: Arc<ResourceGroups>,
        codecs: Arc<ImageCodecs>,
        config: StreamingConfig,
    ) -> anyhow::Result<Self> {
        tracy_client::Client::start();

        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        let main_parker = Parker::new();
        let worker_parker = Parker::new();
        let worker_unparker = worker_parker.unparker().clone();

        let context = Arc::new(StreamingContext::new(
            backend.clone(),
            groups.clone(),
            codecs.clone(),
            inbox_rx,
            main_parker.unparker().clone(),
            worker_unparker.clone(),
            &config,
        ));

        let streaming_thread = if config.streaming_on_main_thread {
            None
        } else {
            Some(spawn_streaming_thread(context.clone(), worker_parker)?)
        };
        let multiload = if config.multiload_threads > 0 {
            Some(MultiLoadPool::new(
                config.multiload_threads,
                groups,
                codecs,
                inbox_tx.clone(),
                worker_unparker,
            )?)
        } else {
            None
        };

        log::info!(
            "texture manager created (worker thread: {}, multiload threads: {})",
            streaming_thread.is_some(),
            config.multiload_threads
        );
        Ok(Self {
            backend,
            context,
            streaming_thread,
            multiload,
            main_parker,
            main_data: ThreadData::default(),
            inbox: inbox_tx,
            textures: SlotMap::with_key(),
            aliases: HashMap::new(),
            scheduled: ScheduledTasks::default(),
            pools: TexturePoolAllocator::new(config.pool_slices.clone()),
            metadata_cache: MetadataCache::default(),
            events: EventQueue::default(),
            listeners: Listeners::default(),
            destroyed: Vec::new(),
            try_lock_failures: 0,
            config,
        })
    }
}

// getter
impl TextureGpuManager {
    #[inline]
    pub fn texture(&self, handle: TextureHandle) -> Option<&TextureGpu> {
        self.textures.get(handle)
    }

    /// 用于修改形状 (只有 OnStorage 时允许)
    #[inline]
    pub fn texture_mut(&mut self, handle: TextureHandle) -> Option<&mut TextureGpu> {
        self.textures.get_mut(handle)
    }

    pub fn textures(&self) -> impl Iterator<Item = (TextureHandle, &TextureGpu)> {
        self.textures.iter()
    }

    #[inline]
    pub fn num_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn find_texture(&self, alias: &str) -> Option<TextureHandle> {
        self.aliases.get(alias).copied()
    }

    pub fn find_alias_name(&self, handle: TextureHandle) -> Option<&str> {
        self.textures.get(handle).map(TextureGpu::alias)
    }

    pub fn find_resource_name(&self, handle: TextureHandle) -> Option<&str> {
        self.textures.get(handle).map(TextureGpu::name)
    }

    #[inline]
    pub fn metadata_cache(&self) -> &MetadataCache {
        &self.metadata_cache
    }

    #[inline]
    pub fn texture_pools(&self) -> &TexturePoolAllocator {
        &self.pools
    }

    #[inline]
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    #[inline]
    pub fn has_streaming_thread(&self) -> bool {
        self.streaming_thread.is_some()
    }
}

// 纹理的创建与销毁
impl TextureGpuManager {
    /// 只创建元数据，处于 OnStorage
    ///
    /// # return
    /// alias 已经存在时返回 [`StreamingError::DuplicateAlias`]
    pub fn create_texture(&mut self, info: TextureCreateInfo) -> anyhow::Result<TextureHandle> {
        let alias = info.alias.unwrap_or_else(|| info.name.clone());
        if self.aliases.contains_key(&alias) {
            return Err(StreamingError::DuplicateAlias(alias).into());
        }

        let texture = TextureGpu::new(
            info.name,
            alias.clone(),
            info.resource_group,
            info.page_out_strategy,
            info.flags,
            info.filters,
            info.initial_type,
            info.pool_id,
        );
        let handle = self.textures.insert(texture);
        log::debug!("texture '{}' created", alias);
        self.aliases.insert(alias, handle);
        Ok(handle)
    }

    /// alias 已经存在时直接返回已有的纹理
    pub fn create_or_retrieve_texture(&mut self, info: TextureCreateInfo) -> anyhow::Result<TextureHandle> {
        let alias = info.alias.as_deref().unwrap_or(&info.name);
        if let Some(&handle) = self.aliases.get(alias) {
            return Ok(handle);
        }
        self.create_texture(info)
    }

    /// 纹理还有正在进行的加载时，会等到加载完成之后才真正销毁
    pub fn destroy_texture(&mut self, handle: TextureHandle) -> anyhow::Result<()> {
        let Some(texture) = self.textures.get(handle) else {
            return Err(StreamingError::UnknownTexture.into());
        };
        if self.scheduled.is_destroy_scheduled(handle) {
            return Err(StreamingError::InvalidRequest(format!(
                "texture '{}' is already scheduled for destruction",
                texture.alias()
            ))
            .into());
        }

        self.schedule_task(handle, ScheduledTask::Destroy);
        self.process_events();
        Ok(())
    }

    /// 关闭前销毁所有纹理：先等待所有的加载完成
    pub fn destroy_all(&mut self) {
        let _span = tracy_client::span!("TextureGpuManager::destroy_all");
        self.wait_for_streaming_completion();

        let handles = self.textures.keys().collect_vec();
        for handle in handles {
            if !self.scheduled.is_destroy_scheduled(handle) {
                self.schedule_task(handle, ScheduledTask::Destroy);
            }
        }
        self.process_events();
        self.wait_for_streaming_completion();
    }
}

// 驻留控制
impl TextureGpuManager {
    /// 请求纹理到达 `target`
    ///
    /// 请求按照提交顺序执行；纹理有正在进行的加载时会排队。
    /// 非法的请求 (例如 Discard 策略的纹理换出到系统内存) 会立即返回错误。
    pub fn transition_to(
        &mut self,
        handle: TextureHandle,
        target: GpuResidency,
        options: TransitionOptions,
    ) -> anyhow::Result<()> {
        let texture = self.textures.get(handle).ok_or(StreamingError::UnknownTexture)?;
        let alias = texture.alias();
        if self.scheduled.is_destroy_scheduled(handle) {
            return Err(StreamingError::InvalidRequest(format!("texture '{}' is scheduled for destruction", alias)).into());
        }

        let next = texture.next_residency();
        if options.reupload_only {
            if next != GpuResidency::Resident || target != GpuResidency::Resident {
                return Err(StreamingError::invalid_state(alias, "reupload requires a Resident texture").into());
            }
            if texture.is_manual() {
                return Err(StreamingError::invalid_state(alias, "manual textures have nothing to reupload").into());
            }
        } else if target == next {
            return Ok(());
        }

        if texture.is_manual() && target == GpuResidency::OnSystemRam {
            return Err(StreamingError::invalid_state(alias, "manual textures cannot be paged out to system ram").into());
        }
        if next == GpuResidency::Resident
            && target == GpuResidency::OnSystemRam
            && texture.page_out_strategy() == GpuPageOutStrategy::Discard
        {
            return Err(StreamingError::invalid_state(
                alias,
                "cannot go from Resident to OnSystemRam with the Discard page out strategy",
            )
            .into());
        }
        if options.image.is_some() {
            if target == GpuResidency::OnStorage {
                return Err(StreamingError::InvalidRequest(format!("'{}': an image was given for OnStorage", alias)).into());
            }
            if next != GpuResidency::OnStorage && !options.reupload_only {
                return Err(StreamingError::invalid_state(alias, "an image can only be given while OnStorage").into());
            }
        }

        if let Some(texture) = self.textures.get_mut(handle) {
            texture.set_next_residency(target);
        }
        self.schedule_task(
            handle,
            ScheduledTask::Transition {
                target,
                image: options.image,
                reupload: options.reupload_only,
                skip_multiload: options.skip_multiload,
            },
        );
        self.process_events();
        Ok(())
    }

    /// 提交一次加载：每次都会产生新的加载代数，旧的结果随之作废
    pub(crate) fn enqueue_load(
        &mut self,
        handle: TextureHandle,
        transition: LoadTransition,
        shape: ShapeSource,
        image: Option<Image>,
        skip_multiload: bool,
    ) {
        let Some(texture) = self.textures.get_mut(handle) else {
            return;
        };
        let generation = texture.bump_load_generation();
        let keep_sysram_copy = texture.page_out_strategy() == GpuPageOutStrategy::AlwaysKeepSystemRamCopy
            && transition != LoadTransition::ToSystemRam;

        let request = LoadRequest {
            texture: handle,
            texture_name: texture.alias().to_string(),
            name: texture.name().to_string(),
            resource_group: texture.resource_group().to_string(),
            image,
            load_error: None,
            slice_or_depth: SLICE_ALL,
            filters: texture.filters(),
            texture_flags: texture.flags(),
            initial_type: texture.texture_type(),
            shape,
            transition,
            generation,
            skip_multiload,
            keep_sysram_copy,
            decode_time: None,
        };
        log::debug!("'{}': enqueue {:?} (generation {})", request.texture_name, transition, generation);

        for request in request.fan_out() {
            let request = match &self.multiload {
                Some(multiload) if request.image.is_none() && !request.skip_multiload => {
                    match multiload.request_load(request) {
                        Ok(()) => continue,
                        Err(request) => request,
                    }
                }
                _ => request,
            };
            if self.inbox.send(request).is_err() {
                log::error!("texture streaming inbox is closed");
            }
        }
        self.context.wake_worker();
    }

    /// 为纹理分配 GPU 内存：pool 中的一个 slice，或者单独的纹理
    pub(crate) fn allocate_gpu_memory(&mut self, handle: TextureHandle, desc: &TextureDesc) -> anyhow::Result<()> {
        let texture = self.textures.get(handle).ok_or(StreamingError::UnknownTexture)?;
        if texture.gpu_texture().is_some() || texture.pool_slot().is_some() {
            return Ok(());
        }

        let batched = texture.has_automatic_batching()
            && desc.texture_type == TextureType::Type2D
            && desc.depth_or_slices == 1;
        if batched {
            let slot = self
                .pools
                .reserve_slot(self.backend.as_ref(), handle, desc, texture.requested_pool_id())?;
            if let Some(texture) = self.textures.get_mut(handle) {
                texture.set_pool_slot(Some(slot));
            }
            self.events.push(handle, TextureEventReason::PoolTextureSlotChanged);
        } else {
            let id = self.backend.create_texture(desc, texture.alias())?;
            if let Some(texture) = self.textures.get_mut(handle) {
                texture.set_gpu_texture(Some(id));
            }
        }
        Ok(())
    }

    pub(crate) fn release_gpu_memory(&mut self, handle: TextureHandle) {
        let Some(texture) = self.textures.get_mut(handle) else {
            return;
        };
        if let Some(slot) = texture.pool_slot() {
            texture.set_pool_slot(None);
            self.pools.release_slot(self.backend.as_ref(), handle, slot);
        }
        if let Some(id) = texture.gpu_texture() {
            texture.set_gpu_texture(None);
            self.backend.destroy_texture(id);
        }
    }

    /// 纹理数据实际所在的 GPU 纹理 (pool 中的纹理返回 master texture)
    fn target_gpu_texture(&self, texture: &TextureGpu) -> Option<GpuTextureId> {
        texture.gpu_texture().or_else(|| {
            texture
                .pool_slot()
                .and_then(|slot| self.pools.pool(slot.pool))
                .map(|pool| pool.master_texture())
        })
    }

    fn update_metadata_cache(&mut self, handle: TextureHandle) {
        let Some(texture) = self.textures.get(handle) else {
            return;
        };
        if texture.is_manual() || !texture.desc().is_valid() {
            return;
        }
        self.metadata_cache.insert(
            texture.alias(),
            MetadataCacheEntry {
                desc: *texture.desc(),
                pool_id: texture.requested_pool_id(),
            },
        );
    }
}

// 每帧更新
impl TextureGpuManager {
    /// 取回 worker 录制的命令并执行，派发事件
    ///
    /// # Params
    /// * `sync` - 阻塞等待 streaming 锁；否则 `try_lock` 失败时直接返回，
    ///   连续失败 `max_try_lock_failures` 次后也会改为阻塞
    ///
    /// # return
    /// 所有的流送工作都已完成
    pub fn update(&mut self, sync: bool) -> bool {
        let _span = tracy_client::span!("TextureGpuManager::update");

        if self.streaming_thread.is_none() {
            self.context.update_streaming();
        }

        let context = self.context.clone();
        let blocking = sync || self.try_lock_failures >= self.config.max_try_lock_failures;
        let state = if blocking {
            Some(context.lock_state())
        } else {
            context.try_lock_state()
        };
        let Some(mut state) = state else {
            self.try_lock_failures += 1;
            return false;
        };
        self.try_lock_failures = 0;

        state.swap_thread_data(&mut self.main_data);
        state.fulfill_budget();
        let frame = self.backend.frame_count();
        let threshold = self.backend.frames_in_flight() as u64 + 2;
        state.staging_pool.destroy_unused(frame, threshold);
        for handle in self.destroyed.drain(..) {
            state.forget_texture(handle);
        }
        drop(state);

        // 不持有锁，worker 可以同时开始下一轮
        let mut main_data = std::mem::take(&mut self.main_data);
        main_data.command_buffer.execute(&main_data.used_staging, self);
        self.process_events();

        let frame = self.backend.frame_count();
        let mut state = context.lock_state();
        state.return_staging(&mut main_data.used_staging, frame);
        self.main_data = main_data;

        // multiload 先送进收件箱再减计数，所以要先检查 multiload
        let multiload_idle = self.multiload.as_ref().is_none_or(MultiLoadPool::is_idle);
        let done = multiload_idle
            && context.inbox_is_empty()
            && state.is_idle()
            && state.worker_data.command_buffer.is_empty();
        drop(state);

        if !done {
            context.wake_worker();
        }
        done
    }

    /// 阻塞直到所有的流送工作完成
    pub fn wait_for_streaming_completion(&mut self) {
        let _span = tracy_client::span!("TextureGpuManager::wait_for_streaming_completion");
        while !self.update(true) {
            if self.streaming_thread.is_some() {
                self.main_parker.park_timeout(Duration::from_millis(10));
            }
        }
    }

    /// 阻塞直到纹理的数据 (或者只是形状) 就绪，或者不再有进行中的驻留变化
    pub fn wait_for(&mut self, handle: TextureHandle, metadata_only: bool) -> anyhow::Result<()> {
        if !self.textures.contains_key(handle) {
            return Err(StreamingError::UnknownTexture.into());
        }

        loop {
            // 等待期间纹理被销毁了
            let Some(texture) = self.textures.get(handle) else {
                return Ok(());
            };
            let ready = if metadata_only {
                texture.is_metadata_ready()
            } else {
                texture.is_data_ready()
            };
            if ready || texture.pending_residency_changes() == 0 {
                return Ok(());
            }

            let done = self.update(true);
            if !done && self.streaming_thread.is_some() {
                self.main_parker.park_timeout(Duration::from_millis(10));
            }
        }
    }

    /// 先执行内部的状态机，再通知外部 listener；处理过程中产生的新事件追加到队尾
    pub(crate) fn process_events(&mut self) {
        while let Some(event) = self.events.pop() {
            self.on_texture_event(event.texture, event.reason);
            self.listeners.notify(&event);
        }
    }
}

// listener
impl TextureGpuManager {
    pub fn add_listener(&mut self, listener: Box<dyn TextureListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> Option<Box<dyn TextureListener>> {
        self.listeners.remove(id)
    }
}

// metadata cache & 预算
impl TextureGpuManager {
    /// 导入 metadata cache，同时预留文件中记录的 texture pool
    pub fn import_metadata_cache(&mut self, json: &str) -> anyhow::Result<()> {
        let reserved = self.metadata_cache.import(json)?;
        for pool in reserved {
            if self.pools.reserved_pools().any(|existing| existing.pool_id() == pool.pool_id) {
                log::debug!("texture pool {} is already reserved", pool.pool_id);
                continue;
            }
            self.reserve_pool_id(pool.pool_id, pool.width, pool.height, pool.num_slices, pool.num_mips, pool.format)?;
        }
        Ok(())
    }

    pub fn export_metadata_cache(&self) -> anyhow::Result<String> {
        let reserved = self
            .pools
            .reserved_pools()
            .map(|pool| ReservedPool {
                pool_id: pool.pool_id(),
                width: pool.desc().width,
                height: pool.desc().height,
                num_slices: pool.num_slices(),
                num_mips: pool.desc().num_mips,
                format: pool.desc().format,
            })
            .sorted_by_key(|pool| pool.pool_id)
            .collect_vec();
        self.metadata_cache.export(&reserved)
    }

    /// 手动预留一个 texture pool，`pool_id` 相同的纹理会放进这里
    pub fn reserve_pool_id(
        &mut self,
        pool_id: u32,
        width: u32,
        height: u32,
        num_slices: u32,
        num_mips: u8,
        format: PixelFormat,
    ) -> anyhow::Result<()> {
        self.pools
            .reserve_pool_id(self.backend.as_ref(), pool_id, width, height, num_slices, num_mips, format)?;
        Ok(())
    }

    pub fn set_staging_budget(&mut self, budget: Vec<BudgetEntry>) {
        self.context.lock_state().set_budget(budget);
    }

    pub fn set_staging_texture_max_budget_bytes(&mut self, bytes: usize) {
        self.context.lock_state().staging_pool.set_max_budget_bytes(bytes);
    }
}

// 统计
impl TextureGpuManager {
    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = MemoryUsage::default();
        {
            let state = self.context.lock_state();
            usage.staging_available_bytes = state.staging_pool.available_bytes();
            usage.staging_in_use_bytes = state.staging_pool.in_use_bytes();
        }
        usage.pool_bytes = self.pools.total_bytes();

        for texture in self.textures.values() {
            match texture.residency() {
                GpuResidency::OnStorage => usage.num_on_storage += 1,
                GpuResidency::OnSystemRam => usage.num_on_system_ram += 1,
                GpuResidency::Resident => usage.num_resident += 1,
            }
            if texture.gpu_texture().is_some() {
                usage.texture_bytes += texture.size_bytes();
            }
            usage.sysram_bytes += texture.sysram_copy().map_or(0, <[u8]>::len);
        }
        usage
    }

    pub fn dump_stats(&self) {
        let usage = self.memory_usage();
        log::info!(
            "textures: {} resident, {} on system ram, {} on storage",
            usage.num_resident,
            usage.num_on_system_ram,
            usage.num_on_storage
        );
        log::info!(
            "memory: staging {} KiB available / {} KiB in use, textures {} KiB, pools {} KiB, system ram {} KiB",
            usage.staging_available_bytes / 1024,
            usage.staging_in_use_bytes / 1024,
            usage.texture_bytes / 1024,
            usage.pool_bytes / 1024,
            usage.sysram_bytes / 1024
        );
        if !self.pools.is_empty() {
            let pools = self
                .pools
                .pools()
                .map(|(_, pool)| {
                    format!(
                        "#{} {}x{} {} [{}/{}]",
                        pool.pool_id(),
                        pool.desc().width,
                        pool.desc().height,
                        pool.desc().format,
                        pool.used_slots().len(),
                        pool.num_slices()
                    )
                })
                .join(", ");
            log::info!("texture pools: {}", pools);
        }
    }
}

impl CommandExecutor for TextureGpuManager {
    fn transition_to_loaded(
        &mut self,
        handle: TextureHandle,
        generation: u32,
        desc: TextureDesc,
        residency: GpuResidency,
        sysram_copy: Option<PixelBuffer>,
        update_metadata_cache: bool,
    ) {
        let Some(texture) = self.textures.get_mut(handle) else {
            return;
        };
        if texture.load_generation() != generation {
            log::debug!("'{}': ignoring stale load result (generation {})", texture.alias(), generation);
            return;
        }

        if texture.residency() == GpuResidency::OnStorage {
            if let Err(e) = texture.set_desc(desc) {
                log::error!("{}", e);
            }
        } else if *texture.desc() != desc {
            log::warn!(
                "'{}': shape is frozen as {}, loaded {}",
                texture.alias(),
                describe_desc(texture.desc()),
                describe_desc(&desc)
            );
        }

        match residency {
            GpuResidency::Resident => {
                let alias = texture.alias().to_string();
                let allocated = texture.residency() == GpuResidency::Resident;
                if !allocated && let Err(e) = self.allocate_gpu_memory(handle, &desc) {
                    log::error!("'{}': failed to allocate gpu memory: {:#}", alias, e);
                    self.events
                        .push_error(handle, StreamingError::invalid_state(alias, format!("{:#}", e)));
                    return;
                }
                if let Some(texture) = self.textures.get_mut(handle) {
                    texture.set_residency(GpuResidency::Resident);
                }
                self.events.push(handle, TextureEventReason::GainedResidency);
            }
            GpuResidency::OnSystemRam => {
                texture.set_sysram_copy(sysram_copy);
                texture.set_residency(GpuResidency::OnSystemRam);
                self.events.push(handle, TextureEventReason::FromStorageToSysRam);
            }
            GpuResidency::OnStorage => {}
        }

        if update_metadata_cache {
            self.update_metadata_cache(handle);
        }
    }

    fn out_of_date_cache(&mut self, handle: TextureHandle, generation: u32, actual: TextureDesc) {
        let Some(texture) = self.textures.get(handle) else {
            return;
        };
        if texture.load_generation() != generation {
            return;
        }
        let alias = texture.alias().to_string();
        log::warn!("'{}': metadata cache is out of date, reloading as {}", alias, describe_desc(&actual));

        self.metadata_cache.remove(&alias);
        self.events.push(handle, TextureEventReason::MetadataCacheOutOfDate);

        self.release_gpu_memory(handle);
        if let Some(texture) = self.textures.get_mut(handle) {
            texture.set_residency(GpuResidency::OnStorage);
            texture.set_data_ready(false);
        }
        self.events.push(handle, TextureEventReason::LostResidency);

        // 正在执行的 ToResident 任务继续等待这次重新加载
        self.enqueue_load(handle, LoadTransition::ToResident, ShapeSource::Unknown, None, false);
    }

    fn exception_thrown(&mut self, handle: TextureHandle, error: StreamingError) {
        if self.textures.contains_key(handle) {
            self.events.push_error(handle, error);
        }
    }

    fn upload_from_staging(
        &mut self,
        handle: TextureHandle,
        generation: u32,
        src: &[u8],
        src_box: &TextureBox,
        dst_box: &TextureBox,
        mip: u8,
    ) {
        let Some(texture) = self.textures.get(handle) else {
            return;
        };
        if texture.load_generation() != generation {
            return;
        }

        let (dst, dst_box) = match (texture.gpu_texture(), texture.pool_slot()) {
            (Some(id), _) => (id, *dst_box),
            (None, Some(slot)) => {
                let Some(pool) = self.pools.pool(slot.pool) else {
                    log::error!("'{}': texture pool is gone", texture.alias());
                    return;
                };
                let mut dst_box = *dst_box;
                dst_box.slice_start += slot.slice;
                (pool.master_texture(), dst_box)
            }
            (None, None) => {
                log::error!("'{}': upload without gpu memory", texture.alias());
                return;
            }
        };

        if let Err(e) = self.backend.upload_from_staging(src, src_box, dst, &dst_box, mip) {
            log::error!("'{}': upload of mip {} failed: {:#}", texture.alias(), mip, e);
        }
    }

    fn notify_data_is_ready(
        &mut self,
        handle: TextureHandle,
        generation: u32,
        mut filters: Vec<Box<dyn TextureFilter>>,
        sysram_copy: Option<PixelBuffer>,
    ) {
        let Some(texture) = self.textures.get(handle) else {
            return;
        };
        if texture.load_generation() != generation {
            return;
        }

        if let Some(target) = self.target_gpu_texture(texture) {
            for filter in &mut filters {
                if let Err(e) = filter.run_serial(self.backend.as_ref(), target) {
                    log::error!("'{}': filter '{}' failed: {:#}", texture.alias(), filter.name(), e);
                }
            }
        }

        if let Some(texture) = self.textures.get_mut(handle) {
            texture.set_data_ready(true);
            if sysram_copy.is_some() {
                texture.set_sysram_copy(sysram_copy);
            }
        }
        self.events.push(handle, TextureEventReason::ReadyForRendering);
    }
}

impl Drop for TextureGpuManager {
    fn drop(&mut self) {
        let _span = tracy_client::span!("TextureGpuManager::drop");

        // multiload 先停下，之后不会再有请求进入收件箱
        self.multiload = None;
        self.context.request_shutdown();
        if let Some(thread) = self.streaming_thread.take()
            && thread.join().is_err()
        {
            log::error!("failed to join texture streaming thread");
        }

        {
            let mut state = self.context.lock_state();
            let frame = self.backend.frame_count();
            state.return_staging(&mut self.main_data.used_staging, frame);
            state.release_all();
        }
        self.main_data.command_buffer.clear();

        for texture in self.textures.values_mut() {
            if let Some(id) = texture.gpu_texture() {
                texture.set_gpu_texture(None);
                self.backend.destroy_texture(id);
            }
        }
        self.pools.destroy_all(self.backend.as_ref());
        log::info!("texture manager destroyed ({} textures)", self.textures.len());
    }
}
