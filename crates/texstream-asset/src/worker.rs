use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;

use crossbeam_channel::Receiver;
use crossbeam_utils::sync::{Parker, Unparker};
use texstream_gfx::backend::GpuBackend;
use texstream_gfx::texture_desc::{TextureBox, TextureDesc, TextureType};

use crate::archive::ResourceGroups;
use crate::codec::ImageCodecs;
use crate::command_buffer::{Command, CommandBuffer};
use crate::config::StreamingConfig;
use crate::error::StreamingError;
use crate::filters::{TextureFilter, create_filters, run_streaming_filters};
use crate::image::Image;
use crate::load_request::{CUBEMAP_SUFFIXES, LoadRequest, LoadTransition, SLICE_ALL, ShapeSource};
use crate::queued_image::QueuedImage;
use crate::staging::{BudgetEntry, StagingTexture, StagingTexturePool, StreamingData};
use crate::texture::{GpuResidency, TextureHandle};

/// 一个线程独占的数据
///
/// worker 和主线程各持有一份，在 streaming 锁内交换 (不拷贝)。
#[derive(Default)]
pub struct ThreadData {
    pub command_buffer: CommandBuffer,
    /// 本轮上传引用的 staging texture，命令执行完之后还给 pool
    pub used_staging: Vec<StagingTexture>,
}

/// 多文件 cubemap 中还没有到齐的面
struct PartialImage {
    generation: u32,
    /// 整个 cubemap 的形状
    desc: TextureDesc,
    transition: LoadTransition,
    slices_done: u32,
    /// 第一个面创建的 filter，所有面完成后随 `NotifyDataIsReady` 交给主线程
    filters: Vec<Box<dyn TextureFilter>>,
    /// 逐面拼出来的系统内存副本
    sysram: Option<Image>,
    /// 第一个面加载失败时是占位图，不能写进 metadata cache
    update_metadata_cache: bool,
}

/// worker 和主线程共享的状态，整个由一把锁保护
///
/// worker 的一轮 streaming (解码、filter、拷贝到 staging) 全部在锁内完成，
/// 主线程只有 `update` 开头的交换和结尾归还 staging 两处需要这把锁。
pub struct StreamingState {
    pub worker_data: ThreadData,

    backlog: VecDeque<LoadRequest>,
    queued_images: Vec<QueuedImage>,
    partial_images: HashMap<TextureHandle, PartialImage>,
    /// 每张纹理见过的最新加载代数
    newest_generation: HashMap<TextureHandle, u32>,
    /// 已经销毁的纹理，之后才到达的请求 (例如 multiload 中慢的解码) 直接丢弃
    forgotten: HashSet<TextureHandle>,

    pub streaming_data: StreamingData,
    pub staging_pool: StagingTexturePool,
    budget: Vec<BudgetEntry>,
}

// new & init
impl StreamingState {
    pub fn new(backend: Arc<dyn GpuBackend>, config: &StreamingConfig) -> Self {
        let mut budget = config.budget.clone();
        BudgetEntry::sort(&mut budget);
        Self {
            worker_data: ThreadData::default(),
            backlog: VecDeque::new(),
            queued_images: Vec::new(),
            partial_images: HashMap::new(),
            newest_generation: HashMap::new(),
            forgotten: HashSet::new(),
            streaming_data: StreamingData::default(),
            staging_pool: StagingTexturePool::new(backend, config.staging_texture_max_budget_bytes),
            budget,
        }
    }
}

// getter
impl StreamingState {
    #[inline]
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    #[inline]
    pub fn queued_images_len(&self) -> usize {
        self.queued_images.len()
    }

    #[inline]
    pub fn partial_images_len(&self) -> usize {
        self.partial_images.len()
    }

    /// worker 没有积压的工作
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.backlog.is_empty() && self.queued_images.is_empty()
    }

    #[inline]
    pub fn budget(&self) -> &[BudgetEntry] {
        &self.budget
    }
}

// 主线程调用 (持有锁)
impl StreamingState {
    pub fn swap_thread_data(&mut self, main_data: &mut ThreadData) {
        std::mem::swap(&mut self.worker_data, main_data);
    }

    /// 为 worker 的下一轮准备 staging
    pub fn fulfill_budget(&mut self) {
        self.streaming_data.fulfill_budget(&mut self.staging_pool, &self.budget);
    }

    /// 主线程执行完上传命令后归还 staging；GPU 会在 `frame` 中读取它们
    pub fn return_staging(&mut self, used: &mut Vec<StagingTexture>, frame: u64) {
        for mut staging in used.drain(..) {
            staging.stop_map_region(frame);
            self.staging_pool.return_staging_texture(staging);
        }
    }

    pub fn set_budget(&mut self, mut budget: Vec<BudgetEntry>) {
        BudgetEntry::sort(&mut budget);
        self.budget = budget;
    }

    /// 纹理已经销毁：丢弃它所有的工作，并且记住它，之后到达的请求不再处理
    pub fn forget_texture(&mut self, texture: TextureHandle) {
        self.newest_generation.remove(&texture);
        self.partial_images.remove(&texture);
        self.backlog.retain(|request| request.texture != texture);
        self.queued_images.retain(|queued| queued.texture != texture);
        self.forgotten.insert(texture);
    }

    /// 关闭时释放所有 staging，丢弃还没有完成的工作
    pub fn release_all(&mut self) {
        if !self.backlog.is_empty() || !self.queued_images.is_empty() {
            log::warn!(
                "shutting down with {} pending load requests and {} queued images",
                self.backlog.len(),
                self.queued_images.len()
            );
        }
        self.backlog.clear();
        self.queued_images.clear();
        self.partial_images.clear();
        self.newest_generation.clear();
        self.forgotten.clear();

        let frame = self.staging_pool.backend().frame_count();
        let mut used = std::mem::take(&mut self.worker_data.used_staging);
        self.return_staging(&mut used, frame);
        self.worker_data.command_buffer.clear();
        self.streaming_data.release_all(&mut self.staging_pool);
        self.staging_pool.destroy_all();
    }
}

// worker 调用 (持有锁)
impl StreamingState {
    #[inline]
    fn push_command(&mut self, command: Command) {
        self.worker_data.command_buffer.push(command);
    }

    /// 继续上传之前没有完成的图片
    fn process_queued_images(&mut self, max_preload_bytes: usize) {
        let mut i = 0;
        while i < self.queued_images.len() && self.streaming_data.bytes_preloaded < max_preload_bytes {
            let queued = &self.queued_images[i];
            let stale = self.forgotten.contains(&queued.texture)
                || self
                    .newest_generation
                    .get(&queued.texture)
                    .is_some_and(|&newest| queued.generation < newest);
            if stale {
                log::debug!("dropping stale queued image of '{}'", queued.texture_name);
                self.queued_images.remove(i);
                continue;
            }

            process_queued_image(&mut self.queued_images[i], &mut self.streaming_data, &mut self.worker_data);
            if self.queued_images[i].is_empty() {
                let queued = self.queued_images.remove(i);
                self.finish_queued_image(queued);
            } else {
                i += 1;
            }
        }
    }

    /// 开始处理新的加载请求；还不能处理的请求按原来的顺序留在 backlog 的前面
    fn process_new_requests(&mut self, ctx: &StreamingContext) {
        let mut deferred = VecDeque::new();
        let mut processed = 0;
        while processed < ctx.entries_per_iteration && self.streaming_data.bytes_preloaded < ctx.max_preload_bytes {
            let Some(request) = self.backlog.pop_front() else {
                break;
            };
            match self.process_request(ctx, request) {
                Some(request) => deferred.push_back(request),
                None => processed += 1,
            }
        }

        while let Some(request) = deferred.pop_back() {
            self.backlog.push_front(request);
        }
    }

    /// # return
    /// 请求暂时不能处理 (多文件 cubemap 的第一个面还没有到) 时原样返回
    fn process_request(&mut self, ctx: &StreamingContext, mut request: LoadRequest) -> Option<LoadRequest> {
        let _span = tracy_client::span!("StreamingState::process_request");
        let handle = request.texture;
        if self.forgotten.contains(&handle) {
            log::debug!("dropping load request '{}' of a destroyed texture", request.name);
            return None;
        }

        let newest = self.newest_generation.entry(handle).or_insert(request.generation);
        if request.generation < *newest {
            log::debug!(
                "dropping stale load request '{}' (generation {} < {})",
                request.name,
                request.generation,
                *newest
            );
            return None;
        }
        if request.generation > *newest {
            *newest = request.generation;
            self.partial_images.remove(&handle);
        }

        if !request.is_first_slice() {
            let first_face_done = self
                .partial_images
                .get(&handle)
                .is_some_and(|partial| partial.generation == request.generation);
            if !first_face_done {
                return Some(request);
            }
        }

        request.load_image(&ctx.groups, &ctx.codecs);
        if ctx.profile_loading
            && let Some(decode_time) = request.decode_time
        {
            self.push_command(Command::LogProfiling {
                texture_name: request.name.clone(),
                decode_time,
                size_bytes: request.image.as_ref().map(Image::size_bytes).unwrap_or(0),
            });
        }

        let multi_file = request.is_multi_file_face();
        let mut image = match request.image.take() {
            Some(image) => image,
            None => {
                let name = request.name.clone();
                let error = request
                    .load_error
                    .get_or_insert_with(|| StreamingError::Decode {
                        name,
                        reason: "no image was produced".to_string(),
                    })
                    .clone();
                log::error!("failed to load '{}' for texture '{}': {}", request.name, request.texture_name, error);
                self.push_command(Command::ExceptionThrown { texture: handle, error });

                // 用棋盘格代替，后续流程照常进行
                let expected = if request.is_first_slice() {
                    request.shape.desc().copied()
                } else {
                    self.partial_images.get(&handle).map(|partial| partial.desc)
                };
                match expected {
                    Some(desc) => Image::checkerboard(face_desc(&desc, multi_file)),
                    None => Image::fallback(),
                }
            }
        };

        let mut filters = create_filters(request.filters, request.texture_flags);
        run_streaming_filters(&mut filters, &mut image, &request.texture_name);

        if request.is_first_slice() {
            self.process_first_slice(request, image, filters);
        } else {
            self.process_other_face(request, image);
        }
        None
    }

    /// 第一个 slice 决定 (或者验证) 纹理的形状
    fn process_first_slice(&mut self, request: LoadRequest, mut image: Image, filters: Vec<Box<dyn TextureFilter>>) {
        let handle = request.texture;
        let multi_file = request.is_multi_file_face();
        // 占位图的形状不能进 metadata cache
        let update_metadata_cache = request.load_error.is_none();

        let mut desc = *image.desc();
        if multi_file {
            desc.depth_or_slices = CUBEMAP_SUFFIXES.len() as u32;
            desc.texture_type = TextureType::TypeCube;
        } else {
            desc.texture_type = promote_texture_type(request.initial_type, &desc);
        }

        let mut skip_transition = request.transition == LoadTransition::Reupload;
        match request.shape {
            ShapeSource::Predicted(predicted) if predicted != desc => {
                log::warn!(
                    "metadata cache of '{}' is out of date: cached {}, loaded {}. Rescheduling.",
                    request.texture_name,
                    describe_desc(&predicted),
                    describe_desc(&desc)
                );
                self.push_command(Command::OutOfDateCache {
                    texture: handle,
                    generation: request.generation,
                    actual: desc,
                });
                // 同一代的其他面都会被丢弃
                self.newest_generation.insert(handle, request.generation.wrapping_add(1));
                self.partial_images.remove(&handle);
                return;
            }
            // 主线程已经按照预测分配好了
            ShapeSource::Predicted(_) => skip_transition = true,
            ShapeSource::Frozen(frozen) if frozen != desc => {
                let error = StreamingError::ShapeMismatch {
                    name: request.texture_name.clone(),
                    expected: describe_desc(&frozen),
                    actual: describe_desc(&desc),
                };
                log::error!("{}", error);
                self.push_command(Command::ExceptionThrown { texture: handle, error });
                desc = frozen;
                image = Image::checkerboard(face_desc(&frozen, multi_file));
            }
            _ => {}
        }

        if request.transition == LoadTransition::ToSystemRam {
            if multi_file {
                let mut sysram = Image::checkerboard(desc);
                if let Err(e) = sysram.copy_into_slice(0, &image) {
                    log::warn!("'{}': failed to copy face 0 into the system ram copy: {}", request.texture_name, e);
                }
                self.partial_images.insert(
                    handle,
                    PartialImage {
                        generation: request.generation,
                        desc,
                        transition: request.transition,
                        slices_done: 1,
                        filters: Vec::new(),
                        sysram: Some(sysram),
                        update_metadata_cache,
                    },
                );
            } else {
                self.push_command(Command::TransitionToLoaded {
                    texture: handle,
                    generation: request.generation,
                    desc,
                    residency: GpuResidency::OnSystemRam,
                    sysram_copy: Some(image.into_buffer()),
                    update_metadata_cache,
                });
            }
            return;
        }

        if !skip_transition {
            self.push_command(Command::TransitionToLoaded {
                texture: handle,
                generation: request.generation,
                desc,
                residency: GpuResidency::Resident,
                sysram_copy: None,
                update_metadata_cache,
            });
        }

        let queued_filters = if multi_file {
            self.partial_images.insert(
                handle,
                PartialImage {
                    generation: request.generation,
                    desc,
                    transition: request.transition,
                    slices_done: 0,
                    filters,
                    sysram: request.keep_sysram_copy.then(|| Image::checkerboard(desc)),
                    update_metadata_cache,
                },
            );
            Vec::new()
        } else {
            filters
        };

        let dst = if multi_file { 0 } else { SLICE_ALL };
        let mut queued = QueuedImage::new(handle, request.texture_name, request.generation, image, dst, queued_filters);
        queued.keep_sysram_copy = request.keep_sysram_copy;
        self.start_upload(queued);
    }

    /// 多文件 cubemap 的其他面，第一个面已经确定了形状
    fn process_other_face(&mut self, request: LoadRequest, mut image: Image) {
        let handle = request.texture;
        let face = request.slice_or_depth;
        let Some(partial) = self.partial_images.get_mut(&handle) else {
            return;
        };

        let expected = face_desc(&partial.desc, true);
        if *image.desc() != expected {
            let error = StreamingError::ShapeMismatch {
                name: format!("{} (face {})", request.texture_name, face),
                expected: describe_desc(&expected),
                actual: describe_desc(image.desc()),
            };
            log::error!("{}", error);
            self.worker_data
                .command_buffer
                .push(Command::ExceptionThrown { texture: handle, error });
            image = Image::checkerboard(expected);
        }

        if partial.transition != LoadTransition::ToSystemRam {
            let mut queued =
                QueuedImage::new(handle, request.texture_name, request.generation, image, face, Vec::new());
            queued.keep_sysram_copy = request.keep_sysram_copy;
            self.start_upload(queued);
            return;
        }

        if let Some(sysram) = &mut partial.sysram
            && let Err(e) = sysram.copy_into_slice(face, &image)
        {
            log::warn!("'{}': failed to copy face {} into the system ram copy: {}", request.texture_name, face, e);
        }
        partial.slices_done += 1;
        if partial.slices_done as usize == CUBEMAP_SUFFIXES.len()
            && let Some(partial) = self.partial_images.remove(&handle)
        {
            self.push_command(Command::TransitionToLoaded {
                texture: handle,
                generation: partial.generation,
                desc: partial.desc,
                residency: GpuResidency::OnSystemRam,
                sysram_copy: partial.sysram.map(Image::into_buffer),
                update_metadata_cache: partial.update_metadata_cache,
            });
        }
    }

    /// 立即尝试上传，放不下的部分留在队列里
    fn start_upload(&mut self, mut queued: QueuedImage) {
        process_queued_image(&mut queued, &mut self.streaming_data, &mut self.worker_data);
        if queued.is_empty() {
            self.finish_queued_image(queued);
        } else {
            self.queued_images.push(queued);
        }
    }

    fn finish_queued_image(&mut self, queued: QueuedImage) {
        let is_partial = queued.is_partial();
        let QueuedImage {
            texture,
            generation,
            image,
            dst_slice_or_depth,
            filters,
            keep_sysram_copy,
            ..
        } = queued;

        if !is_partial {
            self.push_command(Command::NotifyDataIsReady {
                texture,
                generation,
                filters,
                sysram_copy: keep_sysram_copy.then(|| image.into_buffer()),
            });
            return;
        }

        let Some(partial) = self.partial_images.get_mut(&texture) else {
            return;
        };
        if partial.generation != generation {
            return;
        }
        if let Some(sysram) = &mut partial.sysram
            && let Err(e) = sysram.copy_into_slice(dst_slice_or_depth, &image)
        {
            log::warn!("failed to copy face {} into the system ram copy: {}", dst_slice_or_depth, e);
        }

        partial.slices_done += 1;
        if partial.slices_done as usize == CUBEMAP_SUFFIXES.len()
            && let Some(partial) = self.partial_images.remove(&texture)
        {
            self.push_command(Command::NotifyDataIsReady {
                texture,
                generation,
                filters: partial.filters,
                sysram_copy: partial.sysram.map(Image::into_buffer),
            });
        }
    }
}

/// 把图片中还没有上传的 (mip, slice) 尽可能拷贝到 staging 中
///
/// 每个 slice (3D 纹理的每层 depth) 单独申请一块区域，放不下的留到下一轮。
fn process_queued_image(queued: &mut QueuedImage, streaming_data: &mut StreamingData, thread_data: &mut ThreadData) {
    let Some(min_mip) = queued.min_mip() else {
        return;
    };
    let max_mip = queued.max_mip_plus_one();
    let format = queued.image.format();
    let is_3d = queued.image.texture_type().is_3d();
    let slice_offset = if queued.is_partial() { queued.dst_slice_or_depth } else { 0 };

    for mip in min_mip..max_mip {
        let (width, height, _) = queued.image.desc().mip_extent(mip);
        for z in 0..queued.image.mip_depth_or_slices(mip) {
            if !queued.is_mip_slice_queued(mip, z) {
                continue;
            }
            let Some((index, region)) =
                streaming_data.map_streaming_region(&mut thread_data.used_staging, width, height, 1, 1, format)
            else {
                continue;
            };

            thread_data.used_staging[index]
                .region_data_mut(&region)
                .copy_from_slice(queued.image.slice_data(mip, z));

            let mut dst_box = TextureBox::new(width, height, 1, 1, format);
            if is_3d {
                dst_box.z = z;
            } else {
                dst_box.slice_start = slice_offset + z;
            }
            thread_data.command_buffer.push(Command::UploadFromStagingTex {
                texture: queued.texture,
                generation: queued.generation,
                region,
                dst_box,
                mip,
            });
            queued.unqueue_mip_slice(mip, z);
        }
    }
}

/// 多文件 cubemap 中单个面的形状
fn face_desc(desc: &TextureDesc, multi_file: bool) -> TextureDesc {
    if !multi_file {
        return *desc;
    }
    TextureDesc {
        depth_or_slices: 1,
        texture_type: TextureType::Type2D,
        ..*desc
    }
}

/// 解码器只会产生 2D 图片，按照纹理创建时的类型修正
fn promote_texture_type(initial_type: TextureType, desc: &TextureDesc) -> TextureType {
    match (initial_type, desc.texture_type) {
        (TextureType::Type1D, TextureType::Type2D) if desc.height == 1 => TextureType::Type1D,
        (TextureType::Type2DArray, TextureType::Type2D) => TextureType::Type2DArray,
        (_, texture_type) => texture_type,
    }
}

pub(crate) fn describe_desc(desc: &TextureDesc) -> String {
    format!(
        "{}x{}x{} {} ({} mips, {:?})",
        desc.width, desc.height, desc.depth_or_slices, desc.format, desc.num_mips, desc.texture_type
    )
}

/// streaming worker 和主线程之间共享的一切
pub struct StreamingContext {
    state: Mutex<StreamingState>,
    /// 任意线程提交的加载请求，worker 每一轮开始时取走
    inbox: Receiver<LoadRequest>,

    groups: Arc<ResourceGroups>,
    codecs: Arc<ImageCodecs>,

    main_thread: Unparker,
    worker_thread: Unparker,
    shutting_down: AtomicBool,

    max_preload_bytes: usize,
    entries_per_iteration: usize,
    profile_loading: bool,
}

// new & init
impl StreamingContext {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        groups: Arc<ResourceGroups>,
        codecs: Arc<ImageCodecs>,
        inbox: Receiver<LoadRequest>,
        main_thread: Unparker,
        worker_thread: Unparker,
        config: &StreamingConfig,
    ) -> Self {
        Self {
            state: Mutex::new(StreamingState::new(backend, config)),
            inbox,
            groups,
            codecs,
            main_thread,
            worker_thread,
            shutting_down: AtomicBool::new(false),
            max_preload_bytes: config.max_preload_bytes,
            entries_per_iteration: config.entries_to_process_per_iteration.max(1),
            profile_loading: config.profile_loading,
        }
    }
}

// 锁与唤醒
impl StreamingContext {
    pub fn lock_state(&self) -> MutexGuard<'_, StreamingState> {
        // worker panic 之后状态仍然是一致的 (每次修改都在锁内完成)，继续使用
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn try_lock_state(&self) -> Option<MutexGuard<'_, StreamingState>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    #[inline]
    pub fn inbox_is_empty(&self) -> bool {
        self.inbox.is_empty()
    }

    #[inline]
    pub fn wake_worker(&self) {
        self.worker_thread.unpark();
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.worker_thread.unpark();
    }
}

impl StreamingContext {
    /// worker 的一轮
    ///
    /// 1. 取走收件箱中的请求
    /// 2. 优先继续上传之前没有完成的图片
    /// 3. 开始处理一小批新的请求
    /// 4. 把这一轮的 staging 需求合并到统计中，供主线程准备下一轮的 staging
    pub fn update_streaming(&self) {
        let _span = tracy_client::span!("StreamingContext::update_streaming");
        let mut state = self.lock_state();

        while let Ok(request) = self.inbox.try_recv() {
            state.backlog.push_back(request);
        }
        let processed_any = !state.backlog.is_empty() || !state.queued_images.is_empty();

        state.process_queued_images(self.max_preload_bytes);
        state.process_new_requests(self);
        state.streaming_data.merge_usage_stats_into_prev_stats();
        drop(state);

        if processed_any {
            self.main_thread.unpark();
        }
    }
}

/// 启动 streaming worker 线程：被唤醒一次执行一轮，直到关闭
pub fn spawn_streaming_thread(ctx: Arc<StreamingContext>, parker: Parker) -> anyhow::Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("TextureStreamingThread".to_string())
        .spawn(move || {
            log::info!("texture streaming thread started");
            loop {
                parker.park();
                if ctx.is_shutting_down() {
                    break;
                }
                ctx.update_streaming();
            }
            log::info!("texture streaming thread stopped");
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::Sender;
    use slotmap::KeyData;
    use texstream_gfx::headless::HeadlessGpu;
    use texstream_gfx::pixel_format::PixelFormat;

    use super::*;
    use crate::archive::MemoryArchive;
    use crate::filters::FilterFlags;
    use crate::texture::TextureFlags;

    struct Fixture {
        ctx: StreamingContext,
        inbox: Sender<LoadRequest>,
        archive: Arc<MemoryArchive>,
        _main: Parker,
        _worker: Parker,
    }

    fn fixture() -> Fixture {
        let gpu = Arc::new(HeadlessGpu::default());
        let archive = Arc::new(MemoryArchive::new("mem"));
        let groups = Arc::new(ResourceGroups::new());
        groups.add_archive("General", archive.clone());

        let (tx, rx) = crossbeam_channel::unbounded();
        let (main, worker) = (Parker::new(), Parker::new());
        let config = StreamingConfig {
            budget: Vec::new(),
            ..Default::default()
        };
        let ctx = StreamingContext::new(
            gpu,
            groups,
            Arc::new(ImageCodecs::default()),
            rx,
            main.unparker().clone(),
            worker.unparker().clone(),
            &config,
        );
        Fixture {
            ctx,
            inbox: tx,
            archive,
            _main: main,
            _worker: worker,
        }
    }

    fn request(name: &str, initial_type: TextureType) -> LoadRequest {
        LoadRequest {
            texture: TextureHandle::from(KeyData::from_ffi(1)),
            texture_name: name.to_string(),
            name: name.to_string(),
            resource_group: "General".to_string(),
            image: None,
            load_error: None,
            slice_or_depth: SLICE_ALL,
            filters: FilterFlags::empty(),
            texture_flags: TextureFlags::empty(),
            initial_type,
            shape: ShapeSource::Unknown,
            transition: LoadTransition::ToResident,
            generation: 0,
            skip_multiload: false,
            keep_sysram_copy: false,
            decode_time: None,
        }
    }

    fn encode_png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn command_names(state: &StreamingState) -> Vec<&'static str> {
        state
            .worker_data
            .command_buffer
            .commands()
            .iter()
            .map(|command| match command {
                Command::TransitionToLoaded { .. } => "loaded",
                Command::OutOfDateCache { .. } => "out_of_date",
                Command::ExceptionThrown { .. } => "exception",
                Command::UploadFromStagingTex { .. } => "upload",
                Command::NotifyDataIsReady { .. } => "ready",
                Command::LogProfiling { .. } => "profiling",
            })
            .collect()
    }

    #[test]
    fn test_missing_resource_falls_back() {
        let f = fixture();
        f.inbox.send(request("missing.png", TextureType::Type2D)).unwrap();
        f.ctx.update_streaming();

        let state = f.ctx.lock_state();
        // 没有预热的 staging，上传留在队列中
        assert_eq!(command_names(&state), vec!["exception", "loaded"]);
        assert_eq!(state.queued_images_len(), 1);
        match &state.worker_data.command_buffer.commands()[1] {
            Command::TransitionToLoaded { desc, .. } => assert_eq!((desc.width, desc.height), (2, 2)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_other_faces_wait_for_first_face() {
        let f = fixture();
        for face in 0..6 {
            f.archive
                .insert(crate::load_request::face_resource_name("sky.png", face), encode_png(4, 4));
        }

        // 第二个面先到
        let faces = request("sky.png", TextureType::TypeCube).fan_out();
        assert_eq!(faces.len(), 6);
        let mut faces = faces.into_iter();
        let first = faces.next().unwrap();
        let second = faces.next().unwrap();
        f.inbox.send(second).unwrap();
        f.inbox.send(first).unwrap();
        f.ctx.update_streaming();

        {
            let state = f.ctx.lock_state();
            assert_eq!(state.backlog_len(), 1);
            assert_eq!(state.partial_images_len(), 1);
            match &state.worker_data.command_buffer.commands()[0] {
                Command::TransitionToLoaded { desc, .. } => {
                    assert_eq!(desc.depth_or_slices, 6);
                    assert_eq!(desc.texture_type, TextureType::TypeCube);
                }
                _ => unreachable!(),
            }
        }

        f.ctx.update_streaming();
        assert_eq!(f.ctx.lock_state().backlog_len(), 0);
    }

    #[test]
    fn test_out_of_date_prediction_drops_siblings() {
        let f = fixture();
        for face in 0..6 {
            f.archive
                .insert(crate::load_request::face_resource_name("sky.png", face), encode_png(8, 8));
        }

        let mut req = request("sky.png", TextureType::TypeCube);
        req.shape = ShapeSource::Predicted(TextureDesc {
            width: 4,
            height: 4,
            depth_or_slices: 6,
            num_mips: 1,
            format: PixelFormat::Rgba8Unorm,
            texture_type: TextureType::TypeCube,
        });
        for face in req.fan_out() {
            f.inbox.send(face).unwrap();
        }
        f.ctx.update_streaming();
        f.ctx.update_streaming();

        let state = f.ctx.lock_state();
        assert_eq!(command_names(&state), vec!["out_of_date"]);
        assert_eq!(state.backlog_len(), 0);
        assert_eq!(state.partial_images_len(), 0);
    }

    #[test]
    fn test_late_face_of_destroyed_texture_is_dropped() {
        let f = fixture();
        let mut faces = request("sky.png", TextureType::TypeCube).fan_out();
        let late = faces.swap_remove(3);
        let handle = late.texture;

        f.ctx.lock_state().forget_texture(handle);
        f.inbox.send(late).unwrap();
        for _ in 0..3 {
            f.ctx.update_streaming();
        }

        let state = f.ctx.lock_state();
        assert_eq!(state.backlog_len(), 0);
        assert!(state.is_idle());
        assert!(state.worker_data.command_buffer.is_empty());
    }

    #[test]
    fn test_late_sibling_after_out_of_date_is_dropped() {
        let f = fixture();
        f.archive
            .insert(crate::load_request::face_resource_name("sky.png", 0), encode_png(8, 8));

        let mut req = request("sky.png", TextureType::TypeCube);
        req.shape = ShapeSource::Predicted(TextureDesc {
            width: 4,
            height: 4,
            depth_or_slices: 6,
            num_mips: 1,
            format: PixelFormat::Rgba8Unorm,
            texture_type: TextureType::TypeCube,
        });
        let mut faces = req.fan_out().into_iter();
        let first = faces.next().unwrap();
        let late: Vec<LoadRequest> = faces.collect();

        f.inbox.send(first).unwrap();
        f.ctx.update_streaming();
        // 重新调度之后，上一代其他面的解码才完成
        for face in late {
            f.inbox.send(face).unwrap();
        }
        f.ctx.update_streaming();
        f.ctx.update_streaming();

        let state = f.ctx.lock_state();
        assert_eq!(command_names(&state), vec!["out_of_date"]);
        assert_eq!(state.backlog_len(), 0);
        assert_eq!(state.partial_images_len(), 0);
        assert!(state.is_idle());
    }

    #[test]
    fn test_texture_type_promotion() {
        let desc = TextureDesc::new_2d(16, 1, 1, PixelFormat::R8Unorm);
        assert_eq!(promote_texture_type(TextureType::Type1D, &desc), TextureType::Type1D);
        assert_eq!(promote_texture_type(TextureType::Type2DArray, &desc), TextureType::Type2DArray);
        assert_eq!(promote_texture_type(TextureType::Type2D, &desc), TextureType::Type2D);

        let tall = TextureDesc::new_2d(16, 4, 1, PixelFormat::R8Unorm);
        assert_eq!(promote_texture_type(TextureType::Type1D, &tall), TextureType::Type2D);
    }
}
