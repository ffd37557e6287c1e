use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::Sender;
use crossbeam_utils::sync::{Unparker, WaitGroup};

use crate::archive::ResourceGroups;
use crate::codec::ImageCodecs;
use crate::load_request::LoadRequest;

/// 把磁盘读取和解码从 streaming worker 上拿走
///
/// ## 架构
/// - 内部的 dispatch 线程接收加载请求，分发到 rayon 线程池
/// - 线程池中的任务读取并解码图片，然后把带着图片的请求送回 worker 的收件箱
/// - 任务不接触 GPU，也不接触 command buffer
///
/// 送回收件箱的顺序就是解码完成的顺序；worker 按照到达收件箱的顺序处理。
pub struct MultiLoadPool {
    /// 用于向 dispatch 线程发送请求
    request_sender: Option<Sender<LoadRequest>>,
    dispatch_thread: Option<thread::JoinHandle<()>>,

    /// 已经提交、但还没有送回收件箱的请求数
    in_flight: Arc<AtomicUsize>,
}

impl MultiLoadPool {
    /// # Params
    /// * `inbox` - worker 的收件箱，解码完成的请求送到这里
    /// * `worker` - 唤醒 worker
    pub fn new(
        num_threads: usize,
        groups: Arc<ResourceGroups>,
        codecs: Arc<ImageCodecs>,
        inbox: Sender<LoadRequest>,
        worker: Unparker,
    ) -> anyhow::Result<Self> {
        let (req_tx, req_rx) = crossbeam_channel::unbounded::<LoadRequest>();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("Texture-Multiload-{}", index))
            .build()?;

        let task_in_flight = in_flight.clone();
        let dispatch_thread = thread::Builder::new()
            .name("TextureMultiloadDispatch".to_string())
            .spawn(move || {
                let wait_group = WaitGroup::new();

                while let Ok(req) = req_rx.recv() {
                    let _span = tracy_client::span!("MultiLoadPool::dispatch");

                    let groups = groups.clone();
                    let codecs = codecs.clone();
                    let inbox = inbox.clone();
                    let worker = worker.clone();
                    let in_flight = task_in_flight.clone();
                    // 任务结束时闭包被销毁，wg_task 随之 drop
                    let wg_task = wait_group.clone();

                    pool.spawn(move || {
                        let req = load_texture_task(req, &groups, &codecs);
                        if inbox.send(req).is_err() {
                            log::warn!("streaming worker is gone, dropping decoded texture");
                        }
                        worker.unpark();
                        // 先送进收件箱再减计数，保证主线程不会在两者之间看到"空闲"
                        in_flight.fetch_sub(1, Ordering::AcqRel);
                        drop(wg_task);
                    });
                }

                wait_group.wait();
            })?;

        log::info!("multiload pool started with {} threads", num_threads);
        Ok(Self {
            request_sender: Some(req_tx),
            dispatch_thread: Some(dispatch_thread),
            in_flight,
        })
    }

    /// 提交一个需要解码的请求；失败时返回请求，由调用者直接交给 worker
    pub fn request_load(&self, req: LoadRequest) -> Result<(), LoadRequest> {
        let Some(sender) = &self.request_sender else {
            return Err(req);
        };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = sender.send(req) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            log::error!("failed to send texture load request to the multiload pool");
            return Err(e.into_inner());
        }
        Ok(())
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }
}

impl Drop for MultiLoadPool {
    fn drop(&mut self) {
        // 必须先 drop sender，否则 dispatch 线程的 recv 会一直阻塞
        self.request_sender = None;

        log::info!("multiload pool is being dropped, waiting for tasks to complete...");
        if let Some(thread) = self.dispatch_thread.take()
            && thread.join().is_err()
        {
            log::error!("failed to join texture multiload dispatch thread");
        }
        log::info!("all multiload tasks completed");
    }
}

/// 运行在线程池中：读取 + 解码
fn load_texture_task(mut req: LoadRequest, groups: &ResourceGroups, codecs: &ImageCodecs) -> LoadRequest {
    let _span = tracy_client::span!("load_texture_task");
    log::debug!("multiload: loading '{}' (slice {})", req.name, req.slice_or_depth);

    req.load_image(groups, codecs);
    if let Some(e) = &req.load_error {
        log::error!("multiload: failed to load '{}': {}", req.name, e);
    }
    req
}
