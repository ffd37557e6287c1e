use std::collections::{HashMap, VecDeque};

use texstream_gfx::backend::mip_offset;
use texstream_gfx::texture_desc::TextureDesc;

use crate::error::StreamingError;
use crate::image::{Image, PixelBuffer};
use crate::listener::TextureEventReason;
use crate::load_request::{LoadTransition, ShapeSource};
use crate::manager::TextureGpuManager;
use crate::texture::{GpuPageOutStrategy, GpuResidency, TextureHandle};

/// 对纹理的一次延迟操作
#[derive(Debug)]
pub enum ScheduledTask {
    Transition {
        target: GpuResidency,
        /// 调用者提供的图片，不从资源组读取
        image: Option<Image>,
        reupload: bool,
        skip_multiload: bool,
    },
    Destroy,
}

/// 每张纹理一个 FIFO
///
/// 同一张纹理同一时刻最多只有一个任务在执行 (`in_flight`)：它发起的加载完成之前，
/// 后面的任务都在队列里等待，按照提交顺序依次执行。
#[derive(Debug, Default)]
pub struct ScheduledTasks {
    queues: HashMap<TextureHandle, VecDeque<ScheduledTask>>,
    /// 正在等待 worker 完成的加载
    in_flight: HashMap<TextureHandle, LoadTransition>,
}

impl ScheduledTasks {
    /// 有任务正在执行，或者还有任务在排队
    pub fn is_busy(&self, texture: TextureHandle) -> bool {
        self.in_flight.contains_key(&texture) || self.queues.get(&texture).is_some_and(|queue| !queue.is_empty())
    }

    pub fn push(&mut self, texture: TextureHandle, task: ScheduledTask) {
        self.queues.entry(texture).or_default().push_back(task);
    }

    pub fn pop(&mut self, texture: TextureHandle) -> Option<ScheduledTask> {
        let queue = self.queues.get_mut(&texture)?;
        let task = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&texture);
        }
        task
    }

    #[inline]
    pub fn in_flight(&self, texture: TextureHandle) -> Option<LoadTransition> {
        self.in_flight.get(&texture).copied()
    }

    pub fn set_in_flight(&mut self, texture: TextureHandle, transition: LoadTransition) {
        self.in_flight.insert(texture, transition);
    }

    pub fn clear_in_flight(&mut self, texture: TextureHandle) -> Option<LoadTransition> {
        self.in_flight.remove(&texture)
    }

    pub fn num_queued(&self, texture: TextureHandle) -> usize {
        self.queues.get(&texture).map_or(0, VecDeque::len)
    }

    pub fn is_destroy_scheduled(&self, texture: TextureHandle) -> bool {
        self.queues
            .get(&texture)
            .is_some_and(|queue| queue.iter().any(|task| matches!(task, ScheduledTask::Destroy)))
    }

    /// 纹理已经销毁，丢弃剩下的所有任务
    ///
    /// # return
    /// 被丢弃的任务数
    pub fn discard(&mut self, texture: TextureHandle) -> usize {
        self.in_flight.remove(&texture);
        self.queues.remove(&texture).map_or(0, |queue| queue.len())
    }
}

/// 执行一个任务的结果
enum TaskOutcome {
    /// 同步完成
    Completed,
    /// 发起了加载，等待 worker 的通知
    InFlight(LoadTransition),
    /// 纹理已经被销毁
    Destroyed,
}

// 驻留状态机
impl TextureGpuManager {
    /// 提交一个任务：纹理空闲时立即执行，否则排队
    pub(crate) fn schedule_task(&mut self, handle: TextureHandle, task: ScheduledTask) {
        let Some(texture) = self.textures.get_mut(handle) else {
            return;
        };
        texture.add_pending_residency_change();

        if self.scheduled.is_busy(handle) {
            log::debug!(
                "'{}': task queued behind {} pending residency changes",
                texture.alias(),
                texture.pending_residency_changes() - 1
            );
            self.scheduled.push(handle, task);
            return;
        }
        self.run_tasks(handle, task);
    }

    /// 执行任务，同步完成的话继续执行队列中的下一个
    fn run_tasks(&mut self, handle: TextureHandle, task: ScheduledTask) {
        let mut next = Some(task);
        while let Some(task) = next.take() {
            match self.execute_task(handle, task) {
                TaskOutcome::Completed => {
                    if let Some(texture) = self.textures.get_mut(handle) {
                        texture.remove_pending_residency_change();
                    }
                    next = self.scheduled.pop(handle);
                }
                TaskOutcome::InFlight(transition) => self.scheduled.set_in_flight(handle, transition),
                TaskOutcome::Destroyed => {
                    let discarded = self.scheduled.discard(handle);
                    if discarded > 0 {
                        log::warn!("{} tasks scheduled after destroy were discarded", discarded);
                    }
                }
            }
        }
    }

    /// worker 发来的通知意味着正在执行的加载完成了
    pub(crate) fn on_texture_event(&mut self, handle: TextureHandle, reason: TextureEventReason) {
        let Some(transition) = self.scheduled.in_flight(handle) else {
            return;
        };
        let completed = match reason {
            TextureEventReason::ReadyForRendering => transition != LoadTransition::ToSystemRam,
            TextureEventReason::FromStorageToSysRam => transition == LoadTransition::ToSystemRam,
            _ => false,
        };
        if !completed {
            return;
        }

        self.scheduled.clear_in_flight(handle);
        if let Some(texture) = self.textures.get_mut(handle) {
            texture.remove_pending_residency_change();
        }
        if let Some(next) = self.scheduled.pop(handle) {
            self.run_tasks(handle, next);
        }
    }

    fn execute_task(&mut self, handle: TextureHandle, task: ScheduledTask) -> TaskOutcome {
        let Some(texture) = self.textures.get(handle) else {
            return TaskOutcome::Destroyed;
        };
        let (target, image, reupload, skip_multiload) = match task {
            ScheduledTask::Destroy => {
                self.destroy_now(handle);
                return TaskOutcome::Destroyed;
            }
            ScheduledTask::Transition {
                target,
                image,
                reupload,
                skip_multiload,
            } => (target, image, reupload, skip_multiload),
        };

        let current = texture.residency();
        let desc = *texture.desc();
        if reupload {
            self.enqueue_load(handle, LoadTransition::Reupload, ShapeSource::Frozen(desc), image, skip_multiload);
            return TaskOutcome::InFlight(LoadTransition::Reupload);
        }

        log::debug!("'{}': {:?} -> {:?}", texture.alias(), current, target);
        match (current, target) {
            (GpuResidency::OnStorage, GpuResidency::OnStorage)
            | (GpuResidency::OnSystemRam, GpuResidency::OnSystemRam)
            | (GpuResidency::Resident, GpuResidency::Resident) => TaskOutcome::Completed,
            (GpuResidency::OnStorage, GpuResidency::Resident) => self.storage_to_resident(handle, image, skip_multiload),
            (GpuResidency::OnStorage, GpuResidency::OnSystemRam) => {
                self.enqueue_load(handle, LoadTransition::ToSystemRam, ShapeSource::Unknown, image, skip_multiload);
                TaskOutcome::InFlight(LoadTransition::ToSystemRam)
            }
            (GpuResidency::OnSystemRam, GpuResidency::Resident) => self.system_ram_to_resident(handle, desc),
            (GpuResidency::OnSystemRam, _) => {
                if let Some(texture) = self.textures.get_mut(handle) {
                    texture.set_sysram_copy(None);
                    texture.set_residency(GpuResidency::OnStorage);
                }
                TaskOutcome::Completed
            }
            (GpuResidency::Resident, GpuResidency::OnSystemRam) => {
                self.resident_to_system_ram(handle, desc);
                TaskOutcome::Completed
            }
            (GpuResidency::Resident, _) => {
                self.release_gpu_memory(handle);
                if let Some(texture) = self.textures.get_mut(handle) {
                    texture.set_sysram_copy(None);
                    texture.set_residency(GpuResidency::OnStorage);
                    texture.set_data_ready(false);
                }
                self.events.push(handle, TextureEventReason::LostResidency);
                TaskOutcome::Completed
            }
        }
    }

    fn storage_to_resident(&mut self, handle: TextureHandle, image: Option<Image>, skip_multiload: bool) -> TaskOutcome {
        let Some(texture) = self.textures.get(handle) else {
            return TaskOutcome::Destroyed;
        };

        // 手动填充的纹理只需要分配内存
        if texture.is_manual() {
            let desc = *texture.desc();
            let alias = texture.alias().to_string();
            if let Err(e) = self.allocate_gpu_memory(handle, &desc) {
                log::error!("'{}': failed to allocate manual texture: {:#}", alias, e);
                let error = StreamingError::invalid_state(alias, format!("{:#}", e));
                self.events.push_error(handle, error);
                return TaskOutcome::Completed;
            }
            if let Some(texture) = self.textures.get_mut(handle) {
                texture.set_residency(GpuResidency::Resident);
                texture.set_data_ready(true);
            }
            self.events.push(handle, TextureEventReason::GainedResidency);
            return TaskOutcome::Completed;
        }

        let shape = match image {
            Some(_) => ShapeSource::Unknown,
            None => self.apply_metadata_cache(handle),
        };
        self.enqueue_load(handle, LoadTransition::ToResident, shape, image, skip_multiload);
        TaskOutcome::InFlight(LoadTransition::ToResident)
    }

    /// 按照 metadata cache 的预测提前分配内存并进入 Resident
    ///
    /// # return
    /// 预测成功应用时返回 `Predicted`，之后由 worker 验证
    fn apply_metadata_cache(&mut self, handle: TextureHandle) -> ShapeSource {
        let Some(texture) = self.textures.get(handle) else {
            return ShapeSource::Unknown;
        };
        let Some(entry) = self.metadata_cache.get(texture.alias()).copied() else {
            return ShapeSource::Unknown;
        };
        if entry.desc.texture_type != texture.texture_type() {
            return ShapeSource::Unknown;
        }

        if let Some(texture) = self.textures.get_mut(handle)
            && let Err(e) = texture.set_desc(entry.desc)
        {
            log::warn!("'{}': cannot apply metadata cache: {}", texture.alias(), e);
            return ShapeSource::Unknown;
        }
        if let Err(e) = self.allocate_gpu_memory(handle, &entry.desc) {
            log::warn!("failed to allocate from metadata cache: {:#}", e);
            return ShapeSource::Unknown;
        }
        if let Some(texture) = self.textures.get_mut(handle) {
            texture.set_residency(GpuResidency::Resident);
        }
        self.events.push(handle, TextureEventReason::GainedResidency);
        ShapeSource::Predicted(entry.desc)
    }

    fn system_ram_to_resident(&mut self, handle: TextureHandle, desc: TextureDesc) -> TaskOutcome {
        let Some(texture) = self.textures.get_mut(handle) else {
            return TaskOutcome::Destroyed;
        };

        let buffer = match texture.page_out_strategy() {
            GpuPageOutStrategy::AlwaysKeepSystemRamCopy => {
                texture.sysram_copy().map(|bytes| PixelBuffer::Owned(bytes.to_vec()))
            }
            _ => texture.take_sysram_copy(),
        };

        let image = match buffer.map(|buffer| Image::load_dynamic_image(buffer, desc)) {
            Some(Ok(image)) => Some(image),
            Some(Err(e)) => {
                log::error!("'{}': system ram copy is unusable: {:#}", texture.alias(), e);
                let error = StreamingError::invalid_state(texture.alias(), format!("{:#}", e));
                self.events.push_error(handle, error);
                Some(Image::checkerboard(desc))
            }
            // 没有副本，只能重新从资源组读取
            None => None,
        };

        let skip_multiload = image.is_some();
        self.enqueue_load(handle, LoadTransition::ToResident, ShapeSource::Frozen(desc), image, skip_multiload);
        TaskOutcome::InFlight(LoadTransition::ToResident)
    }

    fn resident_to_system_ram(&mut self, handle: TextureHandle, desc: TextureDesc) {
        let Some(texture) = self.textures.get(handle) else {
            return;
        };
        let keep_existing = texture.page_out_strategy() == GpuPageOutStrategy::AlwaysKeepSystemRamCopy
            && texture.sysram_copy().is_some();

        if !keep_existing {
            let bytes = match self.download(handle, &desc) {
                Ok(bytes) => bytes,
                Err(e) => {
                    let name = texture.alias().to_string();
                    log::error!("'{}': failed to download texture: {:#}", name, e);
                    self.events
                        .push_error(handle, StreamingError::invalid_state(name, format!("{:#}", e)));
                    Image::checkerboard(desc).into_buffer().into_vec()
                }
            };
            if let Some(texture) = self.textures.get_mut(handle) {
                texture.set_sysram_copy(Some(PixelBuffer::Owned(bytes)));
            }
        }

        self.release_gpu_memory(handle);
        if let Some(texture) = self.textures.get_mut(handle) {
            texture.set_residency(GpuResidency::OnSystemRam);
            texture.set_data_ready(false);
        }
        self.events.push(handle, TextureEventReason::LostResidency);
    }

    /// 读回纹理的全部数据；pool 中的纹理只取自己的那个 slice
    fn download(&self, handle: TextureHandle, desc: &TextureDesc) -> anyhow::Result<Vec<u8>> {
        let texture = self.textures.get(handle).ok_or(StreamingError::UnknownTexture)?;
        if let Some(id) = texture.gpu_texture() {
            return self.backend.download_texture(id);
        }

        let slot = texture
            .pool_slot()
            .ok_or_else(|| StreamingError::invalid_state(texture.alias(), "resident without gpu memory"))?;
        let pool = self
            .pools
            .pool(slot.pool)
            .ok_or_else(|| StreamingError::invalid_state(texture.alias(), "texture pool is gone"))?;
        let all = self.backend.download_texture(pool.master_texture())?;

        let mut bytes = Vec::with_capacity(desc.size_bytes());
        for mip in 0..desc.num_mips {
            let slice_bytes = desc.mip_size_bytes(mip);
            let start = mip_offset(pool.desc(), mip) + slot.slice as usize * slice_bytes;
            let src = all
                .get(start..start + slice_bytes)
                .ok_or_else(|| anyhow::anyhow!("texture pool data is smaller than expected"))?;
            bytes.extend_from_slice(src);
        }
        Ok(bytes)
    }

    /// 立即销毁：释放内存，移除 alias，通知 Deleted
    fn destroy_now(&mut self, handle: TextureHandle) {
        self.release_gpu_memory(handle);
        if let Some(texture) = self.textures.remove(handle) {
            if self.aliases.get(texture.alias()) == Some(&handle) {
                self.aliases.remove(texture.alias());
            }
            log::debug!("texture '{}' destroyed", texture.alias());
        }
        self.destroyed.push(handle);
        self.events.push(handle, TextureEventReason::Deleted);
    }
}

#[cfg(test)]
mod tests {
    use slotmap::KeyData;

    use super::*;

    fn handle(i: u64) -> TextureHandle {
        TextureHandle::from(KeyData::from_ffi(i))
    }

    fn to(target: GpuResidency) -> ScheduledTask {
        ScheduledTask::Transition {
            target,
            image: None,
            reupload: false,
            skip_multiload: false,
        }
    }

    #[test]
    fn test_fifo_per_texture() {
        let mut tasks = ScheduledTasks::default();
        let (a, b) = (handle(1), handle(2));
        assert!(!tasks.is_busy(a));

        tasks.push(a, to(GpuResidency::Resident));
        tasks.push(a, ScheduledTask::Destroy);
        tasks.push(b, to(GpuResidency::OnSystemRam));
        assert!(tasks.is_destroy_scheduled(a));
        assert!(!tasks.is_destroy_scheduled(b));
        assert_eq!(tasks.num_queued(a), 2);

        assert!(matches!(
            tasks.pop(a),
            Some(ScheduledTask::Transition {
                target: GpuResidency::Resident,
                ..
            })
        ));
        assert!(matches!(tasks.pop(a), Some(ScheduledTask::Destroy)));
        assert!(tasks.pop(a).is_none());
        assert!(!tasks.is_busy(a));
        assert!(tasks.is_busy(b));
    }

    #[test]
    fn test_in_flight_and_discard() {
        let mut tasks = ScheduledTasks::default();
        let a = handle(1);
        tasks.set_in_flight(a, LoadTransition::ToResident);
        assert!(tasks.is_busy(a));
        assert_eq!(tasks.in_flight(a), Some(LoadTransition::ToResident));

        tasks.push(a, to(GpuResidency::OnStorage));
        tasks.push(a, to(GpuResidency::Resident));
        assert_eq!(tasks.discard(a), 2);
        assert!(!tasks.is_busy(a));
        assert_eq!(tasks.in_flight(a), None);
    }
}
