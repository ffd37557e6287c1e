use std::collections::VecDeque;

use slotmap::{SlotMap, new_key_type};

use crate::error::StreamingError;
use crate::texture::TextureHandle;

new_key_type! { pub struct ListenerId; }

/// 纹理状态变化的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureEventReason {
    /// 数据已经从磁盘加载到系统内存
    FromStorageToSysRam,
    /// 已经分配了 GPU 内存，形状确定，但是数据可能还没有上传
    GainedResidency,
    /// GPU 内存被释放
    LostResidency,
    /// 数据已经全部上传，可以用于渲染
    ReadyForRendering,
    /// 加载失败，extra 中带有错误信息
    ExceptionThrown,
    /// metadata cache 中的记录和真实数据不一致，纹理会被重新加载
    MetadataCacheOutOfDate,
    /// 纹理被销毁，之后句柄不再有效
    Deleted,
    /// 纹理在 texture pool 中的位置发生了变化
    PoolTextureSlotChanged,
}

/// 纹理状态变化的观察者
///
/// 回调在主线程的 `update` (或其他 manager 调用) 中触发，按照事件产生的顺序。
pub trait TextureListener: Send {
    fn notify_texture_changed(&mut self, texture: TextureHandle, reason: TextureEventReason, extra: Option<&StreamingError>);
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureEvent {
    pub texture: TextureHandle,
    pub reason: TextureEventReason,
    pub error: Option<StreamingError>,
}

/// 延迟派发的事件队列
///
/// 处理一个事件时产生的新事件只会追加到队尾，由最外层的派发循环继续处理，
/// 不会在处理过程中递归派发。
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<TextureEvent>,
}

impl EventQueue {
    pub fn push(&mut self, texture: TextureHandle, reason: TextureEventReason) {
        self.events.push_back(TextureEvent {
            texture,
            reason,
            error: None,
        });
    }

    pub fn push_error(&mut self, texture: TextureHandle, error: StreamingError) {
        self.events.push_back(TextureEvent {
            texture,
            reason: TextureEventReason::ExceptionThrown,
            error: Some(error),
        });
    }

    pub fn pop(&mut self) -> Option<TextureEvent> {
        self.events.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

/// 已注册的外部 listener
#[derive(Default)]
pub struct Listeners {
    listeners: SlotMap<ListenerId, Box<dyn TextureListener>>,
}

impl Listeners {
    pub fn add(&mut self, listener: Box<dyn TextureListener>) -> ListenerId {
        self.listeners.insert(listener)
    }

    pub fn remove(&mut self, id: ListenerId) -> Option<Box<dyn TextureListener>> {
        self.listeners.remove(id)
    }

    pub fn notify(&mut self, event: &TextureEvent) {
        for listener in self.listeners.values_mut() {
            listener.notify_texture_changed(event.texture, event.reason, event.error.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
