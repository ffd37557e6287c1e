use std::time::{Duration, Instant};

use texstream_gfx::texture_desc::{TextureDesc, TextureType};

use crate::archive::ResourceGroups;
use crate::codec::{ImageCodecs, file_extension};
use crate::error::StreamingError;
use crate::filters::FilterFlags;
use crate::image::Image;
use crate::texture::{TextureFlags, TextureHandle};

/// 加载整张纹理，而不是其中一个 slice
pub const SLICE_ALL: u32 = u32::MAX;

/// 多文件 cubemap 每个面的文件名后缀，顺序即 slice 顺序
pub const CUBEMAP_SUFFIXES: [&str; 6] = ["_rt", "_lf", "_up", "_dn", "_fr", "_bk"];

/// 这些格式一个文件就能放下整个 cubemap
pub const COMBINED_CUBEMAP_EXTENSIONS: [&str; 4] = ["dds", "ktx", "oitd", "rawtex"];

/// 这次加载完成后纹理应该到达的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadTransition {
    /// 上传到 GPU
    ToResident,
    /// 只加载到系统内存，不使用 staging
    ToSystemRam,
    /// 纹理已经常驻，只重新上传数据
    Reupload,
}

/// worker 应该如何对待解码出来的形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeSource {
    /// 形状由第一个 slice 决定
    Unknown,
    /// 来自 metadata cache 的预测，纹理已经按照预测分配了 GPU 内存；不一致时需要重新调度
    Predicted(TextureDesc),
    /// 形状已经冻结 (例如从系统内存上传)，不一致就是错误
    Frozen(TextureDesc),
}

impl ShapeSource {
    pub fn desc(&self) -> Option<&TextureDesc> {
        match self {
            Self::Unknown => None,
            Self::Predicted(desc) | Self::Frozen(desc) => Some(desc),
        }
    }
}

/// 一次加载请求
///
/// 由主线程创建，通过 channel 转移给 worker (可能经过 multiload 线程池)，只会被消费一次。
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub texture: TextureHandle,
    /// 纹理的 alias，用于日志
    pub texture_name: String,
    /// 资源名
    pub name: String,
    pub resource_group: String,

    /// 已经解码好的图片；为空时由 worker 或 multiload 线程加载
    pub image: Option<Image>,
    /// multiload 线程加载失败的原因，由 worker 转换为 ExceptionThrown
    pub load_error: Option<StreamingError>,

    /// 目标 slice (或 3D 纹理的 depth)，[`SLICE_ALL`] 表示整张纹理
    pub slice_or_depth: u32,

    pub filters: FilterFlags,
    pub texture_flags: TextureFlags,
    pub initial_type: TextureType,
    pub shape: ShapeSource,
    pub transition: LoadTransition,

    /// 纹理的加载代数，代数落后的请求会被 worker 丢弃
    pub generation: u32,
    pub skip_multiload: bool,
    /// 上传完成后把图片留作纹理的系统内存副本 (`AlwaysKeepSystemRamCopy`)
    pub keep_sysram_copy: bool,

    /// 打开和解码花费的时间
    pub decode_time: Option<Duration>,
}

impl LoadRequest {
    #[inline]
    pub fn is_first_slice(&self) -> bool {
        self.slice_or_depth == 0 || self.slice_or_depth == SLICE_ALL
    }

    /// 同一个纹理的其他面也在路上
    #[inline]
    pub fn is_multi_file_face(&self) -> bool {
        self.slice_or_depth != SLICE_ALL
    }

    /// 从资源组中读取并解码
    ///
    /// 失败时记录在 `load_error` 中，不会返回错误：错误需要以 command 的形式送回主线程。
    pub fn load_image(&mut self, groups: &ResourceGroups, codecs: &ImageCodecs) {
        if self.image.is_some() || self.load_error.is_some() {
            return;
        }
        let _span = tracy_client::span!("LoadRequest::load_image");

        let start = Instant::now();
        match groups.open(&self.name, &self.resource_group) {
            Ok(bytes) => match codecs.decode(&self.name, &bytes) {
                Ok(image) => self.image = Some(image),
                Err(e) => {
                    self.load_error = Some(StreamingError::Decode {
                        name: self.name.clone(),
                        reason: e.to_string(),
                    })
                }
            },
            Err(e) => self.load_error = Some(e),
        }
        self.decode_time = Some(start.elapsed());
    }

    /// cubemap 的每个面是否存放在单独的文件中
    pub fn needs_face_fan_out(&self) -> bool {
        if self.initial_type != TextureType::TypeCube || self.image.is_some() || self.slice_or_depth != SLICE_ALL {
            return false;
        }
        let ext = file_extension(&self.name).to_ascii_lowercase();
        !COMBINED_CUBEMAP_EXTENSIONS.contains(&ext.as_str())
    }

    /// 拆分成每个面一个请求；不需要拆分时原样返回
    pub fn fan_out(self) -> Vec<LoadRequest> {
        if !self.needs_face_fan_out() {
            return vec![self];
        }
        (0..CUBEMAP_SUFFIXES.len())
            .map(|face| LoadRequest {
                name: face_resource_name(&self.name, face),
                slice_or_depth: face as u32,
                ..self.clone()
            })
            .collect()
    }
}

/// `sky.png` + 第 2 个面 -> `sky_up.png`
pub fn face_resource_name(name: &str, face: usize) -> String {
    let ext = file_extension(name);
    let base = if ext.is_empty() {
        name
    } else {
        &name[..name.len() - ext.len() - 1]
    };

    let mut face_name = format!("{}{}", base, CUBEMAP_SUFFIXES[face]);
    if !ext.is_empty() {
        face_name.push('.');
        face_name.push_str(ext);
    }
    face_name
}
