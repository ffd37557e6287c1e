use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use serde_json::{Value, json};
use texstream_gfx::pixel_format::PixelFormat;
use texstream_gfx::texture_desc::{TextureDesc, TextureType};

use crate::error::StreamingError;

/// 纹理形状的预测值
///
/// 在真正读取文件之前就用它分配 GPU 内存；预测错误时由 worker 发现并重新加载。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataCacheEntry {
    pub desc: TextureDesc,
    pub pool_id: u32,
}

/// 启动时就预留好的 texture pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedPool {
    pub pool_id: u32,
    pub width: u32,
    pub height: u32,
    pub num_slices: u32,
    pub num_mips: u8,
    pub format: PixelFormat,
}

/// alias -> 纹理形状
///
/// 文件格式：
/// ```json
/// {
///     "reserved_pool_ids": [{ "poolId": 1, "resolution": [256, 256], "num_slices": 16, "mipmaps": 9, "format": "PFG_BC1_UNORM" }],
///     "cache": {
///         "brick.png": { "resolution": [512, 512, 1], "mipmaps": 10, "format": "PFG_RGBA8_UNORM_SRGB", "texture_type": 3, "poolId": 0 }
///     }
/// }
/// ```
#[derive(Debug, Default)]
pub struct MetadataCache {
    entries: HashMap<String, MetadataCacheEntry>,
}

// getter
impl MetadataCache {
    #[inline]
    pub fn get(&self, alias: &str) -> Option<&MetadataCacheEntry> {
        self.entries.get(alias)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataCacheEntry)> {
        self.entries.iter().map(|(alias, entry)| (alias.as_str(), entry))
    }
}

impl MetadataCache {
    pub fn insert(&mut self, alias: impl Into<String>, entry: MetadataCacheEntry) {
        self.entries.insert(alias.into(), entry);
    }

    pub fn remove(&mut self, alias: &str) -> Option<MetadataCacheEntry> {
        self.entries.remove(alias)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// 序列化
impl MetadataCache {
    /// 合并 json 中的记录，返回文件中预留的 pool
    ///
    /// 只有 json 本身无法解析时才返回错误；缺少字段或者格式未知的记录会被跳过。
    pub fn import(&mut self, json: &str) -> anyhow::Result<Vec<ReservedPool>> {
        let root: Value =
            serde_json::from_str(json).map_err(|e| StreamingError::MetadataCache(format!("invalid json: {}", e)))?;

        let mut reserved = Vec::new();
        if let Some(pools) = root.get("reserved_pool_ids").and_then(Value::as_array) {
            for pool in pools {
                match parse_reserved_pool(pool) {
                    Some(pool) => reserved.push(pool),
                    None => log::warn!("metadata cache: skipping malformed reserved pool {}", pool),
                }
            }
        }

        if let Some(cache) = root.get("cache").and_then(Value::as_object) {
            for (alias, value) in cache {
                match parse_entry(value) {
                    Some(entry) => {
                        self.entries.insert(alias.clone(), entry);
                    }
                    None => log::warn!("metadata cache: skipping malformed entry '{}'", alias),
                }
            }
        }

        log::info!(
            "metadata cache: imported {} entries, {} reserved pools",
            self.entries.len(),
            reserved.len()
        );
        Ok(reserved)
    }

    /// 导出为 json，alias 按字典序排列
    pub fn export(&self, reserved: &[ReservedPool]) -> anyhow::Result<String> {
        let pools: Vec<Value> = reserved
            .iter()
            .map(|pool| {
                json!({
                    "poolId": pool.pool_id,
                    "resolution": [pool.width, pool.height],
                    "num_slices": pool.num_slices,
                    "mipmaps": pool.num_mips,
                    "format": pool.format.as_str(),
                })
            })
            .collect();

        let cache: BTreeMap<&str, Value> = self
            .entries
            .iter()
            .map(|(alias, entry)| {
                let desc = &entry.desc;
                let value = json!({
                    "resolution": [desc.width, desc.height, desc.depth_or_slices],
                    "mipmaps": desc.num_mips,
                    "format": desc.format.as_str(),
                    "texture_type": desc.texture_type.as_u32(),
                    "poolId": entry.pool_id,
                });
                (alias.as_str(), value)
            })
            .collect();

        let root = json!({
            "reserved_pool_ids": pools,
            "cache": cache,
        });
        Ok(serde_json::to_string_pretty(&root)?)
    }
}

fn parse_format(value: &Value) -> Option<PixelFormat> {
    let format = PixelFormat::from_str(value.get("format")?.as_str()?).ok()?;
    (format != PixelFormat::Unknown).then_some(format)
}

fn parse_mipmaps(value: &Value) -> u8 {
    value
        .get("mipmaps")
        .and_then(Value::as_u64)
        .map(|mips| mips.clamp(1, u8::MAX as u64) as u8)
        .unwrap_or(1)
}

fn parse_u32(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|v| u32::try_from(v).ok())
}

fn parse_entry(value: &Value) -> Option<MetadataCacheEntry> {
    let resolution = value.get("resolution")?.as_array()?;
    let width = parse_u32(resolution.first()?)?;
    let height = parse_u32(resolution.get(1)?)?;
    let depth_or_slices = resolution.get(2).and_then(parse_u32).unwrap_or(1);

    let texture_type = value
        .get("texture_type")
        .and_then(parse_u32)
        .and_then(TextureType::from_u32)
        .unwrap_or(TextureType::Type2D);

    let desc = TextureDesc {
        width,
        height,
        depth_or_slices,
        num_mips: parse_mipmaps(value),
        format: parse_format(value)?,
        texture_type,
    };
    if !desc.is_valid() {
        return None;
    }

    Some(MetadataCacheEntry {
        desc,
        pool_id: value.get("poolId").and_then(parse_u32).unwrap_or(0),
    })
}

fn parse_reserved_pool(value: &Value) -> Option<ReservedPool> {
    let resolution = value.get("resolution")?.as_array()?;
    Some(ReservedPool {
        pool_id: value.get("poolId").and_then(parse_u32)?,
        width: parse_u32(resolution.first()?)?,
        height: parse_u32(resolution.get(1)?)?,
        num_slices: value.get("num_slices").and_then(parse_u32).unwrap_or(1).max(1),
        num_mips: parse_mipmaps(value),
        format: parse_format(value)?,
    })
}
