use serde::{Deserialize, Serialize};

use crate::staging::BudgetEntry;
use crate::texture_pool::PoolSlicesPolicy;

/// 流送系统的配置
///
/// 缺省的字段使用默认值，可以只在 json 中写需要修改的部分。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// 所有 staging texture 加起来的上限
    pub staging_texture_max_budget_bytes: usize,
    /// worker 一轮最多映射多少字节，超出后剩下的留到下一轮
    pub max_preload_bytes: usize,
    /// worker 一轮最多开始处理多少个新的加载请求
    pub entries_to_process_per_iteration: usize,
    /// 常驻的 staging 预算
    pub budget: Vec<BudgetEntry>,

    /// 专门用于读取和解码的线程数，0 表示由 worker 自己解码
    pub multiload_threads: usize,
    /// 主线程 `try_lock` 连续失败这么多次后改为阻塞等待
    pub max_try_lock_failures: u32,
    /// 不启动 worker 线程，在 `update` 中执行 streaming
    pub streaming_on_main_thread: bool,
    /// 记录每张纹理的解码耗时
    pub profile_loading: bool,

    pub pool_slices: PoolSlicesPolicy,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            staging_texture_max_budget_bytes: 512 * 1024 * 1024,
            max_preload_bytes: 256 * 1024 * 1024,
            entries_to_process_per_iteration: 3,
            budget: BudgetEntry::default_budget(),
            multiload_threads: 0,
            max_try_lock_failures: 120,
            streaming_on_main_thread: false,
            profile_loading: false,
            pool_slices: PoolSlicesPolicy::default(),
        }
    }
}

impl StreamingConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        BudgetEntry::sort(&mut config.budget);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use texstream_gfx::pixel_format::PixelFormat;

    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = StreamingConfig::from_json(
            r#"{
                "multiload_threads": 2,
                "budget": [
                    { "format_family": "PFG_R8_UNORM", "min_resolution": 64, "min_num_slices": 1 },
                    { "format_family": "PFG_RGBA8_UNORM", "min_resolution": 256, "min_num_slices": 2 }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.multiload_threads, 2);
        assert_eq!(config.max_try_lock_failures, 120);
        assert_eq!(config.entries_to_process_per_iteration, 3);
        // 大的排在前面
        assert_eq!(config.budget[0].format_family, PixelFormat::Rgba8Unorm);
        assert_eq!(config.budget[1].format_family, PixelFormat::R8Unorm);
    }
}
