use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::error::StreamingError;

/// 资源的来源 (目录、内存、压缩包 ...)
///
/// `open` 会在 worker 线程或者 multiload 线程池中被调用。
pub trait Archive: Send + Sync {
    fn name(&self) -> &str;

    fn exists(&self, name: &str) -> bool;

    fn open(&self, name: &str) -> anyhow::Result<Vec<u8>>;
}

/// 以某个目录为根的文件系统
pub struct FileSystemArchive {
    name: String,
    root: PathBuf,
}

impl FileSystemArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            name: root.display().to_string(),
            root,
        }
    }
}

impl Archive for FileSystemArchive {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self, name: &str) -> bool {
        self.root.join(name).is_file()
    }

    fn open(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(name);
        std::fs::read(&path).map_err(|e| anyhow::anyhow!("failed to read {:?}: {}", path, e))
    }
}

/// 纯内存的资源，用于运行时生成的数据以及测试
#[derive(Default)]
pub struct MemoryArchive {
    name: String,
    files: RwLock<HashMap<String, Arc<[u8]>>>,
}

impl MemoryArchive {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        if let Ok(mut files) = self.files.write() {
            files.insert(name.into(), bytes.into());
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        self.files.write().map(|mut files| files.remove(name).is_some()).unwrap_or(false)
    }
}

impl Archive for MemoryArchive {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self, name: &str) -> bool {
        self.files.read().map(|files| files.contains_key(name)).unwrap_or(false)
    }

    fn open(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        let files = self.files.read().map_err(|_| anyhow::anyhow!("memory archive poisoned"))?;
        files
            .get(name)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| anyhow::anyhow!("'{}' is not in memory archive '{}'", name, self.name))
    }
}

/// 资源组：组名 -> 一组 archive
///
/// 在同一个组里按照注册顺序查找第一个包含该资源的 archive。
/// 组名为空时在所有组里查找。
#[derive(Default)]
pub struct ResourceGroups {
    groups: RwLock<HashMap<String, Vec<Arc<dyn Archive>>>>,
}

impl ResourceGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_archive(&self, group: impl Into<String>, archive: Arc<dyn Archive>) {
        let group = group.into();
        log::info!("resource group '{}': add archive '{}'", group, archive.name());
        if let Ok(mut groups) = self.groups.write() {
            groups.entry(group).or_default().push(archive);
        }
    }

    fn find_archive(&self, name: &str, group: &str) -> Option<Arc<dyn Archive>> {
        let groups = self.groups.read().ok()?;
        if group.is_empty() {
            groups.values().flatten().find(|archive| archive.exists(name)).cloned()
        } else {
            groups.get(group)?.iter().find(|archive| archive.exists(name)).cloned()
        }
    }

    pub fn exists(&self, name: &str, group: &str) -> bool {
        self.find_archive(name, group).is_some()
    }

    /// 读取资源的全部字节
    pub fn open(&self, name: &str, group: &str) -> Result<Vec<u8>, StreamingError> {
        let archive = self.find_archive(name, group).ok_or_else(|| StreamingError::ResourceNotFound {
            name: name.to_string(),
            group: group.to_string(),
        })?;
        archive.open(name).map_err(|e| {
            log::error!("failed to open '{}' from '{}': {}", name, archive.name(), e);
            StreamingError::ResourceNotFound {
                name: name.to_string(),
                group: group.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_group() {
        let groups = ResourceGroups::new();
        let archive = Arc::new(MemoryArchive::new("mem"));
        archive.insert("a.png", vec![1u8, 2, 3]);
        groups.add_archive("General", archive.clone());

        assert_eq!(groups.open("a.png", "General").unwrap(), vec![1, 2, 3]);
        // 空组名表示在所有组中查找
        assert!(groups.exists("a.png", ""));
        assert!(!groups.exists("a.png", "Other"));

        let err = groups.open("missing.png", "General").unwrap_err();
        assert!(matches!(err, StreamingError::ResourceNotFound { .. }));

        assert!(archive.remove("a.png"));
        assert!(!groups.exists("a.png", "General"));
    }

    #[test]
    fn test_file_system_archive() {
        let dir = std::env::temp_dir().join(format!("texstream-archive-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("hello.bin"), b"hi").unwrap();

        let archive = FileSystemArchive::new(&dir);
        assert!(archive.exists("hello.bin"));
        assert!(!archive.exists("nope.bin"));
        assert_eq!(archive.open("hello.bin").unwrap(), b"hi");
        assert!(archive.open("nope.bin").is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
