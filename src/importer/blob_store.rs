// ==========================================
// SPED 账簿导入系统 - 文件读取接口
// ==========================================
// 职责: 按字节区间读取账簿文件（不整体加载）
// 实现: LocalFileStore（tokio::fs）/ InMemoryBlobStore（测试与预览）
// ==========================================

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// 文件总字节数
    async fn size(&self, path: &str) -> std::io::Result<u64>;

    /// 读取 [offset, offset + len) 区间；越过文件末尾时返回较短结果
    async fn read_range(&self, path: &str, offset: u64, len: u64) -> std::io::Result<Vec<u8>>;
}

// ==========================================
// LocalFileStore - 本地文件
// ==========================================
// 路径按进程工作目录解析
#[derive(Debug, Clone, Default)]
pub struct LocalFileStore;

impl LocalFileStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BlobStore for LocalFileStore {
    async fn size(&self, path: &str) -> std::io::Result<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = Vec::with_capacity(len.min(8 * 1024 * 1024) as usize);
        file.take(len).read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

// ==========================================
// InMemoryBlobStore - 内存文件
// ==========================================
#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut map) = self.blobs.write() {
            map.insert(path.into(), Arc::new(bytes.into()));
        }
    }

    fn get(&self, path: &str) -> std::io::Result<Arc<Vec<u8>>> {
        let map = self
            .blobs
            .read()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        map.get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()))
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn size(&self, path: &str) -> std::io::Result<u64> {
        Ok(self.get(path)?.len() as u64)
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        let blob = self.get(path)?;
        let total = blob.len() as u64;
        let start = offset.min(total) as usize;
        let end = offset.saturating_add(len).min(total) as usize;
        Ok(blob[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_local_ranged_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let store = LocalFileStore::new();
        assert_eq!(store.size(&path).await.unwrap(), 10);
        assert_eq!(store.read_range(&path, 3, 4).await.unwrap(), b"3456");
        assert_eq!(store.read_range(&path, 8, 100).await.unwrap(), b"89");
        assert!(store.read_range(&path, 20, 5).await.unwrap().is_empty());
        assert!(store.size("/definitely/not/here").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_ranged_read() {
        let store = InMemoryBlobStore::new();
        store.put("a", b"abcdef".to_vec());
        assert_eq!(store.read_range("a", 2, 2).await.unwrap(), b"cd");
        assert_eq!(store.read_range("a", 5, 10).await.unwrap(), b"f");
        let err = store.size("b").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
