//! 持久化后端
//!
//! 计划状态与检查点都以整对象 JSON 形式写入，键为 (namespace, session_id[, item_id])。
//! 后端只需支持整读、整写（原子替换）、列举、删除；不要求增量更新。
//!
//! - FileStorage：`<root>/<namespace>/<session_id>.json` 或 `<root>/<namespace>/<session_id>/<item>.json`，
//!   先写临时文件再 rename，崩溃时不会留下半截文件
//! - MemoryStorage：测试用
//! - SqliteStorage：单表 key/value，阻塞调用放入 spawn_blocking

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// 存储层错误
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// 存储键：命名空间 + 会话 + 可选条目（如检查点 ID）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub namespace: String,
    pub session_id: String,
    pub item: Option<String>,
}

impl StorageKey {
    pub fn session(namespace: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            session_id: session_id.into(),
            item: None,
        }
    }

    pub fn item(
        namespace: impl Into<String>,
        session_id: impl Into<String>,
        item: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            session_id: session_id.into(),
            item: Some(item.into()),
        }
    }

    /// 校验各段可安全用作文件名：拒绝空串、路径分隔符、`..` 与控制字符
    pub fn validate(&self) -> Result<(), StorageError> {
        validate_segment(&self.namespace)?;
        validate_segment(&self.session_id)?;
        if let Some(item) = &self.item {
            validate_segment(item)?;
        }
        Ok(())
    }
}

fn validate_segment(segment: &str) -> Result<(), StorageError> {
    if segment.is_empty() {
        return Err(StorageError::InvalidKey("empty key segment".to_string()));
    }
    if segment.contains('/')
        || segment.contains('\\')
        || segment.contains("..")
        || segment.chars().any(|c| c.is_control())
    {
        return Err(StorageError::InvalidKey(format!(
            "key segment contains invalid characters: {segment:?}"
        )));
    }
    Ok(())
}

/// 持久化后端接口
#[async_trait]
pub trait StateStorage: Send + Sync {
    /// 读取整个对象；不存在时返回 None
    async fn read(&self, key: &StorageKey) -> Result<Option<String>, StorageError>;

    /// 原子替换整个对象
    async fn write(&self, key: &StorageKey, data: &str) -> Result<(), StorageError>;

    /// 列出某会话下的全部条目 ID（无序）
    async fn list(&self, namespace: &str, session_id: &str) -> Result<Vec<String>, StorageError>;

    /// 删除对象；不存在视为成功
    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError>;
}

/// 文件后端
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &StorageKey) -> Result<PathBuf, StorageError> {
        key.validate()?;
        let ns = self.root.join(&key.namespace);
        Ok(match &key.item {
            None => ns.join(format!("{}.json", key.session_id)),
            Some(item) => ns.join(&key.session_id).join(format!("{item}.json")),
        })
    }
}

#[async_trait]
impl StateStorage for FileStorage {
    async fn read(&self, key: &StorageKey) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &StorageKey, data: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(format!("no parent for {}", path.display())))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(data.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &path).await
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn list(&self, namespace: &str, session_id: &str) -> Result<Vec<String>, StorageError> {
        StorageKey::session(namespace, session_id).validate()?;
        let dir = self.root.join(namespace).join(session_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                items.push(id.to_string());
            }
        }
        Ok(items)
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 内存后端（测试 / 无需落盘的场景）
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<RwLock<HashMap<StorageKey, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err() -> StorageError {
        StorageError::Backend("memory storage lock poisoned".to_string())
    }
}

#[async_trait]
impl StateStorage for MemoryStorage {
    async fn read(&self, key: &StorageKey) -> Result<Option<String>, StorageError> {
        key.validate()?;
        let entries = self.entries.read().map_err(|_| Self::lock_err())?;
        Ok(entries.get(key).cloned())
    }

    async fn write(&self, key: &StorageKey, data: &str) -> Result<(), StorageError> {
        key.validate()?;
        let mut entries = self.entries.write().map_err(|_| Self::lock_err())?;
        entries.insert(key.clone(), data.to_string());
        Ok(())
    }

    async fn list(&self, namespace: &str, session_id: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.read().map_err(|_| Self::lock_err())?;
        Ok(entries
            .keys()
            .filter(|k| k.namespace == namespace && k.session_id == session_id)
            .filter_map(|k| k.item.clone())
            .collect())
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| Self::lock_err())?;
        entries.remove(key);
        Ok(())
    }
}

/// SQLite 后端：单表 `kv(namespace, session_id, item, data, updated_at)`，item 为空串表示会话级对象
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::from_connection(rusqlite::Connection::open_in_memory()?)
    }

    fn from_connection(conn: rusqlite::Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                session_id TEXT NOT NULL,
                item TEXT NOT NULL DEFAULT '',
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (namespace, session_id, item)
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 在阻塞线程池中执行一次数据库操作
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StorageError::Backend("sqlite connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("sqlite task failed: {e}")))?
    }
}

#[async_trait]
impl StateStorage for SqliteStorage {
    async fn read(&self, key: &StorageKey) -> Result<Option<String>, StorageError> {
        key.validate()?;
        let key = key.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT data FROM kv WHERE namespace = ?1 AND session_id = ?2 AND item = ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                key.namespace,
                key.session_id,
                key.item.unwrap_or_default()
            ])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn write(&self, key: &StorageKey, data: &str) -> Result<(), StorageError> {
        key.validate()?;
        let key = key.clone();
        let data = data.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (namespace, session_id, item, data, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    key.namespace,
                    key.session_id,
                    key.item.unwrap_or_default(),
                    data,
                    chrono::Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list(&self, namespace: &str, session_id: &str) -> Result<Vec<String>, StorageError> {
        let namespace = namespace.to_string();
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT item FROM kv WHERE namespace = ?1 AND session_id = ?2 AND item != ''",
            )?;
            let items = stmt
                .query_map(rusqlite::params![namespace, session_id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(items)
        })
        .await
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM kv WHERE namespace = ?1 AND session_id = ?2 AND item = ?3",
                rusqlite::params![key.namespace, key.session_id, key.item.unwrap_or_default()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn exercise(storage: &dyn StateStorage) {
        let session = StorageKey::session("plans", "s1");
        assert!(storage.read(&session).await.unwrap().is_none());

        storage.write(&session, r#"{"v":1}"#).await.unwrap();
        storage.write(&session, r#"{"v":2}"#).await.unwrap();
        assert_eq!(storage.read(&session).await.unwrap().as_deref(), Some(r#"{"v":2}"#));

        storage.write(&StorageKey::item("ckpt", "s1", "a"), "A").await.unwrap();
        storage.write(&StorageKey::item("ckpt", "s1", "b"), "B").await.unwrap();
        storage.write(&StorageKey::item("ckpt", "s2", "c"), "C").await.unwrap();
        let mut items = storage.list("ckpt", "s1").await.unwrap();
        items.sort();
        assert_eq!(items, vec!["a".to_string(), "b".to_string()]);

        storage.delete(&StorageKey::item("ckpt", "s1", "a")).await.unwrap();
        storage.delete(&StorageKey::item("ckpt", "s1", "missing")).await.unwrap();
        assert_eq!(storage.list("ckpt", "s1").await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_file_storage_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        exercise(&storage).await;
        // 不留下临时文件
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("plans"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_memory_storage_roundtrip() {
        exercise(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_storage_roundtrip() {
        let storage = SqliteStorage::in_memory().unwrap();
        exercise(&storage).await;
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        let err = storage
            .write(&StorageKey::session("plans", "../escape"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
