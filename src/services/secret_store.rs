use crate::error::{AppError, AppResult};
use crate::models::Secret;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// access_tokens.json 的持久化映射 accountId -> Secret
pub struct SecretStore {
    path: PathBuf,
    secrets: RwLock<HashMap<String, Secret>>,
    /// 串行化快照与落盘
    persist: Mutex<()>,
    /// 文件是否存在且可以解析
    loaded: bool,
}

impl SecretStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (secrets, loaded) = match Self::read_file(&path) {
            Ok(Some(secrets)) => (secrets, true),
            Ok(None) => (HashMap::new(), false),
            Err(e) => {
                warn!("解析凭据文件失败 {}: {}", path.display(), e);
                (HashMap::new(), false)
            }
        };

        Self {
            path,
            secrets: RwLock::new(secrets),
            persist: Mutex::new(()),
            loaded,
        }
    }

    fn read_file(path: &Path) -> AppResult<Option<HashMap<String, Secret>>> {
        if !path.exists() {
            debug!("凭据文件不存在: {}", path.display());
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let secrets: HashMap<String, Secret> = serde_json::from_str(&content)?;
        info!("Loaded {} persisted secrets from {}", secrets.len(), path.display());
        Ok(Some(secrets))
    }

    /// 文件可用且至少有一条记录
    pub fn has_entries(&self) -> bool {
        self.loaded && !self.secrets.read().is_empty()
    }

    /// 文件修改时间，用于无法解码 token 时估算过期
    pub fn modified_at(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    pub fn get(&self, account: &str) -> Option<Secret> {
        self.secrets.read().get(account).cloned()
    }

    pub fn set(&self, account: &str, secret: Secret) {
        self.secrets.write().insert(account.to_string(), secret);
    }

    pub fn remove(&self, account: &str) -> Option<Secret> {
        self.secrets.write().remove(account)
    }

    pub fn replace_all(&self, secrets: HashMap<String, Secret>) {
        *self.secrets.write() = secrets;
    }

    pub fn save(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| AppError::Internal(format!("创建存储目录失败: {}", e)))?;
            }
        }

        // 快照在持锁期间取得，后写入的一定不旧于先写入的
        let _guard = self.persist.lock();
        let content = {
            let secrets = self.secrets.read();
            serde_json::to_string_pretty(&*secrets)?
        };
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, content)?;
        fs::rename(&staging, &self.path)?;

        debug!("凭据已保存到: {}", self.path.display());
        Ok(())
    }
}
