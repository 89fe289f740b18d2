use crate::error::{ApiError, ApiResult};
use crate::models::Secret;
use crate::services::accounts::Account;
use crate::services::authenticator::{auth_failure, Authenticator};
use crate::services::secret_store::SecretStore;
use crate::utils::{mask_token, unix_timestamp};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// 会话与 PUID 的有效期窗口
pub const RENEWAL_INTERVAL_SECS: i64 = 24 * 60 * 60;

/// token 与 PUID 过期时间允许的偏差
const MAX_EXPIRY_DRIFT_SECS: i64 = 2;

/// 轮换队列与共享计数器，必须整体加锁
#[derive(Debug, Default)]
struct RotationState {
    active: VecDeque<String>,
    counter: u32,
}

/// 启动时对单个账号的续期计划
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalPlan {
    /// 已过期，立即续期并定时
    RenewNow,
    /// token 比 PUID 晚过期太多，先续期一次再重新计算
    Resync,
    /// 仍然有效，到期后续期
    ScheduleIn(Duration),
}

/// 账号轮换与会话续期
pub struct CredentialScheduler {
    accounts: Vec<Account>,
    store: SecretStore,
    authenticator: Arc<dyn Authenticator>,
    rotation: Mutex<RotationState>,
    renew_locks: RwLock<HashMap<String, Arc<Semaphore>>>,
    login_timeout: Duration,
}

impl CredentialScheduler {
    pub fn new(
        accounts: Vec<Account>,
        store: SecretStore,
        authenticator: Arc<dyn Authenticator>,
        login_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            accounts,
            store,
            authenticator,
            rotation: Mutex::new(RotationState::default()),
            renew_locks: RwLock::new(HashMap::new()),
            login_timeout,
        })
    }

    fn account(&self, id: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn active_accounts(&self) -> Vec<String> {
        self.rotation.lock().active.iter().cloned().collect()
    }

    /// 取出本轮使用的账号与会话，没有可用账号时返回 None（匿名）
    pub fn acquire_secret(&self) -> Option<(String, Secret)> {
        let mut rotation = self.rotation.lock();
        let account_id = rotation.active.front()?.clone();

        let mut secret = self.store.get(&account_id).unwrap_or_default();
        let team_eligible = !secret.team_user_id.is_empty();
        let (primary, total) = self
            .account(&account_id)
            .map(|a| (a.primary_quota(), a.total_quota(team_eligible)))
            .unwrap_or((1, 1));

        if rotation.counter == 0 {
            rotation.counter = total;
        }
        rotation.counter -= 1;
        if rotation.counter == 0 {
            rotation.active.rotate_left(1);
        }

        // 剩余次数低于个人档时降级为个人会话
        if team_eligible && rotation.counter < primary {
            secret.team_user_id.clear();
        }

        debug!(
            "选用账号 {} (剩余 {})",
            account_id, rotation.counter
        );
        Some((account_id, secret))
    }

    /// 只有持有有效 token 的账号才能进入轮换
    fn activate(&self, account_id: &str) -> bool {
        let usable = self
            .store
            .get(account_id)
            .map(|s| s.is_authenticated())
            .unwrap_or(false);
        if !usable {
            warn!("账号没有可用的 token，不加入轮换: {}", account_id);
            return false;
        }

        let mut rotation = self.rotation.lock();
        if !rotation.active.iter().any(|id| id == account_id) {
            rotation.active.push_back(account_id.to_string());
        }
        true
    }

    fn evict(&self, account_id: &str) {
        {
            let mut rotation = self.rotation.lock();
            if let Some(index) = rotation.active.iter().position(|id| id == account_id) {
                rotation.active.remove(index);
                // 计数属于被移除的账号
                if index == 0 {
                    rotation.counter = 0;
                }
            }
        }
        self.store.remove(account_id);
        if let Err(e) = self.store.save() {
            error!("保存凭据失败: {}", e);
        }
        warn!("账号已移出轮换: {}", account_id);
    }

    fn renew_lock(&self, account_id: &str) -> Arc<Semaphore> {
        if let Some(lock) = self.renew_locks.read().get(account_id) {
            return lock.clone();
        }
        self.renew_locks
            .write()
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    async fn with_timeout<F>(&self, fut: F) -> ApiResult<Secret>
    where
        F: Future<Output = ApiResult<Secret>>,
    {
        match tokio::time::timeout(self.login_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(auth_failure(
                "timeout",
                0,
                format!("no response within {}s", self.login_timeout.as_secs()),
            )),
        }
    }

    /// cookie 续期，失败后完整登录。同一账号同时只有一个续期
    async fn obtain_secret(&self, account: &Account) -> ApiResult<Secret> {
        let lock = self.renew_lock(&account.id);
        let _permit = lock
            .acquire()
            .await
            .map_err(|e| ApiError::Internal(format!("Failed to acquire renewal lock: {}", e)))?;

        info!("Updating access token for {}", account.id);
        match self
            .with_timeout(self.authenticator.renew_with_cookies(account))
            .await
        {
            Ok(secret) => Ok(secret),
            Err(e) => {
                debug!("cookie 续期失败，改为完整登录: {}", e);
                self.with_timeout(self.authenticator.login(account)).await
            }
        }
    }

    /// 续期单个账号。unattended 为后台续期，失败时移出轮换并删除凭据
    pub async fn renew_account(
        self: &Arc<Self>,
        account_id: &str,
        unattended: bool,
        reschedule: bool,
    ) -> ApiResult<()> {
        let account = self
            .account(account_id)
            .cloned()
            .ok_or_else(|| ApiError::Internal(format!("unknown account: {}", account_id)))?;

        let secret = match self.obtain_secret(&account).await {
            Ok(secret) => secret,
            Err(e) => {
                if let ApiError::AuthFailure {
                    location,
                    status_code,
                    details,
                } = &e
                {
                    warn!(
                        "续期失败 {}: location={} status={} details={}",
                        account_id, location, status_code, details
                    );
                }
                if unattended {
                    self.evict(account_id);
                }
                return Err(e);
            }
        };

        info!(
            "续期成功 {}: {}",
            account_id,
            mask_token(&secret.token)
        );
        self.store.set(account_id, secret);
        if let Err(e) = self.store.save() {
            error!("保存凭据失败: {}", e);
        }
        self.activate(account_id);

        if reschedule {
            self.schedule_renewal(
                account_id.to_string(),
                Duration::from_secs((RENEWAL_INTERVAL_SECS + 1) as u64),
            );
        }
        Ok(())
    }

    fn schedule_renewal(self: &Arc<Self>, account_id: String, delay: Duration) {
        debug!("{} 将在 {:?} 后续期", account_id, delay);
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = scheduler.renew_account(&account_id, true, true).await;
        });
    }

    /// 启动时根据持久化状态安排续期
    pub async fn start(self: &Arc<Self>) {
        if self.accounts.is_empty() {
            info!("没有配置账号，使用匿名会话");
            return;
        }

        if !self.store.has_entries() {
            self.full_refresh().await;
            return;
        }

        let store_mtime = self
            .store
            .modified_at()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);

        for account in self.accounts.clone() {
            let secret = self.store.get(&account.id).unwrap_or_default();
            if secret.token.is_empty() {
                let _ = self.renew_account(&account.id, true, true).await;
                continue;
            }
            self.plan_account(&account.id, &secret.puid, store_mtime).await;
        }
    }

    async fn plan_account(self: &Arc<Self>, account_id: &str, puid: &str, store_mtime: Option<i64>) {
        let puid_issued = puid_issued_at(puid);
        let now = unix_timestamp() as i64;

        let mut puid_left = puid_issued.map(|issued| RENEWAL_INTERVAL_SECS - (now - issued));
        // 后台续期失败的账号已被移出，不再继续安排
        if matches!(puid_left, Some(left) if left < 0)
            && self.renew_account(account_id, true, false).await.is_err()
        {
            return;
        }

        // 最多重新同步一次
        for _ in 0..2 {
            let now = unix_timestamp() as i64;
            let token = self
                .store
                .get(account_id)
                .map(|s| s.token)
                .unwrap_or_default();
            let token_left = token_remaining(&token, store_mtime, now);
            if matches!(puid_left, Some(left) if left > 0) {
                puid_left = puid_issued.map(|issued| RENEWAL_INTERVAL_SECS - (now - issued));
            }

            match plan_renewal(token_left, puid_left) {
                RenewalPlan::Resync => {
                    if self.renew_account(account_id, true, false).await.is_err() {
                        return;
                    }
                    puid_left = None;
                }
                RenewalPlan::ScheduleIn(delay) => {
                    if self.activate(account_id) {
                        self.schedule_renewal(account_id.to_string(), delay);
                    }
                    return;
                }
                RenewalPlan::RenewNow => {
                    let _ = self.renew_account(account_id, true, true).await;
                    return;
                }
            }
        }
    }

    /// 全量登录所有账号，结果整体替换存储，每24小时重复
    pub async fn full_refresh(self: &Arc<Self>) {
        info!("刷新全部 {} 个账号", self.accounts.len());
        {
            let mut rotation = self.rotation.lock();
            rotation.active.clear();
            rotation.counter = 0;
        }

        let mut secrets = HashMap::new();
        for account in &self.accounts {
            match self.obtain_secret(account).await {
                Ok(secret) => {
                    secrets.insert(account.id.clone(), secret);
                }
                Err(e) => warn!("登录失败 {}: {}", account.id, e),
            }
        }

        self.store.replace_all(secrets);
        if let Err(e) = self.store.save() {
            error!("保存凭据失败: {}", e);
        }
        for account in &self.accounts {
            if self.store.get(&account.id).is_some() {
                self.activate(&account.id);
            }
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(RENEWAL_INTERVAL_SECS as u64)).await;
            scheduler.full_refresh_boxed().await;
        });
    }

    fn full_refresh_boxed(self: Arc<Self>) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move { self.full_refresh().await })
    }

    /// 管理接口：整体替换会话与轮换队列
    pub fn replace_secrets(&self, secrets: HashMap<String, Secret>) -> ApiResult<()> {
        let mut ids: Vec<String> = secrets
            .iter()
            .filter(|(_, s)| s.is_authenticated())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();

        {
            let mut rotation = self.rotation.lock();
            self.store.replace_all(secrets);
            rotation.active = ids.into_iter().collect();
            rotation.counter = 0;
        }
        self.store.save()?;
        info!("已替换会话，当前 {} 个账号", self.rotation.lock().active.len());
        Ok(())
    }
}

/// 计算启动时的续期计划
pub fn plan_renewal(token_left_secs: i64, puid_left_secs: Option<i64>) -> RenewalPlan {
    if let Some(puid_left) = puid_left_secs.filter(|left| *left > 0) {
        if token_left_secs - puid_left > MAX_EXPIRY_DRIFT_SECS {
            return RenewalPlan::Resync;
        }
    }
    if token_left_secs > 0 {
        RenewalPlan::ScheduleIn(Duration::from_secs((token_left_secs + 1) as u64))
    } else {
        RenewalPlan::RenewNow
    }
}

/// token 剩余有效秒数。无法解码时按存储文件修改时间估算24小时
pub fn token_remaining(token: &str, store_mtime: Option<i64>, now: i64) -> i64 {
    match token_expiry(token) {
        Some(exp) => {
            let left = exp - now;
            if left > 0 {
                left % RENEWAL_INTERVAL_SECS
            } else {
                left
            }
        }
        None => RENEWAL_INTERVAL_SECS - (now - store_mtime.unwrap_or(now)),
    }
}

/// 读取 JWT 的 exp
pub fn token_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_i64()
}

/// PUID 中嵌入的签发时间
pub fn puid_issued_at(puid: &str) -> Option<i64> {
    let re = Regex::new(r"\d{10,}").ok()?;
    re.find(puid)?.as_str().parse().ok()
}
