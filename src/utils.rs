use rand::{distributions::Alphanumeric, thread_rng, Rng};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// 设备ID命名空间
const DEVICE_NAMESPACE: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_567812345678);

/// 生成Unix时间戳（秒）
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// 生成随机字符串
pub fn generate_random_string(length: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// 生成UUID
pub fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// 账号对应的固定设备ID，匿名请求使用随机ID
pub fn device_id_for(account: &str) -> String {
    if account.is_empty() {
        generate_uuid()
    } else {
        Uuid::new_v5(&DEVICE_NAMESPACE, account.as_bytes()).to_string()
    }
}

/// 日志中只显示token前缀
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(12).collect();
    if prefix.len() < token.len() {
        format!("{}...", prefix)
    } else {
        prefix
    }
}

/// 检查模型类型
pub fn is_legacy_model(model: &str) -> bool {
    model.starts_with("gpt-3.5")
}

pub fn is_gpt4_model(model: &str) -> bool {
    model.starts_with("gpt-4")
}
