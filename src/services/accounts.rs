use crate::error::ApiResult;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// 配置的账号。quotas 依次为各会话档位的并发配额（团队、个人）
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: String,
    pub password: String,
    pub quotas: Vec<u32>,
}

impl Account {
    /// 第一档配额
    pub fn primary_quota(&self) -> u32 {
        self.quotas.first().copied().unwrap_or(1)
    }

    /// 团队会话可用时的总配额
    pub fn total_quota(&self, team_eligible: bool) -> u32 {
        let mut total = self.primary_quota();
        if team_eligible && self.quotas.len() == 2 {
            total += self.quotas[1];
        }
        total
    }
}

/// 解析 accounts.txt，每行 `id:password[:a[/b]]`
pub fn parse_accounts(content: &str) -> Vec<Account> {
    let mut accounts: Vec<Account> = Vec::new();

    for line in content.lines() {
        let fields: Vec<&str> = line.trim().split(':').collect();
        if fields.len() < 2 {
            continue;
        }

        let quotas = match fields.get(2) {
            Some(field) => parse_quotas(field),
            None => vec![1],
        };

        let account = Account {
            id: fields[0].to_string(),
            password: fields[1].to_string(),
            quotas,
        };

        // 重复账号以后出现的为准
        match accounts.iter_mut().find(|a| a.id == account.id) {
            Some(existing) => *existing = account,
            None => accounts.push(account),
        }
    }

    accounts
}

/// 最多两档，遇到非法或小于1的值即停止
fn parse_quotas(field: &str) -> Vec<u32> {
    let mut quotas = Vec::new();
    for (index, part) in field.split('/').enumerate() {
        if index == 2 {
            break;
        }
        match part.trim().parse::<i64>() {
            Ok(value) if value >= 1 => quotas.push(value as u32),
            _ => break,
        }
    }
    if quotas.is_empty() {
        quotas.push(1);
    }
    quotas
}

/// 读取账号文件，不存在时返回空列表
pub fn load_accounts(path: impl AsRef<Path>) -> ApiResult<Vec<Account>> {
    let path = path.as_ref();
    if !path.exists() {
        debug!("账号文件不存在，跳过加载: {}", path.display());
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    let accounts = parse_accounts(&content);
    info!("Loaded {} accounts from {}", accounts.len(), path.display());
    Ok(accounts)
}
