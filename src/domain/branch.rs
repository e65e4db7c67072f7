// ==========================================
// SPED 账簿导入系统 - 分支机构实体
// ==========================================
// 唯一性: (company_id, taxpayer_id)
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub branch_id: String,
    pub company_id: String,
    pub taxpayer_id: String,
    pub name: String,
    pub state: Option<String>,
    pub created_at: DateTime<Utc>,
}
