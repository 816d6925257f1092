use serde::{Deserialize, Serialize};

use crate::models::validate_address;

/// 配置文件中的联系人条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactConfig {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl ContactConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_address(&self.email)
            .map_err(|e| anyhow::anyhow!("联系人 {} 的地址无效: {e}", self.name))
    }
}
