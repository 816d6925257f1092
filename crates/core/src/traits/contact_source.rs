use async_trait::async_trait;

use crate::{models::Contact, Result};

/// 联系人来源（只读）
#[async_trait]
pub trait ContactSource: Send + Sync {
    async fn list_active_contacts(&self) -> Result<Vec<Contact>>;
}
