use async_trait::async_trait;
use courier_core::{config::ContactConfig, Contact, ContactSource, Result};
use tracing::info;

/// 来自配置文件的静态联系人目录
#[derive(Debug, Clone, Default)]
pub struct StaticContactSource {
    contacts: Vec<ContactConfig>,
}

impl StaticContactSource {
    pub fn new(contacts: Vec<ContactConfig>) -> Self {
        Self { contacts }
    }
}

#[async_trait]
impl ContactSource for StaticContactSource {
    async fn list_active_contacts(&self) -> Result<Vec<Contact>> {
        let active: Vec<Contact> = self
            .contacts
            .iter()
            .filter(|contact| contact.active)
            .map(|contact| Contact::new(contact.name.clone(), contact.email.clone()))
            .collect();

        info!("Retrieved {} active contacts", active.len());
        Ok(active)
    }
}
