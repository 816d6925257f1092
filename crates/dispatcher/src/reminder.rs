use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_core::{Contact, ContactSource, Result, TaskEnvelope};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::TaskPublisher;

pub const TEST_REMINDER_SUBJECT: &str = "Test Meeting Reminder";
const TEST_REMINDER_BODY: &str = "<p>This is a test meeting reminder email.</p>";

/// 一次批量发布的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub queued: usize,
    pub failed: usize,
}

/// 会议提醒的批量发布
pub struct ReminderFanout {
    publisher: TaskPublisher,
    contacts: Arc<dyn ContactSource>,
    sender_display_name: String,
}

impl ReminderFanout {
    pub fn new(
        publisher: TaskPublisher,
        contacts: Arc<dyn ContactSource>,
        sender_display_name: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            contacts,
            sender_display_name: sender_display_name.into(),
        }
    }

    /// 给单个地址发一封测试提醒
    pub async fn send_test(&self, email: &str) -> Result<FanoutReport> {
        info!("发送测试提醒到 {}", email);
        let envelope = TaskEnvelope::new(email, TEST_REMINDER_SUBJECT, TEST_REMINDER_BODY)?
            .with_sender_display_name(self.sender_display_name.clone());

        self.publisher.publish_task(&envelope).await?;
        Ok(FanoutReport {
            queued: 1,
            failed: 0,
        })
    }

    pub async fn send_monthly(&self) -> Result<FanoutReport> {
        self.send_monthly_at(Utc::now()).await
    }

    /// 给每个活跃联系人发布一封月度提醒
    ///
    /// 单个联系人发布失败只计数，不中断其余联系人。
    pub async fn send_monthly_at(&self, now: DateTime<Utc>) -> Result<FanoutReport> {
        let contacts = self.contacts.list_active_contacts().await?;
        let month = month_label(now);
        let subject = monthly_subject(now);
        let mut report = FanoutReport::default();

        for contact in &contacts {
            let envelope = match TaskEnvelope::new(
                contact.email.as_str(),
                subject.as_str(),
                monthly_body(contact, &month),
            ) {
                Ok(envelope) => envelope
                    .with_sender_display_name(self.sender_display_name.clone())
                    .with_scheduled_at(now),
                Err(e) => {
                    warn!("联系人 {} 的地址无效: {}", contact.name, e);
                    report.failed += 1;
                    continue;
                }
            };

            match self.publisher.publish_task(&envelope).await {
                Ok(()) => report.queued += 1,
                Err(e) => {
                    error!("发布给 {} 的提醒失败: {}", contact.email, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "月度提醒发布完成: {} 封已入队，{} 封失败",
            report.queued, report.failed
        );
        Ok(report)
    }
}

fn month_label(now: DateTime<Utc>) -> String {
    now.format("%B %Y").to_string()
}

pub fn monthly_subject(now: DateTime<Utc>) -> String {
    format!("Monthly Team Meeting Reminder - {}", month_label(now))
}

fn monthly_body(contact: &Contact, month: &str) -> String {
    format!(
        "<html><body style=\"font-family: Arial, sans-serif; color: #333;\">\
         <h2>Monthly Team Meeting Reminder</h2>\
         <p>Dear {},</p>\
         <p>This is a friendly reminder about our monthly team meeting for <strong>{}</strong>.</p>\
         <p>Please confirm your attendance and send any agenda items ahead of time.</p>\
         <p style=\"font-size: 12px; color: #666;\">This is an automated reminder. Please do not reply.</p>\
         </body></html>",
        html_escape::encode_text(&contact.name),
        month
    )
}
