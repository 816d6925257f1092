//! 发布端
//!
//! 把邮件任务写入持久化队列，以及按联系人批量生成会议提醒。

pub mod publisher;
pub mod reminder;

pub use publisher::TaskPublisher;
pub use reminder::{monthly_subject, FanoutReport, ReminderFanout, TEST_REMINDER_SUBJECT};
