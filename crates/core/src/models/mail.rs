/// 交给邮件传输层的一封邮件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from_address: String,
    pub from_name: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
}
