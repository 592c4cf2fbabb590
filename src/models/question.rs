use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One recorded edit of a question. The latest arrival wins.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QuestionUpdate {
    pub form_id: String,
    pub question_id: String,
    pub user_id: String,
    pub update_type: String,
    pub content: Value,
    pub version: Option<i64>,
    pub timestamp: i64,
}
