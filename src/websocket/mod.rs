pub mod handler;
pub mod msg_cursor_handler;
pub mod msg_form_handler;
pub mod msg_heartbeat_handler;
pub mod msg_join_handler;
pub mod msg_leave_handler;
pub mod msg_question_handler;
pub mod msg_typing_handler;

pub use handler::websocket_handler;
