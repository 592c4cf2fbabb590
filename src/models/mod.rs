pub mod cursor;
pub mod diagnostics;
pub mod error;
pub mod health;
pub mod messages;
pub mod metrics;
pub mod question;
pub mod ratelimit;
pub mod room;
pub mod session;
pub mod user;

pub use cursor::*;
pub use diagnostics::*;
pub use error::*;
pub use health::*;
pub use messages::*;
pub use metrics::*;
pub use question::*;
pub use ratelimit::*;
pub use room::*;
pub use session::*;
pub use user::*;
