pub mod diagnostics;
pub mod health;
pub mod metrics;
pub mod rooms;
pub mod sessions;

pub use diagnostics::*;
pub use health::*;
pub use metrics::*;
pub use rooms::*;
pub use sessions::*;
