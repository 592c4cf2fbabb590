pub mod connctx;
pub mod dispatcher;
pub mod guard;
pub mod hub;
pub mod registry;

pub use connctx::{CloseReason, ConnCtx, DeviceInfo};
pub use dispatcher::Dispatcher;
pub use hub::CollabHub;
pub use registry::{Delivery, LocalRegistry};
