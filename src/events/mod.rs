//! 事件模块
//!
//! - `types.rs`: 队列、扫描、会话事件定义
//! - `bus.rs`: 基于 broadcast 的事件总线
//! - `throttle.rs`: 进度更新节流

mod bus;
mod throttle;
mod types;

pub use bus::*;
pub use throttle::*;
pub use types::*;
