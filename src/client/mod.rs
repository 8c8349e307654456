//! Sessions, pools and the pool manager.

pub mod pool;
pub mod session;
pub mod useragent;

pub use pool::{PoolItem, PoolManager, SessionPool};
pub use session::{IaaaClient, PoolKind, Session, dummy_jsessionid};
pub use useragent::{USER_AGENTS, random_user_agent};
