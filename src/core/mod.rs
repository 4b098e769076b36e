//! 核心编排层：错误分类、会话锁、会话编排与优雅关闭

pub mod error;
pub mod lock;
pub mod session;
pub mod shutdown;

pub use error::{classify, looks_like_timeout, ErrorKind, SessionError};
pub use lock::{LockGuard, SessionLock};
pub use session::{build_engine, Session, Trigger, TurnHandle};
pub use shutdown::{ShutdownManager, ShutdownReason};
