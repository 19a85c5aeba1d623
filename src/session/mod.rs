//! 会话层：SQLite 持久会话与按智能体懒创建的会话管理器

pub mod manager;
pub mod store;

pub use manager::{SessionManager, TeardownReport};
pub use store::{session_id_for, Session, SessionDb, SessionError};
