//! 持久化层：SQLite 会话仓库与启动/停服时的状态移交

pub mod conversation;
pub mod resources;

pub use conversation::ConversationRepository;
pub use resources::ResourceHandoff;
