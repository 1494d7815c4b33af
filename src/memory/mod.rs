//! 记忆层：对话历史、工作记忆（含主题摘要）、token 预算、持久化后端

pub mod conversation;
pub mod persistence;
pub mod token_budget;
pub mod tokenizer;
pub mod working;

pub use conversation::{ConversationMemory, Message, MessageKind, Role};
pub use persistence::{FileStorage, MemoryStorage, SqliteStorage, StateStorage, StorageError, StorageKey};
pub use token_budget::{TokenBudget, TokenEstimator};
pub use working::{SummaryHit, WorkingMemory};
