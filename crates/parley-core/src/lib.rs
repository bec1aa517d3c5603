pub mod clarify;
pub mod config;
pub mod coordinator;
pub mod dialog;
pub mod error;
pub mod intent;
pub mod memory;
pub mod persist;
pub mod server;
pub mod worker;

pub use clarify::{Clarifier, ClarifierRoute, HttpChatBackend, ToolHandler};
pub use config::RouterConfig;
pub use coordinator::{Control, Coordinator, CoordinatorHandle, Mailboxes};
pub use dialog::{DialogRegistry, DialogState};
pub use error::RouterError;
pub use intent::{IntentClassifier, IntentMatcher, RuleClassifier};
pub use memory::MemoryStore;
pub use server::build_router;
pub use worker::{WorkerManager, WorkerRoute};
