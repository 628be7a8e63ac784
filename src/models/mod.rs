pub mod conversation;
pub mod execution;
pub mod llm;
pub mod optimization;
pub mod plan;
pub mod query;
pub mod reasoning;
pub mod schema;
pub mod semantic;

pub use conversation::*;
pub use execution::*;
pub use llm::*;
pub use optimization::*;
pub use plan::*;
pub use query::*;
pub use reasoning::*;
pub use schema::*;
pub use semantic::*;
