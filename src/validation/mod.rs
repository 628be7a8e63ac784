pub mod prompt_validator;
pub mod tql_validator;

pub use prompt_validator::*;
pub use tql_validator::*;
