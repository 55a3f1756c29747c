pub mod error;
pub mod fakes;
pub mod store;
pub mod traits;
pub mod types;
pub mod validate;

pub use error::ExecError;
pub use store::StaticRuleStore;
pub use traits::*;
pub use types::*;
