pub mod error;
pub mod types;

pub use error::{TallyError, TallyResult};
pub use types::{ResourceType, ServiceInfo};
