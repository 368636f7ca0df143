//! Clients for the conversational agent service and the tenant directory.

mod agent;
mod resolver;

pub use agent::HttpAgentClient;
pub use resolver::{CachedResolver, HttpTenantResolver};
