pub mod assignor;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod membership;
pub mod stability;
pub mod store;
pub mod topology;
pub mod types;
pub mod util;
pub mod worker;
