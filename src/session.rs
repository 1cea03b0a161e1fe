pub mod query;
pub mod status;

pub use query::{QueryResponse, QuerySession, query_candidates, query_first_success};
pub use status::{StatusOutcome, StatusSession, ping_status};
