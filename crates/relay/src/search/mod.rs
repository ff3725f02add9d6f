// Live search: one actor per distinct query string, re-run on a timer and
// pushed to every subscribed connection.

pub mod live_query;
pub mod registry;

use thiserror::Error;

pub use live_query::LiveQueryHandle;
pub use registry::QueryRegistry;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("connection {conn_id} already follows query {query:?}")]
    AlreadySubscribed { query: String, conn_id: String },

    #[error("live query has stopped")]
    Stopped,
}
