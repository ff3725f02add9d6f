// WebSocket surface: one task per connection, decoding client envelopes and
// draining the connection's outbound queue.

mod handler;
pub(crate) mod protocol;
pub(crate) mod session;

pub(crate) use handler::router;
pub(crate) use session::{SessionRouterState, SessionSink};
