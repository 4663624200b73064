//! JSON wire protocol for the broker's streaming API.
//!
//! One websocket carries both correlated request/response exchanges (matched
//! by the `req_id` the server echoes back) and push streams (ticks, contract
//! updates) with no caller waiting. `wire` builds outbound frames, `codec`
//! decodes and classifies inbound ones.

pub mod codec;
pub mod wire;
