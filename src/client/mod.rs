//! Realtime client facade.
//!
//! [`RealtimeClient`] composes the transport, delta engine, gap handler,
//! reconnect manager and session store. All state mutation happens on one
//! dispatcher task: transport frames, backfill results and control requests
//! are funnelled into it, so the delta engine never sees concurrent writers.
//! Application code observes the client through [`RealtimeEvent`]s and
//! deep copies of the synchronised state.
//!
//! [`RealtimeEvent`]: crate::events::RealtimeEvent

mod builder;
mod dispatcher;
mod resolver;
mod runtime;

pub use builder::RealtimeClientBuilder;
pub use resolver::UserResolver;
pub use runtime::RealtimeClient;

#[cfg(test)]
mod tests;
