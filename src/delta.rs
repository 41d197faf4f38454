//! In-memory delta synchronisation.
//!
//! Inbound frames decode into [`DeltaBatch`] values whose items carry an
//! [`Operation`] and one of four typed records. [`DeltaSyncEngine`] applies
//! them to thread, message, typing and presence maps:
//!
//! - `add` inserts or overwrites the entry;
//! - `update` merges present fields into an existing entry and creates it
//!   when absent;
//! - `delete`, a typing indicator reporting `stopped`, or presence reporting
//!   `inactive` removes the entry, ignoring absent keys.
//!
//! The engine is owned by a single consumer. Readers get deep copies or
//! shared borrows of [`SyncState`].

mod engine;
mod model;

pub use engine::{
    ApplyReport,
    DeltaSyncEngine,
    EngineStats,
    Observer,
    ObserverId,
    OperationCounters,
    Outcome,
    SyncState,
};
pub use model::{
    DeliveryFlags,
    DeltaBatch,
    DeltaItem,
    DeltaRecord,
    MessageDelta,
    MessageState,
    Operation,
    PresenceDelta,
    PresenceState,
    ThreadDelta,
    ThreadState,
    TypingDelta,
    TypingState,
};
