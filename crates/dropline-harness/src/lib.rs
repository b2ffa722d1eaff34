//! Dropline test harness
//!
//! In-memory implementation of the transport contract, used by the runtime's
//! integration tests and by anyone embedding Dropline who wants to exercise
//! the session layer without a network.

pub mod loopback;

pub use loopback::{
    BrokerCall, ConnectCall, LoopbackBroker, LoopbackConfig, LoopbackEndpoint, LoopbackSession,
    LoopbackStats, LoopbackTransport, ReconnectBehavior, RemotePeer, SentFrame,
};
