//! External interface engine for wavecap capture helpers.
//!
//! A capture helper talks to its host over exactly one duplex
//! [`Transport`][transport::Transport] (a pipe pair when spawned by the
//! host, a raw TCP socket, or a WebSocket for remote capture). The
//! [`Engine`][engine::Engine] owns the read/dispatch loop on top of that
//! transport: it reassembles frames from the receive buffer, decodes
//! command envelopes, dispatches them to registered handlers, tracks
//! ping/pong liveness, and drives the two shutdown paths (graceful
//! spindown that drains pending writes, or an immediate kill that cancels
//! background tasks and runs exit callbacks).

pub mod engine;
pub mod transport;

pub use crate::{
    engine::{
        Engine,
        EngineError,
        ExternalHandle,
    },
    transport::{
        Endpoint,
        Transport,
        TransportError,
        WsAuth,
    },
};
