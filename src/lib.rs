//! Resource layer for a kernel-bypass, zero-copy packet switch.
//!
//! Interfaces are bound as [`Port`]s (one independently pollable ring
//! descriptor per hardware queue, all sharing a single memory mapping) and
//! registered in a fixed-capacity [`Switch`] table. [`Worker`] threads each
//! own a disjoint set of claimed rings and forward packets between them by
//! swapping buffer indexes, so the data path needs no locks. The forwarding
//! decision itself is pluggable via [`ForwardPolicy`].
//!
//! Backends implement [`device::Device`]; the in-tree [`sim::SimFabric`]
//! emulates a NIC fabric for tests and demos.

pub mod device;
pub mod errors;
pub mod port;
pub mod ring;
pub mod sim;
pub mod switch;
pub mod worker;

pub use errors::{Error, Result};
pub use port::{Port, RingGrant};
pub use switch::{MAX_PORTS, PortId, Switch};
pub use worker::{
    ForwardPolicy, PacketView, ShutdownToken, Worker, WorkerEvent, WorkerHandle, WorkerState,
};
