use std::io;

use thiserror::Error;

use crate::switch::PortId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("{0} is full")]
    ResourceExhausted(&'static str),
    #[error("port {0} is not available now")]
    SlotOccupied(PortId),
    #[error("{0}: no such port")]
    NotFound(String),
    #[error("port {0} is busy")]
    Busy(String),
    #[error("unable to open {iface}: {source}")]
    Open {
        iface: String,
        #[source]
        source: io::Error,
    },
    #[error("allocation failed: {0}")]
    Allocation(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
