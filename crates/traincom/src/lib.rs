mod arena;
mod config;
mod element;
mod error;
mod event;
mod session;
mod sockets;
mod stats;
mod time;

pub use arena::EndpointId;
pub use config::{DEFAULT_PD_PORT, DEFAULT_QOS, DEFAULT_TTL, SessionConfig};
pub use element::{AddressSpec, PktFlags};
pub use error::PdError;
pub use event::{Marshaller, PdCallback, PdInfo};
pub use mio;
pub use session::{PdSession, PubOptions, SubOptions};
pub use stats::{
    GLOBAL_STATISTICS_COMID, PdCounters, PdStatistics, STATISTICS_PULL_COMID, STATS_VERSION,
};
pub use time::Nanos;
pub use traincom_wire as wire;
