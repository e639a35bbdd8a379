//! Data plane of the TCP virtual server.
//!
//! Translation, sequence tracking, option mangling, the connection state
//! machine, admission, RST synthesis, and the application-helper registry.

pub mod app;
pub mod conn;
mod options;
pub mod proto;
mod rst;
mod schedule;
pub mod seq;
pub mod state;
mod translate;

pub use app::AppRegistry;
pub use conn::{AckSlot, Conn, ConnFlags, ConnTuple, Dest, FnatSeq, SynProxySeq};
pub use proto::TcpProtocol;
pub use seq::{seq_after, seq_before, IsnGenerator};
pub use state::{TcpState, TimeoutTable};
