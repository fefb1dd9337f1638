//! OpenFlow switch connection and flow-programming primitives.
//!
//! This crate owns everything that talks to the OVS datapath over
//! OpenFlow: wire identifiers, the flow/group encoder, per-table state
//! tracking and diffing, the connection state machine, port mapping,
//! flow/group read-back, and blocking flow-mod execution.
//!
//! # Architecture
//!
//! - [`types`]: type-safe OpenFlow wire identifiers (table, port, group, xid)
//! - [`error`]: error types and OpenFlow error-message classification
//! - [`flow`]: match/action builders and the `FlowEntry`/`FlowEdit`/`GroupEntry` entities
//! - [`encode`]: deterministic wire encoding of flows and groups
//! - [`table_state`]: per-table ownership tracking and diffing
//!
//! # Example
//!
//! ```ignore
//! use ofswitch::{Match, FlowEntry, TableId, Cookie, PortNo};
//!
//! let m = Match::builder().eth_type(0x0800).ip_proto(6).build();
//! let entry = FlowEntry {
//!     table: TableId(0),
//!     priority: 100,
//!     cookie: Cookie(1),
//!     match_: m,
//!     instructions: vec![],
//! };
//! ```

pub mod conn;
pub mod encode;
pub mod error;
pub mod executor;
pub mod flow;
pub mod port_mapper;
pub mod reader;
pub mod table_state;
pub mod types;

pub use conn::{ConnState, ConnectionRegistry, KeepaliveAction, OfMessage, PortStatusReason, SwitchConnection};
pub use encode::{encode_flow_entry, encode_group_entry};
pub use error::{OfError, OfErrorCode, OfErrorType, OfResult};
pub use executor::FlowExecutor;
pub use flow::{
    Action, FlowEdit, FlowEntry, GroupBucket, GroupEntry, GroupType, Match, MatchBuilder,
    MatchField, MatchValue,
};
pub use port_mapper::PortMapper;
pub use reader::FlowReader;
pub use table_state::{ObjectKey, TableState, TableStateSet};
pub use types::{Cookie, GroupId, PortNo, TableId, Xid, XidGenerator};
