//! OpFlex-driven OVS rendering agent.
//!
//! Translates policy objects resolved from the managed-object database
//! (MODB) into OpenFlow/OVSDB state on a local OVS datapath. The agent is
//! a single-threaded cooperative loop (spec.md section 5): a connection
//! listener enqueues per-key tasks, a set of [`opflex_common::Orch`]
//! managers drain those queues and submit flow/group edits to the switch,
//! and [`daemon::AgentDaemon`] owns the dispatch loop itself.
//!
//! # Key Components
//!
//! - [`policy`]: the read-only object model the agent renders (spec.md section 3)
//! - [`switch`]: C9, per-bridge connection/state/executor composition
//! - [`intflow`]: C10, the integration-pipeline flow renderer — the core of the CORE
//! - [`accessflow`]: C11, the access-pipeline (security-group) flow renderer
//! - [`stats`]: C12, flow/group statistics reconciliation
//! - [`advert`]: C13, gratuitous-ARP/ND and router advertisement scheduling
//! - [`packetin`]: C14, cookie-routed packet-in dispatch
//! - [`tunnelep`]: C15, tunnel-endpoint-interface discovery
//! - [`conntrack`]: C16, conntrack zone allocation
//! - [`span`]: C17, ERSPAN mirror and NetFlow rendering over OVSDB
//! - [`daemon`]: the priority-ordered dispatch loop
//! - [`audit`]: structured NIST AU-family audit logging

pub mod accessflow;
pub mod advert;
pub mod audit;
pub mod config;
pub mod conntrack;
pub mod daemon;
pub mod intflow;
pub mod packetin;
pub mod policy;
pub mod span;
pub mod stats;
pub mod switch;
pub mod tunnelep;

pub use opflex_common::{IdGenerator, Orch, OrchContext, TaskQueue};
pub use opflex_types::{IpAddress, IpPrefix, MacAddress, VlanId};
