//! Bidirectional sync engine between a local folder and a cloud file store.
//!
//! The engine observes local and remote mutations, reconciles them against a
//! persistent index, detects conflicts, and drives bounded apply workers
//! until both sides converge. The remote API client, the pattern matcher for
//! user ignores, and the selective-sync preference store are capabilities the
//! host supplies; see [`cumulus_remote::RemoteClient`],
//! [`sync::exclude::SelectiveSync`] and [`sync::exclude::MignoreMatcher`].
//!
//! [`daemon::DaemonRuntime`] wires everything together for embedding hosts.

pub mod daemon;
pub mod sync;

pub use cumulus_remote;
