pub mod backoff;
pub mod conflict;
pub mod engine;
pub mod exclude;
pub mod fs_events;
pub mod hasher;
pub mod index;
pub mod monitor;
pub mod normalize;
pub mod notify;
pub mod paths;
pub mod queue;
pub mod reconcile;
pub mod remote_fetcher;
pub mod transfer;
pub mod workers;
