//! tailgate streaming core: workers, rings, subscriber fan-out, and app
//! aggregation.
//!
//! The pool owns workers; each worker owns one upstream read and a weak set
//! of subscriber handles keyed by id. Subscribers hold handles, never
//! workers, so detaching is an O(1) removal and nothing here is cyclic.

#![forbid(unsafe_code)]

mod aggregator;
mod pool;
mod ring;
mod source;
mod subscriber;
mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use aggregator::{Aggregator, AppStreamSpec};
pub use pool::WorkerPool;
pub use ring::RingBuffer;
pub use source::{
    Discovery, LogBroker, LogSource, PodEvent, PodSummary, SourceItem, StreamHandle, TailOptions,
};
pub use subscriber::{FilterSet, OfferOutcome, SubscriberHandle, Subscription};
pub use worker::{Worker, WorkerState};
