//! Core types and cost computation for z-meter.
//!
//! This crate holds everything that turns a completed LLM call into a priced,
//! tagged usage record:
//!
//! - **Identifiers**: `EventId`, `BatchId`
//! - **Events**: `CallObservation`, `UsageEvent`, `Batch`
//! - **Pricing**: `PricingCatalog`, `PriceRecord`
//! - **Cost**: `CostEngine`, `MissPolicy`
//! - **Counting**: `UnitCounter`, `TokenizerCounter`, `HeuristicCounter`, `CounterRegistry`
//! - **Tags**: `TagContext`
//! - **Building**: `EventBuilder`
//!
//! # Cost unit
//!
//! Costs are USD as `rust_decimal::Decimal`. Prices are quoted per 1,000
//! units (tokens). Nothing is rounded until the collector decides to.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod builder;
pub mod context;
pub mod cost;
pub mod counting;
pub mod error;
pub mod event;
pub mod ids;
pub mod pricing;

pub use builder::EventBuilder;
pub use context::TagContext;
pub use cost::{CostEngine, CostResult, MissPolicy};
pub use counting::{
    CounterRegistry, HeuristicCounter, HeuristicMode, TokenizerCounter, UnitCount, UnitCounter,
};
pub use error::{CountingWarning, MeterError, Result};
pub use event::{
    Batch, CallError, CallObservation, CostConfidence, FlushTrigger, ReportedUsage, UnitSource,
    UsageEvent,
};
pub use ids::{BatchId, EventId, IdError};
pub use pricing::{default_records, ModelKey, PriceRecord, PricingCatalog, MAX_PRICE_PER_1K};
