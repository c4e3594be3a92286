//! Shared data model for the flatlay relay and its upload client.
//!
//! Everything in here is plain data: what travels over the relay's HTTP
//! surface, what the orchestrator publishes while a run is in flight, and
//! what gets appended to a run's event log.

pub mod events;
pub mod progress;
pub mod results;
pub mod runs;
pub mod upload;
