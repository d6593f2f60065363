//! Incident and alert lifecycle management
//!
//! Incidents are raised by the health aggregator and deduplicated per
//! `(provider, type, resource)` while active. Incidents at or above the
//! promotion severity roll up into [`SystemAlert`](crate::contracts::SystemAlert)s,
//! one per provider and incident type within the dedup window.

mod alerts;
mod manager;

pub use alerts::{AlertFilter, AlertManager, Promotion, AGGREGATOR_SOURCE};
pub use manager::{IncidentFilter, IncidentManager, NewIncident, RaisedIncident};
