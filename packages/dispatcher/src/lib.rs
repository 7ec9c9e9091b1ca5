#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Alert feed state machine.
//!
//! [`AlertDispatcher`] is the single owner of containment state and of the
//! retained alert feed. It consumes two kinds of input:
//!
//! * position fixes, which are tested against every assigned zone and
//!   produce one enter or exit [`AlertEvent`] per actual boundary crossing;
//! * server messages (`new_alert`, `alert_updated`), which are classified
//!   and merged into the feed by alert id.
//!
//! The dispatcher is synchronous; [`service`] runs it inside one tokio task
//! so inputs are applied strictly in arrival order.

pub mod service;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use patrol_alert_models::{AlertBucket, AlertCounts, AlertEvent, AlertType, ContainmentState};
use patrol_geofence_models::{GeoPoint, GeofenceArea};
use patrol_position_models::Position;
use patrol_spatial::ZoneIndex;
use serde::Serialize;
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// Retained events before the oldest is evicted.
pub const DEFAULT_CAPACITY: usize = 200;

/// Outbound channel event carrying a local zone transition.
pub const GEOFENCE_TRANSITION_EVENT: &str = "geofence_transition";

/// Inbound server events the dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ServerEvent {
    /// A new alert was raised.
    NewAlert,
    /// An existing alert changed; replaces the retained copy.
    AlertUpdated,
}

impl ServerEvent {
    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::NewAlert, Self::AlertUpdated]
    }
}

/// Read-only summary published after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherSnapshot {
    pub counts: AlertCounts,
    pub unread: usize,
    pub has_unacknowledged_emergency: bool,
    /// Ids of the zones the officer is currently inside.
    pub inside: Vec<String>,
}

/// Containment tracking and alert feed for one officer.
pub struct AlertDispatcher {
    officer_id: String,
    zones: ZoneIndex,
    containment: BTreeMap<String, ContainmentState>,
    /// Oldest first.
    events: VecDeque<AlertEvent>,
    capacity: usize,
    acknowledged: BTreeSet<String>,
    unread: usize,
}

impl AlertDispatcher {
    /// Creates a dispatcher tracking `zones` for `officer_id`. Every zone
    /// starts outside. A `capacity` of zero is treated as one.
    #[must_use]
    pub fn new(officer_id: impl Into<String>, zones: Vec<GeofenceArea>, capacity: usize) -> Self {
        let mut dispatcher = Self {
            officer_id: officer_id.into(),
            zones: ZoneIndex::new(Vec::new()),
            containment: BTreeMap::new(),
            events: VecDeque::new(),
            capacity: capacity.max(1),
            acknowledged: BTreeSet::new(),
            unread: 0,
        };
        dispatcher.set_zones(zones);
        dispatcher
    }

    /// Replaces the assigned zones.
    ///
    /// Containment of zones that remain assigned is kept; state for zones
    /// that are no longer assigned is dropped without an exit event.
    pub fn set_zones(&mut self, zones: Vec<GeofenceArea>) {
        let ids: BTreeSet<String> = zones.iter().map(|z| z.id.clone()).collect();
        self.containment.retain(|id, _| ids.contains(id));
        for id in ids {
            let officer_id = &self.officer_id;
            self.containment
                .entry(id)
                .or_insert_with_key(|id| ContainmentState::outside(officer_id.clone(), id.clone()));
        }
        log::info!("Tracking {} zone(s) for {}", zones.len(), self.officer_id);
        self.zones = ZoneIndex::new(zones);
    }

    /// Applies a position fix. Returns the transition events it produced,
    /// which are also retained in the feed.
    pub fn handle_position(&mut self, position: &Position) -> Vec<AlertEvent> {
        let point = GeoPoint::new(position.latitude, position.longitude);
        let inside: BTreeSet<&str> = self
            .zones
            .zones_containing(&point)
            .into_iter()
            .map(|zone| zone.id.as_str())
            .collect();

        let mut produced = Vec::new();
        for zone in self.zones.zones() {
            let Some(state) = self.containment.get_mut(&zone.id) else {
                continue;
            };
            let Some(transition) = state.observe(inside.contains(zone.id.as_str()), position.timestamp)
            else {
                continue;
            };

            log::info!(
                "{} {transition} zone '{}' at ({}, {})",
                self.officer_id,
                zone.name,
                position.latitude,
                position.longitude
            );
            produced.push(AlertEvent::zone_transition(
                transition,
                &zone.id,
                &zone.name,
                position.latitude,
                position.longitude,
                position.timestamp,
            ));
        }

        for event in &produced {
            self.retain(event.clone());
        }
        produced
    }

    /// Applies an inbound server message.
    ///
    /// Unknown event names are ignored. Malformed payloads are logged and
    /// dropped. Returns the event that was added or replaced.
    pub fn handle_server_message(
        &mut self,
        event_name: &str,
        payload: Value,
        received_at: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        let Ok(kind) = ServerEvent::from_str(event_name) else {
            log::debug!("Ignoring server event '{event_name}'");
            return None;
        };

        let event = match AlertEvent::from_server(payload, received_at) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping '{event_name}' message: {e}");
                return None;
            }
        };

        log::debug!("{kind} {} classified as {}", event.id, event.alert_type);
        let inserted = self.retain(event.clone());
        if kind == ServerEvent::AlertUpdated && inserted {
            log::debug!("Update for unknown alert {}, added", event.id);
        }
        Some(event)
    }

    /// Adds `event`, replacing a retained event with the same id in place.
    /// Returns whether it was newly added.
    fn retain(&mut self, event: AlertEvent) -> bool {
        if let Some(slot) = self.events.iter_mut().find(|e| e.id == event.id) {
            if event.alert_type != AlertType::Emergency {
                self.acknowledged.remove(&event.id);
            }
            *slot = event;
            return false;
        }

        self.events.push_back(event);
        self.unread += 1;
        while self.events.len() > self.capacity {
            if let Some(evicted) = self.events.pop_front() {
                log::trace!("Evicting alert {}", evicted.id);
                self.acknowledged.remove(&evicted.id);
            }
        }
        true
    }

    /// Per-bucket counts over the retained events.
    #[must_use]
    pub fn counts(&self) -> AlertCounts {
        AlertCounts::tally(&self.events)
    }

    /// Retained events in `bucket`, newest first.
    #[must_use]
    pub fn filter(&self, bucket: AlertBucket) -> Vec<&AlertEvent> {
        self.events
            .iter()
            .rev()
            .filter(|e| bucket.includes(e.alert_type))
            .collect()
    }

    /// Looks up a retained event.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&AlertEvent> {
        self.events.iter().find(|e| e.id == id)
    }

    /// Marks a retained emergency as acknowledged. Returns `false` if there
    /// is no emergency with that id.
    pub fn acknowledge(&mut self, id: &str) -> bool {
        let known = self
            .events
            .iter()
            .any(|e| e.id == id && e.alert_type == AlertType::Emergency);
        if known {
            self.acknowledged.insert(id.to_string());
        }
        known
    }

    #[must_use]
    pub fn has_unacknowledged_emergency(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.alert_type == AlertType::Emergency && !self.acknowledged.contains(&e.id))
    }

    /// Events added since the last [`Self::clear_unread`].
    #[must_use]
    pub const fn unread(&self) -> usize {
        self.unread
    }

    pub const fn clear_unread(&mut self) {
        self.unread = 0;
    }

    /// Containment state for one assigned zone.
    #[must_use]
    pub fn containment(&self, geofence_id: &str) -> Option<&ContainmentState> {
        self.containment.get(geofence_id)
    }

    #[must_use]
    pub fn officer_id(&self) -> &str {
        &self.officer_id
    }

    #[must_use]
    pub fn snapshot(&self) -> DispatcherSnapshot {
        DispatcherSnapshot {
            counts: self.counts(),
            unread: self.unread,
            has_unacknowledged_emergency: self.has_unacknowledged_emergency(),
            inside: self
                .containment
                .values()
                .filter(|s| s.inside)
                .map(|s| s.geofence_id.clone())
                .collect(),
        }
    }
}
