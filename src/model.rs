//! Core data types shared across the ingestion pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Raw connection attempt as observed by a port listener.
///
/// Transient: it only lives on the listener-to-coordinator channel and is
/// never persisted directly.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub source_address: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,
    pub protocol: &'static str,
    pub observed_at: DateTime<Utc>,
}

impl ConnectionEvent {
    pub fn tcp(source_address: IpAddr, source_port: u16, destination_port: u16) -> Self {
        Self {
            source_address,
            source_port,
            destination_port,
            protocol: "tcp",
            observed_at: Utc::now(),
        }
    }
}

/// Location metadata resolved for a source IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoRecord {
    pub ip: IpAddr,
    pub country: String,
    pub city: String,
    pub region: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: String,
    pub isp: String,
    pub resolved_at: DateTime<Utc>,
    pub ttl_expires_at: DateTime<Utc>,
}

/// Geo metadata attached to an attack.
///
/// A lookup that fails for any reason (timeout, provider error, rate limit)
/// degrades to `Unknown` rather than dropping the event.
#[derive(Debug, Clone)]
pub enum Geo {
    Known(GeoRecord),
    Unknown,
}

impl Geo {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Geo::Unknown)
    }

    pub fn country(&self) -> &str {
        match self {
            Geo::Known(r) => &r.country,
            Geo::Unknown => "Unknown",
        }
    }

    pub fn city(&self) -> &str {
        match self {
            Geo::Known(r) => &r.city,
            Geo::Unknown => "Unknown",
        }
    }

    pub fn region(&self) -> &str {
        match self {
            Geo::Known(r) => &r.region,
            Geo::Unknown => "Unknown",
        }
    }

    pub fn isp(&self) -> &str {
        match self {
            Geo::Known(r) => &r.isp,
            Geo::Unknown => "Unknown",
        }
    }

    pub fn timezone(&self) -> &str {
        match self {
            Geo::Known(r) => &r.timezone,
            Geo::Unknown => "UTC",
        }
    }

    pub fn latitude(&self) -> f64 {
        match self {
            Geo::Known(r) => r.latitude,
            Geo::Unknown => 0.0,
        }
    }

    pub fn longitude(&self) -> f64 {
        match self {
            Geo::Known(r) => r.longitude,
            Geo::Unknown => 0.0,
        }
    }
}

/// A connection attempt merged with its geo metadata, ready for storage and
/// fan-out. Immutable after creation except for the store-assigned id.
#[derive(Debug, Clone)]
pub struct EnrichedAttack {
    pub id: Option<i64>,
    /// Caller-supplied key making store appends safe under at-least-once
    /// retry: a retried append with the same key cannot insert a second row.
    pub correlation_key: Uuid,
    pub source_address: IpAddr,
    pub destination_port: u16,
    pub protocol: String,
    pub geo: Geo,
    pub observed_at: DateTime<Utc>,
    pub additional_data: Option<serde_json::Value>,
}

impl EnrichedAttack {
    pub fn from_event(event: &ConnectionEvent, geo: Geo) -> Self {
        Self {
            id: None,
            correlation_key: Uuid::new_v4(),
            source_address: event.source_address,
            destination_port: event.destination_port,
            protocol: event.protocol.to_string(),
            geo,
            observed_at: event.observed_at,
            additional_data: None,
        }
    }
}

/// Wire schema pushed to live-feed subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedMessage {
    pub id: i64,
    pub source_address: String,
    pub destination_port: u16,
    pub protocol: String,
    pub country: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    pub region: String,
    pub timezone: String,
    pub isp: String,
    pub observed_at: DateTime<Utc>,
}

impl FeedMessage {
    pub fn from_attack(attack: &EnrichedAttack) -> Self {
        Self {
            id: attack.id.unwrap_or(0),
            source_address: attack.source_address.to_string(),
            destination_port: attack.destination_port,
            protocol: attack.protocol.clone(),
            country: attack.geo.country().to_string(),
            city: attack.geo.city().to_string(),
            latitude: attack.geo.latitude(),
            longitude: attack.geo.longitude(),
            region: attack.geo.region().to_string(),
            timezone: attack.geo.timezone().to_string(),
            isp: attack.geo.isp().to_string(),
            observed_at: attack.observed_at,
        }
    }
}
