//! Durable attack storage: contract plus the SQLite adapter

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::model::{EnrichedAttack, Geo, GeoRecord};

/// Durable, id-assigning sink for enriched attacks. Ids are monotonically
/// increasing.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one attack and return its store-assigned id. Idempotent on
    /// the attack's correlation key: retrying after an ambiguous response
    /// returns the id of the existing row instead of inserting another.
    async fn append(&self, attack: &EnrichedAttack) -> Result<i64, StoreError>;

    /// Most recent attacks in chronological order, for warm-starting new
    /// subscribers.
    async fn get_recent(&self, limit: i64) -> Result<Vec<EnrichedAttack>, StoreError>;
}

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS attacks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    correlation_key TEXT NOT NULL UNIQUE,
    observed_at BIGINT NOT NULL,
    source_address TEXT NOT NULL,
    destination_port INTEGER NOT NULL,
    protocol TEXT NOT NULL,
    country TEXT,
    city TEXT,
    region TEXT,
    latitude REAL,
    longitude REAL,
    timezone TEXT,
    isp TEXT,
    additional_data TEXT
)
"#;

const CREATE_INDEX_OBSERVED: &str =
    "CREATE INDEX IF NOT EXISTS idx_attacks_observed ON attacks(observed_at)";

const CREATE_INDEX_SOURCE: &str =
    "CREATE INDEX IF NOT EXISTS idx_attacks_source ON attacks(source_address)";

const CREATE_INDEX_COUNTRY: &str =
    "CREATE INDEX IF NOT EXISTS idx_attacks_country ON attacks(country)";

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

type AttackRow = (
    i64,            // id
    String,         // correlation_key
    i64,            // observed_at (millis)
    String,         // source_address
    i32,            // destination_port
    String,         // protocol
    Option<String>, // country
    Option<String>, // city
    Option<String>, // region
    Option<f64>,    // latitude
    Option<f64>,    // longitude
    Option<String>, // timezone
    Option<String>, // isp
    Option<String>, // additional_data
);

impl SqliteStore {
    pub async fn connect(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(&format!("sqlite:{}?mode=rwc", cfg.url))
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(StoreError::from_sqlx)?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        // WAL mode for concurrent readers alongside the ingest writers
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

        for statement in [
            CREATE_TABLE,
            CREATE_INDEX_OBSERVED,
            CREATE_INDEX_SOURCE,
            CREATE_INDEX_COUNTRY,
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;
        }
        Ok(())
    }

    pub async fn total_count(&self) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM attacks")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(row.0)
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn append(&self, attack: &EnrichedAttack) -> Result<i64, StoreError> {
        let key = attack.correlation_key.to_string();
        let record = match &attack.geo {
            Geo::Known(record) => Some(record),
            Geo::Unknown => None,
        };
        let additional = attack.additional_data.as_ref().map(|v| v.to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO attacks (correlation_key, observed_at, source_address, destination_port, protocol,
                                 country, city, region, latitude, longitude, timezone, isp, additional_data)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(correlation_key) DO NOTHING
            "#,
        )
        .bind(&key)
        .bind(attack.observed_at.timestamp_millis())
        .bind(attack.source_address.to_string())
        .bind(attack.destination_port as i32)
        .bind(&attack.protocol)
        .bind(record.map(|r| r.country.clone()))
        .bind(record.map(|r| r.city.clone()))
        .bind(record.map(|r| r.region.clone()))
        .bind(record.map(|r| r.latitude))
        .bind(record.map(|r| r.longitude))
        .bind(record.map(|r| r.timezone.clone()))
        .bind(record.map(|r| r.isp.clone()))
        .bind(additional)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        if result.rows_affected() > 0 {
            return Ok(result.last_insert_rowid());
        }

        // Retried append hit an existing row: hand back its id.
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM attacks WHERE correlation_key = ?")
            .bind(&key)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(id)
    }

    async fn get_recent(&self, limit: i64) -> Result<Vec<EnrichedAttack>, StoreError> {
        let rows: Vec<AttackRow> = sqlx::query_as(
            r#"
            SELECT id, correlation_key, observed_at, source_address, destination_port, protocol,
                   country, city, region, latitude, longitude, timezone, isp, additional_data
            FROM attacks
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        Ok(rows.into_iter().rev().map(row_to_attack).collect())
    }
}

fn row_to_attack(row: AttackRow) -> EnrichedAttack {
    let (
        id,
        correlation_key,
        observed_millis,
        source_address,
        destination_port,
        protocol,
        country,
        city,
        region,
        latitude,
        longitude,
        timezone,
        isp,
        additional_data,
    ) = row;

    let observed_at =
        chrono::DateTime::from_timestamp_millis(observed_millis).unwrap_or_else(Utc::now);
    let source_address: IpAddr = source_address
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let geo = match (country, latitude, longitude) {
        (Some(country), Some(latitude), Some(longitude)) => Geo::Known(GeoRecord {
            ip: source_address,
            country,
            city: city.unwrap_or_else(|| "Unknown".to_string()),
            region: region.unwrap_or_else(|| "Unknown".to_string()),
            latitude,
            longitude,
            timezone: timezone.unwrap_or_else(|| "UTC".to_string()),
            isp: isp.unwrap_or_else(|| "Unknown".to_string()),
            resolved_at: observed_at,
            ttl_expires_at: observed_at,
        }),
        _ => Geo::Unknown,
    };

    EnrichedAttack {
        id: Some(id),
        correlation_key: Uuid::parse_str(&correlation_key).unwrap_or_default(),
        source_address,
        destination_port: destination_port as u16,
        protocol,
        geo,
        observed_at,
        additional_data: additional_data.and_then(|raw| serde_json::from_str(&raw).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{known_geo, sample_attack};

    #[tokio::test]
    async fn append_assigns_monotonic_ids() {
        let store = SqliteStore::in_memory().await.unwrap();

        let first = store
            .append(&sample_attack("1.1.1.1", 22, known_geo("1.1.1.1")))
            .await
            .unwrap();
        let second = store
            .append(&sample_attack("2.2.2.2", 80, Geo::Unknown))
            .await
            .unwrap();

        assert!(second > first);
        assert_eq!(store.total_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_correlation_key_inserts_once() {
        let store = SqliteStore::in_memory().await.unwrap();
        let attack = sample_attack("3.3.3.3", 443, Geo::Unknown);

        let first = store.append(&attack).await.unwrap();
        let second = store.append(&attack).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.total_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_recent_round_trips_geo() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .append(&sample_attack("4.4.4.4", 22, known_geo("4.4.4.4")))
            .await
            .unwrap();
        store
            .append(&sample_attack("5.5.5.5", 3389, Geo::Unknown))
            .await
            .unwrap();

        let recent = store.get_recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        // Chronological order: oldest first.
        assert_eq!(recent[0].source_address.to_string(), "4.4.4.4");
        assert!(!recent[0].geo.is_unknown());
        assert_eq!(recent[0].geo.country(), "Testland");
        assert!(recent[1].geo.is_unknown());
        assert_eq!(recent[1].destination_port, 3389);
    }

    #[tokio::test]
    async fn get_recent_respects_limit() {
        let store = SqliteStore::in_memory().await.unwrap();
        for i in 0..5 {
            store
                .append(&sample_attack("9.9.9.9", 1000 + i, Geo::Unknown))
                .await
                .unwrap();
        }

        let recent = store.get_recent(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        // The three newest, oldest of them first.
        assert_eq!(recent[0].destination_port, 1002);
        assert_eq!(recent[2].destination_port, 1004);
    }
}
