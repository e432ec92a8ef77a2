use std::{collections::HashSet, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{
    ConnectOptions, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous},
};
use tracing::debug;

use crate::{
    IsConflict, KnidMapping, MappingState, Storage, VlanHostMapping, VlanReservation,
};

/// how long a connection waits on another process's write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct SqliteDb {
    inner: SqlitePool,
}

impl Clone for SqliteDb {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl SqliteDb {
    pub async fn new(uri: impl AsRef<str>) -> Result<Self, sqlx::Error> {
        let mut opts = SqliteConnectOptions::from_str(uri.as_ref())?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);
        // make sqlite log queries at trace level so we don't get a bloated log on `info`
        opts.log_statements(tracing::log::LevelFilter::Trace);

        let inner = SqlitePool::connect_with(opts).await?;
        sqlx::migrate!("../../migrations").run(&inner).await?;
        Ok(Self { inner })
    }
}

impl IsConflict for sqlx::Error {
    fn is_conflict(&self) -> bool {
        match self {
            // SQLITE_CONSTRAINT_PRIMARYKEY & SQLITE_CONSTRAINT_UNIQUE
            sqlx::Error::Database(err) => {
                matches!(err.code().as_deref(), Some("1555" | "2067"))
                    || err.message().contains("UNIQUE constraint failed")
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Storage for SqliteDb {
    type Error = sqlx::Error;

    async fn reserved_vlans(&self, host: &str) -> Result<HashSet<u16>, Self::Error> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT vlan_id FROM vlan_reservations WHERE host = ?1
             UNION
             SELECT vlan_id FROM vlan_host_mappings WHERE host = ?1",
        )
        .bind(host)
        .fetch_all(&self.inner)
        .await?;
        rows.into_iter()
            .map(|(v,)| u16::try_from(v).map_err(|err| sqlx::Error::Decode(Box::new(err))))
            .collect()
    }

    async fn insert_reservation(&self, r: &VlanReservation) -> Result<(), Self::Error> {
        util::insert_reservation(&self.inner, &r.host, r.vlan_id, &r.network_id).await
    }

    async fn delete_reservation(&self, host: &str, vlan_id: u16) -> Result<bool, Self::Error> {
        util::delete_reservation(&self.inner, host, vlan_id).await
    }

    async fn insert_lock(&self, network_id: &str, host: &str) -> Result<(), Self::Error> {
        sqlx::query(
            "INSERT INTO attachment_locks (network_id, host, acquired_at) VALUES (?1, ?2, ?3)",
        )
        .bind(network_id)
        .bind(host)
        .bind(util::epoch_millis(Utc::now()))
        .execute(&self.inner)
        .await?;
        Ok(())
    }

    async fn delete_lock(&self, network_id: &str, host: &str) -> Result<bool, Self::Error> {
        let res = sqlx::query("DELETE FROM attachment_locks WHERE network_id = ?1 AND host = ?2")
            .bind(network_id)
            .bind(host)
            .execute(&self.inner)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn get_mapping(
        &self,
        network_id: &str,
        host: &str,
    ) -> Result<Option<VlanHostMapping>, Self::Error> {
        sqlx::query_as::<_, util::MappingRow>(
            "SELECT * FROM vlan_host_mappings WHERE network_id = ?1 AND host = ?2",
        )
        .bind(network_id)
        .bind(host)
        .fetch_optional(&self.inner)
        .await?
        .map(VlanHostMapping::try_from)
        .transpose()
    }

    async fn insert_mapping(&self, m: &VlanHostMapping) -> Result<(), Self::Error> {
        sqlx::query(
            "INSERT INTO vlan_host_mappings
             (network_id, host, vlan_id, segment_id, network_name, state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&m.network_id)
        .bind(&m.host)
        .bind(m.vlan_id as i64)
        .bind(&m.segment_id)
        .bind(&m.network_name)
        .bind(m.state.as_str())
        .bind(util::epoch_millis(m.updated_at))
        .execute(&self.inner)
        .await?;
        Ok(())
    }

    async fn update_mapping_state(
        &self,
        network_id: &str,
        host: &str,
        from: &[MappingState],
        to: MappingState,
    ) -> Result<bool, Self::Error> {
        if from.is_empty() {
            return Ok(false);
        }
        // states are our own constants, never user input
        let states = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let res = sqlx::query(&format!(
            "UPDATE vlan_host_mappings SET state = ?1, updated_at = ?2
             WHERE network_id = ?3 AND host = ?4 AND state IN ({states})"
        ))
        .bind(to.as_str())
        .bind(util::epoch_millis(Utc::now()))
        .bind(network_id)
        .bind(host)
        .execute(&self.inner)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_mapping(
        &self,
        network_id: &str,
        host: &str,
    ) -> Result<Option<VlanHostMapping>, Self::Error> {
        // TRANSACTION START
        let mut trans = self.inner.begin().await?;
        // write first so the transaction holds the write lock from the start
        let removed = sqlx::query_as::<_, util::MappingRow>(
            "DELETE FROM vlan_host_mappings
             WHERE network_id = ?1 AND host = ?2 AND state != 'CREATED'
             RETURNING *",
        )
        .bind(network_id)
        .bind(host)
        .fetch_optional(&mut trans)
        .await?;
        let removed = match removed {
            Some(row) => {
                let mapping = VlanHostMapping::try_from(row)?;
                util::delete_reservation(&mut trans, &mapping.host, mapping.vlan_id).await?;
                Some(mapping)
            }
            None => None,
        };
        trans.commit().await?;
        // TRANSACTION COMMIT
        Ok(removed)
    }

    async fn stale_mappings(
        &self,
        creating_before: DateTime<Utc>,
        deleting_before: DateTime<Utc>,
    ) -> Result<Vec<VlanHostMapping>, Self::Error> {
        sqlx::query_as::<_, util::MappingRow>(
            "SELECT * FROM vlan_host_mappings
             WHERE (state = 'CREATING' AND updated_at < ?1)
                OR (state = 'DELETING' AND updated_at < ?2)
             ORDER BY updated_at",
        )
        .bind(util::epoch_millis(creating_before))
        .bind(util::epoch_millis(deleting_before))
        .fetch_all(&self.inner)
        .await?
        .into_iter()
        .map(VlanHostMapping::try_from)
        .collect()
    }

    async fn network_mappings(
        &self,
        network_id: &str,
    ) -> Result<Vec<VlanHostMapping>, Self::Error> {
        sqlx::query_as::<_, util::MappingRow>(
            "SELECT * FROM vlan_host_mappings WHERE network_id = ?1 ORDER BY host",
        )
        .bind(network_id)
        .fetch_all(&self.inner)
        .await?
        .into_iter()
        .map(VlanHostMapping::try_from)
        .collect()
    }

    async fn purge_network(&self, network_id: &str) -> Result<Vec<VlanHostMapping>, Self::Error> {
        // TRANSACTION START
        let mut trans = self.inner.begin().await?;
        sqlx::query(
            "UPDATE vlan_host_mappings SET state = 'DELETING', updated_at = ?1
             WHERE network_id = ?2",
        )
        .bind(util::epoch_millis(Utc::now()))
        .bind(network_id)
        .execute(&mut trans)
        .await?;
        let removed = sqlx::query_as::<_, util::MappingRow>(
            "DELETE FROM vlan_host_mappings WHERE network_id = ?1 RETURNING *",
        )
        .bind(network_id)
        .fetch_all(&mut trans)
        .await?
        .into_iter()
        .map(VlanHostMapping::try_from)
        .collect::<Result<Vec<_>, _>>()?;
        let reservations = sqlx::query("DELETE FROM vlan_reservations WHERE network_id = ?1")
            .bind(network_id)
            .execute(&mut trans)
            .await?;
        trans.commit().await?;
        // TRANSACTION COMMIT
        debug!(
            %network_id,
            mappings = removed.len(),
            reservations = reservations.rows_affected(),
            "purged network"
        );
        Ok(removed)
    }

    async fn insert_knid(&self, m: &KnidMapping) -> Result<(), Self::Error> {
        sqlx::query("INSERT INTO knid_mappings (fabric_network_id, network_id) VALUES (?1, ?2)")
            .bind(m.fabric_network_id as i64)
            .bind(&m.network_id)
            .execute(&self.inner)
            .await?;
        Ok(())
    }

    async fn get_knid(&self, network_id: &str) -> Result<Option<KnidMapping>, Self::Error> {
        Ok(sqlx::query_as::<_, util::KnidRow>(
            "SELECT fabric_network_id, network_id FROM knid_mappings WHERE network_id = ?1",
        )
        .bind(network_id)
        .fetch_optional(&self.inner)
        .await?
        .map(KnidMapping::from))
    }

    async fn delete_knid(&self, network_id: &str) -> Result<bool, Self::Error> {
        let res = sqlx::query("DELETE FROM knid_mappings WHERE network_id = ?1")
            .bind(network_id)
            .execute(&self.inner)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn knid_mappings(&self) -> Result<Vec<KnidMapping>, Self::Error> {
        Ok(sqlx::query_as::<_, util::KnidRow>(
            "SELECT fabric_network_id, network_id FROM knid_mappings ORDER BY network_id",
        )
        .fetch_all(&self.inner)
        .await?
        .into_iter()
        .map(KnidMapping::from)
        .collect())
    }
}

mod util {
    use super::*;

    pub fn epoch_millis(time: DateTime<Utc>) -> i64 {
        time.timestamp_millis()
    }

    pub fn from_epoch_millis(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
    }

    #[derive(Debug, sqlx::FromRow)]
    pub struct MappingRow {
        pub network_id: String,
        pub host: String,
        pub vlan_id: i64,
        pub segment_id: String,
        pub network_name: String,
        pub state: String,
        pub updated_at: i64,
    }

    impl TryFrom<MappingRow> for VlanHostMapping {
        type Error = sqlx::Error;

        fn try_from(row: MappingRow) -> Result<Self, Self::Error> {
            Ok(Self {
                state: row
                    .state
                    .parse()
                    .map_err(|err| sqlx::Error::Decode(Box::new(err)))?,
                vlan_id: u16::try_from(row.vlan_id)
                    .map_err(|err| sqlx::Error::Decode(Box::new(err)))?,
                network_id: row.network_id,
                host: row.host,
                segment_id: row.segment_id,
                network_name: row.network_name,
                updated_at: from_epoch_millis(row.updated_at),
            })
        }
    }

    #[derive(Debug, sqlx::FromRow)]
    pub struct KnidRow {
        pub fabric_network_id: i64,
        pub network_id: String,
    }

    impl From<KnidRow> for KnidMapping {
        fn from(row: KnidRow) -> Self {
            Self {
                fabric_network_id: row.fabric_network_id as u64,
                network_id: row.network_id,
            }
        }
    }

    pub async fn insert_reservation<'a, E>(
        conn: E,
        host: &str,
        vlan_id: u16,
        network_id: &str,
    ) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'a, Database = Sqlite>,
    {
        sqlx::query("INSERT INTO vlan_reservations (host, vlan_id, network_id) VALUES (?1, ?2, ?3)")
            .bind(host)
            .bind(vlan_id as i64)
            .bind(network_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn delete_reservation<'a, E>(
        conn: E,
        host: &str,
        vlan_id: u16,
    ) -> Result<bool, sqlx::Error>
    where
        E: sqlx::Executor<'a, Database = Sqlite>,
    {
        let res = sqlx::query("DELETE FROM vlan_reservations WHERE host = ?1 AND vlan_id = ?2")
            .bind(host)
            .bind(vlan_id as i64)
            .execute(conn)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}
