//! SQLite-based cluster registry.
//!
//! This is the durable store the daemon opens at startup. Cluster rows and
//! their node rows are written and deleted in a single transaction so a
//! record is never observed with a partial node list.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::{Cluster, Node, Registry, RegistryError};

/// SQLite cluster registry.
pub struct SqliteRegistry {
    conn: Mutex<Option<Connection>>,
}

impl SqliteRegistry {
    /// Open or create a registry at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory registry (for testing).
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RegistryError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_mut().ok_or(RegistryError::Closed)?;
        f(conn)
    }
}

fn init_schema(conn: &Connection) -> Result<(), RegistryError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS clusters (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            creator TEXT NOT NULL,
            timeout_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS nodes (
            cluster_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            container_id TEXT NOT NULL,
            name TEXT NOT NULL,
            initial_server_version TEXT NOT NULL,
            ipv4_address TEXT NOT NULL,
            PRIMARY KEY (cluster_id, position)
        );

        CREATE INDEX IF NOT EXISTS idx_clusters_owner ON clusters(owner);
        "#,
    )?;

    debug!("Registry schema initialized");
    Ok(())
}

fn timeout_from_millis(id: &str, ms: i64) -> Result<DateTime<Utc>, RegistryError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| RegistryError::Invalid(format!("cluster {id} has timeout out of range")))
}

fn load_nodes(conn: &Connection, cluster_id: &str) -> Result<Vec<Node>, RegistryError> {
    let mut stmt = conn.prepare(
        "SELECT container_id, name, initial_server_version, ipv4_address
         FROM nodes WHERE cluster_id = ?1 ORDER BY position",
    )?;

    let nodes = stmt
        .query_map(params![cluster_id], |row| {
            Ok(Node {
                container_id: row.get(0)?,
                name: row.get(1)?,
                initial_server_version: row.get(2)?,
                ipv4_address: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(nodes)
}

impl Registry for SqliteRegistry {
    fn list_clusters(&self) -> Result<Vec<Cluster>, RegistryError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, owner, creator, timeout_ms FROM clusters ORDER BY rowid")?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, owner, creator, timeout_ms)| {
                    let timeout = timeout_from_millis(&id, timeout_ms)?;
                    let nodes = load_nodes(conn, &id)?;
                    Ok(Cluster {
                        id,
                        owner,
                        creator,
                        timeout,
                        nodes,
                    })
                })
                .collect()
        })
    }

    fn get_cluster(&self, id: &str) -> Result<Option<Cluster>, RegistryError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT owner, creator, timeout_ms FROM clusters WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()?;

            let Some((owner, creator, timeout_ms)) = row else {
                return Ok(None);
            };

            Ok(Some(Cluster {
                id: id.to_string(),
                owner,
                creator,
                timeout: timeout_from_millis(id, timeout_ms)?,
                nodes: load_nodes(conn, id)?,
            }))
        })
    }

    fn insert_cluster(&self, cluster: &Cluster) -> Result<(), RegistryError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO clusters (id, owner, creator, timeout_ms) VALUES (?1, ?2, ?3, ?4)",
                params![
                    cluster.id,
                    cluster.owner,
                    cluster.creator,
                    cluster.timeout.timestamp_millis(),
                ],
            )?;
            if inserted == 0 {
                return Err(RegistryError::Conflict(cluster.id.clone()));
            }

            for (position, node) in cluster.nodes.iter().enumerate() {
                tx.execute(
                    r#"
                    INSERT INTO nodes (cluster_id, position, container_id, name, initial_server_version, ipv4_address)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    params![
                        cluster.id,
                        position as i64,
                        node.container_id,
                        node.name,
                        node.initial_server_version,
                        node.ipv4_address,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
    }

    fn update_timeout(&self, id: &str, timeout: DateTime<Utc>) -> Result<(), RegistryError> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE clusters SET timeout_ms = ?1 WHERE id = ?2",
                params![timeout.timestamp_millis(), id],
            )?;
            if updated == 0 {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    fn delete_cluster(&self, id: &str) -> Result<(), RegistryError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM nodes WHERE cluster_id = ?1", params![id])?;
            let deleted = tx.execute("DELETE FROM clusters WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn ping(&self) -> Result<(), RegistryError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    fn close(&self) -> Result<(), RegistryError> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.take().ok_or(RegistryError::Closed)?;
        conn.close().map_err(|(_, e)| RegistryError::Sqlite(e))?;

        debug!("Registry closed");
        Ok(())
    }
}
