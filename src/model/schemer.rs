//! Schema propagation.
//!
//! New replicas copy the replicated tables of their cluster, every host of a
//! cluster carries the same distributed tables, and a removed replica drops
//! its replicated tables so its coordination metadata goes away with it.
//! Source rows are read from `cluster('<name>', system.tables)` on the first
//! peer that answers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::client::clickhouse::{Rows, SqlClient, SqlError};
use crate::model::namer;
use crate::model::topology::{Cluster, Host, NormalizedChi, Shard};

/// Object names and the statements that create or drop them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaObjects {
    pub names: Vec<String>,
    pub sqls: Vec<String>,
}

impl SchemaObjects {
    pub fn is_empty(&self) -> bool {
        self.sqls.is_empty()
    }

    fn extend(&mut self, rows: Rows) {
        for row in rows {
            if let [name, sql, ..] = row.as_slice() {
                self.names.push(name.clone());
                self.sqls.push(sql.clone());
            }
        }
    }
}

/// Escape a value for a single-quoted SQL string literal.
fn quote_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn replicated_databases_sql(cluster: &str) -> String {
    let cluster = quote_literal(cluster);
    format!(
        "SELECT DISTINCT database AS name, \
         concat('CREATE DATABASE IF NOT EXISTS \"', name, '\"') AS create_db_query \
         FROM cluster('{cluster}', system.tables) \
         WHERE database != 'system' AND engine LIKE 'Replicated%' \
         SETTINGS skip_unavailable_shards = 1"
    )
}

fn replicated_tables_sql(cluster: &str) -> String {
    let cluster = quote_literal(cluster);
    format!(
        "SELECT DISTINCT name, \
         replaceRegexpOne(create_table_query, 'CREATE (TABLE|VIEW|MATERIALIZED VIEW)', 'CREATE \\\\1 IF NOT EXISTS') \
         FROM cluster('{cluster}', system.tables) \
         WHERE database != 'system' AND create_table_query != '' \
         AND name NOT LIKE '.inner.%' AND engine LIKE 'Replicated%' \
         SETTINGS skip_unavailable_shards = 1"
    )
}

fn distributed_databases_sql(cluster: &str) -> String {
    let cluster = quote_literal(cluster);
    format!(
        "SELECT DISTINCT database AS name, \
         concat('CREATE DATABASE IF NOT EXISTS \"', name, '\"') AS create_db_query \
         FROM cluster('{cluster}', system.tables) \
         WHERE database != 'system' AND engine = 'Distributed' \
         SETTINGS skip_unavailable_shards = 1"
    )
}

fn distributed_tables_sql(cluster: &str) -> String {
    let cluster = quote_literal(cluster);
    format!(
        "SELECT DISTINCT name, \
         replaceRegexpOne(create_table_query, 'CREATE (TABLE|VIEW|MATERIALIZED VIEW)', 'CREATE \\\\1 IF NOT EXISTS') \
         FROM cluster('{cluster}', system.tables) \
         WHERE database != 'system' AND create_table_query != '' \
         AND name NOT LIKE '.inner.%' AND engine = 'Distributed' \
         SETTINGS skip_unavailable_shards = 1"
    )
}

const HOST_DROP_TABLES_SQL: &str = "SELECT DISTINCT name, \
     concat('DROP TABLE IF EXISTS \"', database, '\".\"', name, '\"') \
     FROM system.tables \
     WHERE database != 'system' AND engine LIKE 'Replicated%'";

pub struct Schemer {
    client: Arc<dyn SqlClient>,
    timeout: Duration,
}

impl Schemer {
    pub fn new(client: Arc<dyn SqlClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Run a query on the first host that answers.
    async fn query_any(&self, hosts: &[String], sql: &str) -> Result<Rows, SqlError> {
        let mut last_error = None;
        for host in hosts {
            match self.client.query(host, sql, self.timeout).await {
                Ok(rows) => return Ok(rows),
                Err(e) => {
                    debug!(host = %host, error = %e, "Schema source unavailable, trying next host");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(Vec::new()),
        }
    }

    /// Drop cached address resolutions on the hosts of one cluster.
    pub async fn cluster_drop_dns_cache(&self, cluster: &Cluster) -> Vec<SqlError> {
        self.client
            .invalidate_address_cache(&cluster.pod_fqdns(), self.timeout)
            .await
    }

    /// Databases and replicated tables `host` needs to join its shard.
    pub async fn replicated_objects(
        &self,
        cluster: &Cluster,
        host: &Host,
    ) -> Result<SchemaObjects, SqlError> {
        let name = &cluster.address.cluster_name;
        let hosts: Vec<String> = cluster
            .hosts_peer_first(host)
            .into_iter()
            .map(|h| namer::host_fqdn(&h.address))
            .collect();
        let mut objects = SchemaObjects::default();
        objects.extend(self.query_any(&hosts, &replicated_databases_sql(name)).await?);
        objects.extend(self.query_any(&hosts, &replicated_tables_sql(name)).await?);
        Ok(objects)
    }

    /// Databases and distributed tables of a cluster.
    pub async fn distributed_objects(&self, cluster: &Cluster) -> Result<SchemaObjects, SqlError> {
        let name = &cluster.address.cluster_name;
        let hosts = cluster.pod_fqdns();
        let mut objects = SchemaObjects::default();
        objects.extend(self.query_any(&hosts, &distributed_databases_sql(name)).await?);
        objects.extend(self.query_any(&hosts, &distributed_tables_sql(name)).await?);
        Ok(objects)
    }

    /// Drop statements for the replicated tables on `host` itself.
    pub async fn host_drop_tables(&self, host: &Host) -> Result<SchemaObjects, SqlError> {
        let fqdn = namer::host_fqdn(&host.address);
        let mut objects = SchemaObjects::default();
        objects.extend(self.client.query(&fqdn, HOST_DROP_TABLES_SQL, self.timeout).await?);
        Ok(objects)
    }

    /// Apply statements in order on one host.
    ///
    /// With `stop_on_error` the first failure aborts the rest and is returned.
    /// Otherwise every statement is attempted and the last failure returned.
    pub async fn host_apply_sqls(
        &self,
        host: &Host,
        sqls: &[String],
        stop_on_error: bool,
    ) -> Result<(), SqlError> {
        let fqdn = namer::host_fqdn(&host.address);
        let mut last_error = None;
        for sql in sqls {
            if let Err(e) = self.client.execute(&fqdn, sql, self.timeout).await {
                if stop_on_error {
                    return Err(e);
                }
                warn!(host = %fqdn, error = %e, "Statement failed, continuing");
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Apply statements on every host of a shard.
    pub async fn shard_apply_sqls(
        &self,
        shard: &Shard,
        sqls: &[String],
        stop_on_error: bool,
    ) -> Result<(), SqlError> {
        let mut last_error = None;
        for host in &shard.hosts {
            if let Err(e) = self.host_apply_sqls(host, sqls, stop_on_error).await {
                if stop_on_error {
                    return Err(e);
                }
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ask every host of an installation to forget cached addresses.
    pub async fn chi_drop_dns_cache(&self, chi: &NormalizedChi) -> Vec<SqlError> {
        self.client
            .invalidate_address_cache(&chi.pod_fqdns(), self.timeout)
            .await
    }
}
