//! Static table and column registry.
//!
//! Tables carry the execution-relevant flags: virtual tables are
//! synthesized by the proxy itself, passthrough-only tables are always
//! forwarded to the remote site, and `works_unlocked` tables skip the
//! per-peer data set read lock.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use heron_common::value::ColumnKind;

/// Known table identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableName {
    Hosts,
    Services,
    Log,
    Sites,
    Tables,
    Columns,
}

impl TableName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::Hosts => "hosts",
            TableName::Services => "services",
            TableName::Log => "log",
            TableName::Sites => "sites",
            TableName::Tables => "tables",
            TableName::Columns => "columns",
        }
    }

    /// The two metadata tables are uniform across peers; queries against
    /// them are answered by the first peer only.
    pub fn is_meta(&self) -> bool {
        matches!(self, TableName::Tables | TableName::Columns)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TableName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hosts" => Ok(TableName::Hosts),
            "services" => Ok(TableName::Services),
            "log" => Ok(TableName::Log),
            "sites" => Ok(TableName::Sites),
            "tables" => Ok(TableName::Tables),
            "columns" => Ok(TableName::Columns),
            other => Err(format!("table {} does not exist", other)),
        }
    }
}

/// Where a column's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnStorage {
    /// Stored in the per-peer data rows.
    Backend,
    /// Computed by the proxy from peer context (peer_key, peer_name).
    Virtual,
}

/// Lock discipline scanners and writers apply towards the owning peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLockMode {
    /// No peer lock needed.
    None,
    /// Values are plain row data; the data set read lock suffices.
    Simple,
    /// Values derive from live peer state; hold the peer row lock for a
    /// whole scan, or per row during serialization.
    Full,
}

/// One column descriptor.
#[derive(Debug)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub storage: ColumnStorage,
    /// Position inside `DataRow::values` for backend columns; unused for
    /// virtual columns.
    pub index: usize,
}

/// One table descriptor with its execution flags.
#[derive(Debug)]
pub struct Table {
    pub name: TableName,
    pub columns: Vec<Arc<Column>>,
    by_name: HashMap<String, Arc<Column>>,
    /// Rows are synthesized by the proxy (sites, tables, columns).
    pub is_virtual: bool,
    /// Queries are forwarded verbatim to each peer (log).
    pub passthrough_only: bool,
    /// Safe to scan without the data set read lock.
    pub works_unlocked: bool,
    pub peer_lock_mode: PeerLockMode,
    /// Column names of the table's natural order; requests sorting by
    /// exactly these ascending hit the no-sort fast path.
    pub default_sort: Vec<&'static str>,
    /// Contact-list column consulted by the auth check.
    pub auth_column: Option<&'static str>,
    /// Equality-indexed column feeding the prefiltered scan.
    pub primary_key: Option<&'static str>,
}

impl Table {
    #[allow(clippy::too_many_arguments)]
    fn new(
        name: TableName,
        specs: Vec<(&str, ColumnKind, ColumnStorage)>,
        is_virtual: bool,
        passthrough_only: bool,
        works_unlocked: bool,
        peer_lock_mode: PeerLockMode,
        default_sort: Vec<&'static str>,
        auth_column: Option<&'static str>,
        primary_key: Option<&'static str>,
    ) -> Arc<Table> {
        let mut columns = Vec::with_capacity(specs.len());
        let mut by_name = HashMap::with_capacity(specs.len());
        let mut data_index = 0;
        for (col_name, kind, storage) in specs {
            let index = match storage {
                ColumnStorage::Backend => {
                    let i = data_index;
                    data_index += 1;
                    i
                }
                ColumnStorage::Virtual => usize::MAX,
            };
            let col = Arc::new(Column {
                name: col_name.to_string(),
                kind,
                storage,
                index,
            });
            by_name.insert(col_name.to_string(), col.clone());
            columns.push(col);
        }
        Arc::new(Table {
            name,
            columns,
            by_name,
            is_virtual,
            passthrough_only,
            works_unlocked,
            peer_lock_mode,
            default_sort,
            auth_column,
            primary_key,
        })
    }

    pub fn column(&self, name: &str) -> Option<Arc<Column>> {
        self.by_name.get(name).cloned()
    }

    /// Number of backend-stored cells per data row.
    pub fn row_width(&self) -> usize {
        self.columns
            .iter()
            .filter(|c| c.storage == ColumnStorage::Backend)
            .count()
    }
}

/// The table registry, iterated in declaration order.
pub struct Catalog {
    tables: HashMap<TableName, Arc<Table>>,
    order: Vec<TableName>,
}

impl Catalog {
    pub fn table(&self, name: TableName) -> Option<Arc<Table>> {
        self.tables.get(&name).cloned()
    }

    pub fn tables_ordered(&self) -> impl Iterator<Item = &Arc<Table>> {
        self.order.iter().filter_map(move |n| self.tables.get(n))
    }
}

impl Default for Catalog {
    fn default() -> Self {
        use ColumnKind::*;
        use ColumnStorage::*;

        let mut tables = HashMap::new();
        let mut order = Vec::new();
        let mut add = |t: Arc<Table>| {
            order.push(t.name);
            tables.insert(t.name, t);
        };

        add(Table::new(
            TableName::Hosts,
            vec![
                ("name", String, Backend),
                ("alias", String, Backend),
                ("address", String, Backend),
                ("state", Int, Backend),
                ("latency", Float, Backend),
                ("contacts", StringList, Backend),
                ("groups", StringList, Backend),
                ("peer_key", String, Virtual),
                ("peer_name", String, Virtual),
            ],
            false,
            false,
            false,
            PeerLockMode::Simple,
            vec!["name"],
            Some("contacts"),
            Some("name"),
        ));

        add(Table::new(
            TableName::Services,
            vec![
                ("host_name", String, Backend),
                ("description", String, Backend),
                ("state", Int, Backend),
                ("latency", Float, Backend),
                ("contacts", StringList, Backend),
                ("groups", StringList, Backend),
                ("peer_key", String, Virtual),
                ("peer_name", String, Virtual),
            ],
            false,
            false,
            false,
            PeerLockMode::Simple,
            vec!["host_name", "description"],
            Some("contacts"),
            Some("host_name"),
        ));

        add(Table::new(
            TableName::Log,
            vec![
                ("time", Int64, Backend),
                ("class", Int, Backend),
                ("state", Int, Backend),
                ("host_name", String, Backend),
                ("service_description", String, Backend),
                ("message", String, Backend),
                ("peer_key", String, Virtual),
                ("peer_name", String, Virtual),
            ],
            false,
            true,
            false,
            PeerLockMode::Simple,
            vec![],
            None,
            None,
        ));

        add(Table::new(
            TableName::Sites,
            vec![
                ("name", String, Backend),
                ("addr", String, Backend),
                ("status", Int, Backend),
                ("last_error", String, Backend),
                ("idling", Int, Backend),
            ],
            true,
            false,
            true,
            PeerLockMode::Full,
            vec!["name"],
            None,
            None,
        ));

        add(Table::new(
            TableName::Tables,
            vec![("name", String, Backend)],
            true,
            false,
            true,
            PeerLockMode::None,
            vec!["name"],
            None,
            None,
        ));

        add(Table::new(
            TableName::Columns,
            vec![
                ("table", String, Backend),
                ("name", String, Backend),
                ("type", String, Backend),
            ],
            true,
            false,
            true,
            PeerLockMode::None,
            vec!["table", "name"],
            None,
            None,
        ));

        Catalog { tables, order }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_has_all_tables() {
        let cat = Catalog::default();
        for name in ["hosts", "services", "log", "sites", "tables", "columns"] {
            let t: TableName = name.parse().unwrap();
            assert!(cat.table(t).is_some(), "missing table {}", name);
        }
        assert!("nope".parse::<TableName>().is_err());
    }

    #[test]
    fn test_backend_indexes_are_dense() {
        let cat = Catalog::default();
        let hosts = cat.table(TableName::Hosts).unwrap();
        let backend: Vec<usize> = hosts
            .columns
            .iter()
            .filter(|c| c.storage == ColumnStorage::Backend)
            .map(|c| c.index)
            .collect();
        assert_eq!(backend, (0..backend.len()).collect::<Vec<_>>());
        assert_eq!(hosts.row_width(), backend.len());
    }

    #[test]
    fn test_table_flags() {
        let cat = Catalog::default();
        assert!(cat.table(TableName::Log).unwrap().passthrough_only);
        assert!(cat.table(TableName::Sites).unwrap().is_virtual);
        assert!(cat.table(TableName::Sites).unwrap().works_unlocked);
        assert!(!cat.table(TableName::Hosts).unwrap().works_unlocked);
        assert!(TableName::Tables.is_meta());
        assert!(TableName::Columns.is_meta());
        assert!(!TableName::Hosts.is_meta());
    }

    #[test]
    fn test_catalog_order_is_stable() {
        let cat = Catalog::default();
        let names: Vec<&str> = cat.tables_ordered().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["hosts", "services", "log", "sites", "tables", "columns"]
        );
    }
}
