//! The frozen query record handed to the pipeline by the parser
//! collaborator. Construction resolves column names against the
//! catalog; an empty column list means "all columns".

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use heron_common::error::QueryError;
use heron_data::catalog::{Catalog, Column, Table, TableName};
use heron_data::peer::PeerMap;

use crate::filter::Filter;
use crate::stats::{StatsKind, StatsSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    WrappedJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One sort field. `group` marks a sort over a stats group key; for
/// passthrough queries `column` overrides the request-column lookup
/// when the sort refers to a column outside the requested set.
#[derive(Debug, Clone)]
pub struct SortField {
    pub index: usize,
    pub direction: SortDirection,
    pub group: bool,
    pub column: Option<Arc<Column>>,
}

impl SortField {
    pub fn new(index: usize, direction: SortDirection) -> Self {
        Self {
            index,
            direction,
            group: false,
            column: None,
        }
    }

    pub fn group_key(index: usize) -> Self {
        Self {
            index,
            direction: SortDirection::Asc,
            group: true,
            column: None,
        }
    }
}

/// The parsed query, frozen for the lifetime of the request.
#[derive(Debug)]
pub struct Request {
    pub table: TableName,
    pub table_def: Arc<Table>,
    /// Raw column names as requested; empty means all columns.
    pub columns: Vec<String>,
    /// Resolved column descriptors the result rows align with.
    pub request_columns: Vec<Arc<Column>>,
    /// Top-level predicates, combined with AND.
    pub filter: Vec<Filter>,
    pub stats: Vec<StatsSpec>,
    /// Alternate predicate set used for counting when present.
    pub stats_grouped: Option<Vec<StatsSpec>>,
    pub sort: Vec<SortField>,
    pub limit: Option<usize>,
    pub offset: usize,
    /// User-selected backend subset; empty means all.
    pub backends: Vec<String>,
    pub backends_map: HashSet<String>,
    /// Unknown backend ids collected during expansion, seeded into the
    /// response's failed map.
    pub backend_errors: HashMap<String, String>,
    pub wait_trigger: Option<String>,
    pub output_format: OutputFormat,
    pub response_fixed16: bool,
    pub columns_headers: bool,
    pub auth_user: Option<String>,
    /// Emit raw [value, count] pairs instead of finalized stats.
    pub send_stats_data: bool,
}

impl Request {
    pub fn new(catalog: &Catalog, table: TableName, columns: &[&str]) -> Result<Self, QueryError> {
        let table_def = catalog
            .table(table)
            .ok_or_else(|| QueryError::UnknownTable(table.as_str().to_string()))?;

        let request_columns = if columns.is_empty() {
            table_def.columns.clone()
        } else {
            columns
                .iter()
                .map(|name| {
                    table_def.column(name).ok_or_else(|| QueryError::UnknownColumn {
                        table: table.as_str().to_string(),
                        column: (*name).to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            table,
            table_def,
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            request_columns,
            filter: Vec::new(),
            stats: Vec::new(),
            stats_grouped: None,
            sort: Vec::new(),
            limit: None,
            offset: 0,
            backends: Vec::new(),
            backends_map: HashSet::new(),
            backend_errors: HashMap::new(),
            wait_trigger: None,
            output_format: OutputFormat::Json,
            response_fixed16: false,
            columns_headers: false,
            auth_user: None,
            send_stats_data: false,
        })
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter.push(filter);
        self
    }

    pub fn with_stats(mut self, spec: StatsSpec) -> Self {
        self.stats.push(spec);
        self
    }

    /// Sort by one of the requested columns.
    pub fn with_sort(mut self, column: &str, direction: SortDirection) -> Self {
        if let Some(index) = self
            .request_columns
            .iter()
            .position(|c| c.name == column)
        {
            self.sort.push(SortField::new(index, direction));
        } else if let Some(col) = self.table_def.column(column) {
            let mut field = SortField::new(self.request_columns.len(), direction);
            field.column = Some(col);
            self.sort.push(field);
        }
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_backends(mut self, backends: &[&str]) -> Self {
        self.backends = backends.iter().map(|b| (*b).to_string()).collect();
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_fixed16(mut self) -> Self {
        self.response_fixed16 = true;
        self
    }

    pub fn with_auth_user(mut self, user: &str) -> Self {
        self.auth_user = Some(user.to_string());
        self
    }

    /// Columns the stats group key is built from. A stats query without
    /// an explicit column list groups everything into one bucket.
    pub fn stats_columns(&self) -> &[Arc<Column>] {
        if self.columns.is_empty() {
            &[]
        } else {
            &self.request_columns
        }
    }

    /// Resolve the user's backend list against the peer registry. No
    /// backends selected means all backends; unknown ids become
    /// per-backend errors instead of failing the request.
    pub fn expand_requested_backends(&mut self, peers: &PeerMap) {
        self.backends_map.clear();
        self.backend_errors.clear();

        if self.backends.is_empty() {
            self.backends_map.extend(peers.ids());
            return;
        }
        for b in &self.backends {
            if peers.contains(b) {
                self.backends_map.insert(b.clone());
            } else {
                self.backend_errors.insert(
                    b.clone(),
                    format!("bad request: backend {} does not exist", b),
                );
            }
        }
    }

    /// True when the requested order matches the table's natural order
    /// (all ascending, non-group, same columns). An empty sort is the
    /// default order by definition.
    pub fn is_default_sort_order(&self) -> bool {
        if self.sort.is_empty() {
            return true;
        }
        let default = &self.table_def.default_sort;
        if default.is_empty() || self.sort.len() != default.len() {
            return false;
        }
        self.sort.iter().zip(default.iter()).all(|(s, want)| {
            if s.group || s.direction != SortDirection::Asc {
                return false;
            }
            let name = s
                .column
                .as_ref()
                .map(|c| c.name.as_str())
                .or_else(|| self.request_columns.get(s.index).map(|c| c.name.as_str()));
            name == Some(*want)
        })
    }

    /// Limit-pushdown heuristic: with no sort (or the default order)
    /// each scan only needs `offset + limit` rows. Any other sort needs
    /// the full candidate set, so scans run unbounded.
    pub fn optimize_result_limit(&self) -> Option<usize> {
        let limit = self.limit?;
        if self.sort.is_empty() || self.is_default_sort_order() {
            Some(limit + self.offset)
        } else {
            None
        }
    }

    /// Render the query in wire syntax with an explicit column list, as
    /// forwarded to a remote site by the passthrough executor.
    pub fn to_wire_with_columns(&self, columns: &[String]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "GET {}", self.table.as_str());
        if !columns.is_empty() {
            let _ = writeln!(out, "Columns: {}", columns.join(" "));
        }
        for f in &self.filter {
            f.to_wire(&mut out);
        }
        for s in &self.stats {
            render_stats_wire(&mut out, s);
        }
        if let Some(limit) = self.limit {
            let _ = writeln!(out, "Limit: {}", limit);
        }
        if let Some(user) = &self.auth_user {
            let _ = writeln!(out, "AuthUser: {}", user);
        }
        out.push_str("OutputFormat: json\nResponseHeader: fixed16\n\n");
        out
    }

    pub fn to_wire(&self) -> String {
        self.to_wire_with_columns(&self.columns)
    }
}

fn render_stats_wire(out: &mut String, spec: &StatsSpec) {
    match spec.kind {
        StatsKind::Counter => {
            if let Some(Filter::Match { column, op, value, .. }) = &spec.filter {
                let _ = writeln!(
                    out,
                    "Stats: {} {} {}",
                    column.name,
                    op.as_wire(),
                    value.to_text()
                );
            }
        }
        kind => {
            let verb = match kind {
                StatsKind::Sum => "sum",
                StatsKind::Min => "min",
                StatsKind::Max => "max",
                StatsKind::Average => "avg",
                StatsKind::Counter => unreachable!(),
            };
            if let Some(col) = &spec.column {
                let _ = writeln!(out, "Stats: {} {}", verb, col.name);
            }
        }
    }
}
