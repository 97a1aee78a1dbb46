//! Filter predicate tree. Top-level filters combine with AND; groups
//! nest arbitrarily. Regex operators compile once at construction.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use heron_common::error::QueryError;
use heron_common::value::{cmp_values, Value};
use heron_data::catalog::{Column, Table};
use heron_data::store::RowRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Equal,
    Unequal,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    RegexMatch,
    RegexNoMatch,
}

impl MatchOp {
    pub(crate) fn as_wire(&self) -> &'static str {
        match self {
            MatchOp::Equal => "=",
            MatchOp::Unequal => "!=",
            MatchOp::Less => "<",
            MatchOp::LessEqual => "<=",
            MatchOp::Greater => ">",
            MatchOp::GreaterEqual => ">=",
            MatchOp::RegexMatch => "~",
            MatchOp::RegexNoMatch => "!~",
        }
    }
}

/// One node of the predicate tree.
#[derive(Debug, Clone)]
pub enum Filter {
    Group {
        op: GroupOp,
        members: Vec<Filter>,
        negate: bool,
    },
    Match {
        column: Arc<Column>,
        op: MatchOp,
        value: Value,
        regex: Option<Regex>,
        negate: bool,
    },
}

impl Filter {
    pub fn group(op: GroupOp, members: Vec<Filter>) -> Filter {
        Filter::Group {
            op,
            members,
            negate: false,
        }
    }

    /// Build a leaf predicate. Regex operators compile their pattern
    /// here so scans never pay compilation per row.
    pub fn new_match(column: Arc<Column>, op: MatchOp, value: Value) -> Result<Filter, QueryError> {
        let regex = match op {
            MatchOp::RegexMatch | MatchOp::RegexNoMatch => Some(
                Regex::new(&value.to_text()).map_err(|e| QueryError::BadRegex(e.to_string()))?,
            ),
            _ => None,
        };
        Ok(Filter::Match {
            column,
            op,
            value,
            regex,
            negate: false,
        })
    }

    pub fn negated(self) -> Filter {
        match self {
            Filter::Group { op, members, negate } => Filter::Group {
                op,
                members,
                negate: !negate,
            },
            Filter::Match {
                column,
                op,
                value,
                regex,
                negate,
            } => Filter::Match {
                column,
                op,
                value,
                regex,
                negate: !negate,
            },
        }
    }

    /// Evaluate the predicate against a row.
    pub fn matches_row(&self, row: &RowRef) -> bool {
        match self {
            Filter::Group { op, members, negate } => {
                let hit = match op {
                    GroupOp::And => members.iter().all(|m| m.matches_row(row)),
                    GroupOp::Or => members.iter().any(|m| m.matches_row(row)),
                };
                hit != *negate
            }
            Filter::Match {
                column,
                op,
                value,
                regex,
                negate,
            } => {
                let cell = row.value(column);
                let hit = match_cell(column, *op, &cell, value, regex.as_ref());
                hit != *negate
            }
        }
    }

    /// Render the node in wire syntax for passthrough forwarding.
    pub fn to_wire(&self, out: &mut String) {
        match self {
            Filter::Group { op, members, negate } => {
                for m in members {
                    m.to_wire(out);
                }
                match op {
                    GroupOp::And => {
                        if members.len() > 1 {
                            out.push_str(&format!("And: {}\n", members.len()));
                        }
                    }
                    GroupOp::Or => out.push_str(&format!("Or: {}\n", members.len())),
                }
                if *negate {
                    out.push_str("Negate:\n");
                }
            }
            Filter::Match {
                column, op, value, negate, ..
            } => {
                out.push_str(&format!(
                    "Filter: {} {} {}\n",
                    column.name,
                    op.as_wire(),
                    value.to_text()
                ));
                if *negate {
                    out.push_str("Negate:\n");
                }
            }
        }
    }
}

fn match_cell(
    column: &Column,
    op: MatchOp,
    cell: &Value,
    rhs: &Value,
    regex: Option<&Regex>,
) -> bool {
    match op {
        MatchOp::RegexMatch => regex.map(|re| re.is_match(&cell.to_text())).unwrap_or(false),
        MatchOp::RegexNoMatch => regex.map(|re| !re.is_match(&cell.to_text())).unwrap_or(false),
        _ if column.kind.is_list() => match_list(op, cell, rhs),
        _ => {
            let ord = cmp_values(column.kind, cell, rhs);
            match op {
                MatchOp::Equal => ord == std::cmp::Ordering::Equal,
                MatchOp::Unequal => ord != std::cmp::Ordering::Equal,
                MatchOp::Less => ord == std::cmp::Ordering::Less,
                MatchOp::LessEqual => ord != std::cmp::Ordering::Greater,
                MatchOp::Greater => ord == std::cmp::Ordering::Greater,
                MatchOp::GreaterEqual => ord != std::cmp::Ordering::Less,
                MatchOp::RegexMatch | MatchOp::RegexNoMatch => false,
            }
        }
    }
}

/// List columns use livestatus membership semantics: `>=` tests
/// membership, `=` with an empty right side tests list emptiness.
fn match_list(op: MatchOp, cell: &Value, rhs: &Value) -> bool {
    let is_empty = match cell {
        Value::StringList(l) => l.is_empty(),
        Value::IntList(l) => l.is_empty(),
        _ => true,
    };
    match op {
        MatchOp::GreaterEqual => cell.contains_entry(rhs),
        MatchOp::Equal => {
            if rhs.to_text().is_empty() {
                is_empty
            } else {
                cell.contains_entry(rhs)
            }
        }
        MatchOp::Unequal => !cell.contains_entry(rhs),
        MatchOp::Less => !cell.contains_entry(rhs),
        _ => false,
    }
}

/// Extract an equality probe on the table's primary column from the
/// top-level AND set, feeding the store's prefilter index. OR groups
/// never qualify.
pub fn pk_equality_probe(filters: &[Filter], table: &Table) -> Option<String> {
    let pk = table.primary_key?;
    for f in filters {
        match f {
            Filter::Match {
                column,
                op: MatchOp::Equal,
                value,
                negate: false,
                ..
            } if column.name == pk => return Some(value.to_text()),
            Filter::Group {
                op: GroupOp::And,
                members,
                negate: false,
            } => {
                if let Some(v) = pk_equality_probe(members, table) {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        self.to_wire(&mut s);
        write!(f, "{}", s.trim_end())
    }
}
