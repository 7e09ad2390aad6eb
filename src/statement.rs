//! Statements accepted by the `slate` shell and their execution against a
//! [`Table`].
//!
//! ```text
//! insert <value> [<value> ...]
//! select [<column>=<value>]
//! update <column>=<value> [where <column>=<value>]
//! ```
//!
//! Values are positional in schema order for `insert`; an `_` stands for a
//! null.
use std::fmt::Write;

use thiserror::Error;

use crate::{
    cli::Command,
    storage::{ClientContext, Record, Schema, StorageError, Table},
};

const NULL: &str = "_";

/// A `column=value` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub column: String,
    pub value: String,
}

impl Assignment {
    fn parse(part: &str) -> Result<Self, StatementError> {
        match part.split_once('=') {
            Some((column, value)) if !column.is_empty() => Ok(Self {
                column: column.to_string(),
                value: value.to_string(),
            }),
            _ => Err(StatementError::Invalid {
                statement: part.to_string(),
                reason: "expected <column>=<value>".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Insert(Vec<String>),
    Select(Option<Assignment>),
    Update {
        set: Assignment,
        filter: Option<Assignment>,
    },
}

#[derive(Error, Debug)]
pub enum StatementError {
    #[error("empty statement")]
    EmptyStatement,

    #[error("statement not supported: {0}")]
    Unsupported(String),

    #[error("invalid statement '{statement}': {reason}")]
    Invalid { statement: String, reason: String },

    #[error("failed to convert into statement")]
    Conversion,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TryFrom<Command> for Statement {
    type Error = StatementError;

    fn try_from(value: Command) -> Result<Self, Self::Error> {
        match value {
            Command::Statement(s) => s.as_str().try_into(),
            _ => Err(StatementError::Conversion),
        }
    }
}

impl TryFrom<&str> for Statement {
    type Error = StatementError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let parts = s.split_whitespace().collect::<Vec<&str>>();
        let Some((kind, args)) = parts.split_first() else {
            return Err(StatementError::EmptyStatement);
        };
        let invalid = |reason: &str| StatementError::Invalid {
            statement: s.to_string(),
            reason: reason.to_string(),
        };

        match kind.to_lowercase().as_str() {
            "insert" => {
                if args.is_empty() {
                    return Err(invalid("insert requires at least one value"));
                }
                Ok(Statement::Insert(
                    args.iter()
                        .map(|v| if *v == NULL { String::new() } else { v.to_string() })
                        .collect(),
                ))
            }
            "select" => match args {
                [] => Ok(Statement::Select(None)),
                [filter] => Ok(Statement::Select(Some(Assignment::parse(filter)?))),
                _ => Err(invalid("select takes at most one <column>=<value> filter")),
            },
            "update" => match args {
                [set] => Ok(Statement::Update {
                    set: Assignment::parse(set)?,
                    filter: None,
                }),
                [set, kw, filter] if kw.eq_ignore_ascii_case("where") => Ok(Statement::Update {
                    set: Assignment::parse(set)?,
                    filter: Some(Assignment::parse(filter)?),
                }),
                _ => Err(invalid(
                    "expected update <column>=<value> [where <column>=<value>]",
                )),
            },
            _ => Err(StatementError::Unsupported(s.to_string())),
        }
    }
}

impl Statement {
    /// Runs the statement in `ctx`'s transaction and renders its result.
    pub fn execute(
        &self,
        table: &Table,
        ctx: &mut ClientContext,
    ) -> Result<String, StatementError> {
        match self {
            Statement::Insert(values) => {
                let (block, slot) = table.add_record(ctx, values)?;
                Ok(format!("inserted into block {block}, slot {slot}"))
            }
            Statement::Select(filter) => {
                let records = match filter {
                    Some(f) => table.get_records(ctx, &f.column, f.value.as_bytes())?,
                    None => table.records(ctx)?,
                };
                Ok(render(table.schema(), &records))
            }
            Statement::Update { set, filter } => {
                let changed = match filter {
                    Some(f) => table.update_where(
                        ctx,
                        &f.column,
                        f.value.as_bytes(),
                        &set.column,
                        set.value.as_bytes(),
                    )?,
                    None => table.update_records(ctx, &set.column, set.value.as_bytes())?,
                };
                Ok(format!("{changed} record(s) updated"))
            }
        }
    }
}

fn render(schema: &Schema, records: &[Record]) -> String {
    let mut out = String::new();
    for record in records {
        let row = record
            .values(schema)
            .into_iter()
            .zip(schema.columns())
            .map(|(value, column)| {
                let value = value.map_or(NULL.into(), String::from_utf8_lossy);
                format!("{}={value}", column.name)
            })
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(out, "{row}");
    }
    let _ = write!(out, "({} row(s))", records.len());
    out
}
