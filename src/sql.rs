use chrono::{DateTime, NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SelectItem, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which reservations a `SELECT` asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationFilter {
    /// Start in `[from, to)`.
    Range { from: Ms, to: Ms },
    /// The Monday-to-Monday week containing the instant.
    Week(Ms),
    Id(Ulid),
    Owner(String),
}

/// Parsed command from SQL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    InsertReservation {
        id: Option<Ulid>,
        start: Ms,
        end: Ms,
        returning: bool,
    },
    /// A missing bound keeps the stored value.
    UpdateReservation {
        id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectProfiles {
        id: Option<String>,
    },
    UpdateProfile {
        id: String,
        patch: ProfilePatch,
    },
    SelectAdmins,
    InsertAdmin {
        id: String,
    },
    DeleteAdmin {
        id: String,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("bad timestamp: {0}")]
    BadTimestamp(String),
}

/// Strip a leading keyword (case-insensitive) and return the rest.
fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    (head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace))
        .then(|| rest.trim().trim_end_matches(';').trim())
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(channel) = strip_keyword(trimmed, "LISTEN") {
        return Ok(Command::Listen {
            channel: channel.to_string(),
        });
    }
    if let Some(channel) = strip_keyword(trimmed, "UNLISTEN") {
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten {
            channel: channel.to_string(),
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();
    if !columns.is_empty() && columns.len() != values.len() {
        return Err(SqlError::WrongArity("INSERT", columns.len(), values.len()));
    }

    match table.as_str() {
        "reservations" => {
            let columns = if columns.is_empty() {
                match values.len() {
                    2 => vec!["start".to_string(), "end".to_string()],
                    3 => vec!["id".to_string(), "start".to_string(), "end".to_string()],
                    n => return Err(SqlError::WrongArity("reservations", 2, n)),
                }
            } else {
                columns
            };

            let (mut id, mut start, mut end) = (None, None, None);
            for (column, value) in columns.iter().zip(&values) {
                match column.as_str() {
                    "id" => id = Some(parse_ulid_expr(value)?),
                    "start" | "starts_at" => start = Some(parse_timestamp_expr(value)?),
                    "end" | "ends_at" => end = Some(parse_timestamp_expr(value)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::InsertReservation {
                id,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                returning: insert.returning.as_ref().is_some_and(|r| !r.is_empty()),
            })
        }
        "admins" => {
            if values.len() != 1 {
                return Err(SqlError::WrongArity("admins", 1, values.len()));
            }
            if let Some(column) = columns.first().filter(|c| *c != "id") {
                return Err(SqlError::UnknownColumn(column.clone()));
            }
            Ok(Command::InsertAdmin {
                id: parse_string_expr(&values[0])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(table)?;
    match table.as_str() {
        "reservations" => {
            let id = parse_ulid_expr(where_eq(selection, "id")?)?;
            let (mut start, mut end) = (None, None);
            for assignment in assignments {
                let value = &assignment.value;
                match assignment_column(&assignment.target)?.as_str() {
                    "start" | "starts_at" => start = Some(parse_timestamp_expr(value)?),
                    "end" | "ends_at" => end = Some(parse_timestamp_expr(value)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            if start.is_none() && end.is_none() {
                return Err(SqlError::Parse("nothing to update".into()));
            }
            Ok(Command::UpdateReservation { id, start, end })
        }
        "profiles" => {
            let id = parse_string_expr(where_eq(selection, "id")?)?;
            let mut patch = ProfilePatch::default();
            for assignment in assignments {
                let value = parse_string_or_null(&assignment.value)?;
                match assignment_column(&assignment.target)?.as_str() {
                    "display_name" | "name" => patch.display_name = Some(value),
                    "color" => patch.color = Some(value),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            if patch.is_empty() {
                return Err(SqlError::Parse("nothing to update".into()));
            }
            Ok(Command::UpdateProfile { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn assignment_column(target: &AssignmentTarget) -> Result<String, SqlError> {
    match target {
        AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        AssignmentTarget::Tuple(_) => Err(SqlError::Unsupported("tuple assignment".into())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = where_eq(&delete.selection, "id")?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation {
            id: parse_ulid_expr(id)?,
        }),
        "admins" => Ok(Command::DeleteAdmin {
            id: parse_string_expr(id)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    if !select
        .projection
        .iter()
        .all(|item| matches!(item, SelectItem::Wildcard(_)))
    {
        return Err(SqlError::Unsupported("only SELECT * is supported".into()));
    }

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    match table.as_str() {
        "reservations" => {
            let mut filters = SelectFilters::default();
            if let Some(selection) = &select.selection {
                filters.collect(selection)?;
            }
            Ok(Command::SelectReservations {
                filter: filters.into_filter()?,
            })
        }
        "profiles" => {
            let id = match &select.selection {
                None => None,
                Some(_) => Some(parse_string_expr(where_eq(&select.selection, "id")?)?),
            };
            Ok(Command::SelectProfiles { id })
        }
        "admins" => Ok(Command::SelectAdmins),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct SelectFilters {
    from: Option<Ms>,
    to: Option<Ms>,
    week: Option<Ms>,
    id: Option<Ulid>,
    owner: Option<String>,
}

impl SelectFilters {
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        use ast::BinaryOperator::*;
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op: And, right } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp { left, op, right } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                match (column.as_str(), op) {
                    ("start" | "starts_at", GtEq) => self.from = Some(parse_timestamp_expr(right)?),
                    ("start" | "starts_at", Gt) => {
                        self.from = Some(parse_timestamp_expr(right)?.saturating_add(1))
                    }
                    ("start" | "starts_at", Lt) => self.to = Some(parse_timestamp_expr(right)?),
                    ("start" | "starts_at", LtEq) => {
                        self.to = Some(parse_timestamp_expr(right)?.saturating_add(1))
                    }
                    ("week", Eq) => self.week = Some(parse_timestamp_expr(right)?),
                    ("id", Eq) => self.id = Some(parse_ulid_expr(right)?),
                    ("owner_id", Eq) => self.owner = Some(parse_string_expr(right)?),
                    _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
                }
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
        }
    }

    fn into_filter(self) -> Result<ReservationFilter, SqlError> {
        if let Some(id) = self.id {
            return Ok(ReservationFilter::Id(id));
        }
        if let Some(owner) = self.owner {
            return Ok(ReservationFilter::Owner(owner));
        }
        if let Some(week) = self.week {
            return Ok(ReservationFilter::Week(week));
        }
        match (self.from, self.to) {
            (Some(from), Some(to)) => Ok(ReservationFilter::Range { from, to }),
            (None, _) => Err(SqlError::MissingFilter("start >=")),
            (_, None) => Err(SqlError::MissingFilter("start <")),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// The right-hand side of `WHERE <column> = <value>`.
fn where_eq<'a>(selection: &'a Option<Expr>, column: &'static str) -> Result<&'a Expr, SqlError> {
    let mut sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    while let Expr::Nested(inner) = sel {
        sel = inner;
    }
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => Ok(right),
        _ => Err(SqlError::MissingFilter(column)),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        Expr::Nested(inner) => extract_value(inner),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr: inner,
    } = expr
    {
        let value = parse_timestamp_expr(inner)?;
        return value
            .checked_neg()
            .ok_or_else(|| SqlError::BadTimestamp(expr.to_string()));
    }
    match extract_value(expr) {
        Some(Value::Number(n, _)) => n
            .parse()
            .map_err(|_| SqlError::BadTimestamp(n.clone())),
        Some(Value::SingleQuotedString(s)) => parse_timestamp(s),
        Some(other) => Err(SqlError::BadTimestamp(other.to_string())),
        None => Err(SqlError::BadTimestamp(expr.to_string())),
    }
}

/// Unix milliseconds, RFC 3339, or a zone-less date/datetime taken as UTC.
pub fn parse_timestamp(text: &str) -> Result<Ms, SqlError> {
    let text = text.trim();
    if let Ok(ms) = text.parse::<Ms>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
        .ok_or_else(|| SqlError::BadTimestamp(text.to_string()))
}
