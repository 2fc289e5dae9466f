use std::collections::{HashMap, HashSet};

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertOffice {
        name: String,
        location: String,
    },
    InsertRoom {
        office_id: Ulid,
        name: String,
        capacity: Option<u32>,
    },
    InsertBooking {
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
    UpdateOffice {
        id: Ulid,
        name: String,
        location: String,
    },
    UpdateRoom {
        id: Ulid,
        office_id: Ulid,
        name: String,
        capacity: Option<u32>,
    },
    UpdateBooking {
        id: Ulid,
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
    DeleteOffice {
        id: Ulid,
    },
    DeleteRoom {
        id: Ulid,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectOffices {
        id: Option<Ulid>,
        filter: OfficeFilter,
        page: PageRequest,
    },
    SelectRooms {
        id: Option<Ulid>,
        filter: RoomFilter,
        page: PageRequest,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
        page: PageRequest,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
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
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "offices" => {
            let mut row = insert_row(insert, &["name", "location"])?;
            Ok(Command::InsertOffice {
                name: parse_string(&take(&mut row, "name")?)?,
                location: match row.remove("location") {
                    Some(expr) => parse_string(&expr)?,
                    None => String::new(),
                },
            })
        }
        "rooms" => {
            let mut row = insert_row(insert, &["office_id", "name", "capacity"])?;
            Ok(Command::InsertRoom {
                office_id: parse_ulid_expr(&take(&mut row, "office_id")?)?,
                name: parse_string(&take(&mut row, "name")?)?,
                capacity: match row.remove("capacity") {
                    Some(expr) => parse_u32_or_null(&expr)?,
                    None => None,
                },
            })
        }
        "bookings" => {
            let mut row = insert_row(insert, &["room_id", "start_time", "end_time"])?;
            Ok(Command::InsertBooking {
                room_id: parse_ulid_expr(&take(&mut row, "room_id")?)?,
                start: parse_i64_expr(&take(&mut row, "start_time")?)?,
                end: parse_i64_expr(&take(&mut row, "end_time")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Every mutable field must be assigned: updates replace the whole record.
fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut set: HashMap<String, Expr> = HashMap::new();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        if set.insert(column.clone(), assignment.value.clone()).is_some() {
            return Err(SqlError::DuplicateColumn(column));
        }
    }

    let cmd = match table.as_str() {
        "offices" => Command::UpdateOffice {
            id,
            name: parse_string(&take_assigned(&mut set, "name")?)?,
            location: parse_string(&take_assigned(&mut set, "location")?)?,
        },
        "rooms" => Command::UpdateRoom {
            id,
            office_id: parse_ulid_expr(&take_assigned(&mut set, "office_id")?)?,
            name: parse_string(&take_assigned(&mut set, "name")?)?,
            capacity: parse_u32_or_null(&take_assigned(&mut set, "capacity")?)?,
        },
        "bookings" => Command::UpdateBooking {
            id,
            room_id: parse_ulid_expr(&take_assigned(&mut set, "room_id")?)?,
            start: parse_i64_expr(&take_assigned(&mut set, "start_time")?)?,
            end: parse_i64_expr(&take_assigned(&mut set, "end_time")?)?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    if let Some(column) = set.into_keys().next() {
        return Err(SqlError::UnknownColumn(column));
    }
    Ok(cmd)
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "offices" => Ok(Command::DeleteOffice { id }),
        "rooms" => Ok(Command::DeleteRoom { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut predicates = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut predicates)?;
    }
    let mut seen = HashSet::new();
    for (column, _, _) in &predicates {
        if !seen.insert(column.as_str()) {
            return Err(SqlError::DuplicateColumn(column.clone()));
        }
    }

    match table.as_str() {
        "offices" => {
            let mut id = None;
            let mut filter = OfficeFilter::default();
            for (column, cmp, value) in predicates {
                match (column.as_str(), cmp) {
                    ("id", Cmp::Eq) => id = Some(parse_ulid_expr(value)?),
                    ("location", Cmp::ILike) => filter.location = Some(parse_contains_pattern(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::SelectOffices {
                id,
                filter,
                page: extract_page(query)?,
            })
        }
        "rooms" => {
            let mut id = None;
            let mut filter = RoomFilter::default();
            for (column, cmp, value) in predicates {
                match (column.as_str(), cmp) {
                    ("id", Cmp::Eq) => id = Some(parse_ulid_expr(value)?),
                    ("office_id", Cmp::Eq) => filter.office_id = Some(parse_ulid_expr(value)?),
                    ("capacity", Cmp::Eq) => filter.capacity = Some(parse_u32(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::SelectRooms {
                id,
                filter,
                page: extract_page(query)?,
            })
        }
        "bookings" => {
            let mut id = None;
            let mut filter = BookingFilter::default();
            for (column, cmp, value) in predicates {
                match (column.as_str(), cmp) {
                    ("id", Cmp::Eq) => id = Some(parse_ulid_expr(value)?),
                    ("room_id", Cmp::Eq) => filter.room_id = Some(parse_ulid_expr(value)?),
                    ("user_id", Cmp::Eq) => filter.user_id = Some(CallerId::new(parse_string(value)?)),
                    ("start_time", Cmp::GtEq) => filter.start_from = Some(parse_i64_expr(value)?),
                    ("end_time", Cmp::LtEq) => filter.end_until = Some(parse_i64_expr(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            match id {
                Some(id) if filter == BookingFilter::default() => Ok(Command::SelectBooking { id }),
                Some(_) => Err(SqlError::Unsupported("id combined with other filters".into())),
                None => Ok(Command::SelectBookings {
                    filter,
                    page: extract_page(query)?,
                }),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Comparison in a WHERE conjunct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    GtEq,
    LtEq,
    ILike,
    Other,
}

impl From<&ast::BinaryOperator> for Cmp {
    fn from(op: &ast::BinaryOperator) -> Self {
        match op {
            ast::BinaryOperator::Eq => Cmp::Eq,
            ast::BinaryOperator::GtEq => Cmp::GtEq,
            ast::BinaryOperator::LtEq => Cmp::LtEq,
            _ => Cmp::Other,
        }
    }
}

/// Flatten a conjunction of `column <op> value` comparisons.
fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<(String, Cmp, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push((column, Cmp::from(op), right));
            Ok(())
        }
        Expr::ILike {
            negated: false,
            expr: left,
            pattern,
            ..
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push((column, Cmp::ILike, pattern));
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("predicate {expr}"))),
    }
}

/// `ILIKE '%text%'` as a plain substring. Wildcards are only allowed at the ends.
fn parse_contains_pattern(expr: &Expr) -> Result<String, SqlError> {
    let pattern = parse_string(expr)?;
    let needle = pattern.trim_matches('%');
    if needle.contains(['%', '_']) {
        return Err(SqlError::Unsupported(format!("ILIKE pattern {pattern:?}")));
    }
    Ok(needle.to_string())
}

fn extract_page(query: &ast::Query) -> Result<PageRequest, SqlError> {
    let mut page = PageRequest::default();
    match &query.limit_clause {
        None => {}
        Some(LimitClause::LimitOffset { limit, offset, .. }) => {
            if let Some(limit) = limit {
                page.limit = parse_usize(limit)?;
            }
            if let Some(offset) = offset {
                page.offset = parse_usize(&offset.value)?;
            }
        }
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => {
            page.offset = parse_usize(offset)?;
            page.limit = parse_usize(limit)?;
        }
    }
    Ok(page)
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
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

/// The single VALUES row of an INSERT keyed by column name. Without an
/// explicit column list, values are taken in `default_columns` order.
fn insert_row(insert: &ast::Insert, default_columns: &[&str]) -> Result<HashMap<String, Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match rows.as_slice() {
        [row] => row,
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let arity_ok = if insert.columns.is_empty() {
        row.len() <= columns.len()
    } else {
        row.len() == columns.len()
    };
    if !arity_ok {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    for column in &columns {
        if !default_columns.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(column.clone()));
        }
    }
    Ok(columns.into_iter().zip(row.iter().cloned()).collect())
}

fn take(row: &mut HashMap<String, Expr>, column: &'static str) -> Result<Expr, SqlError> {
    row.remove(column).ok_or(SqlError::MissingColumn(column))
}

fn take_assigned(set: &mut HashMap<String, Expr>, column: &'static str) -> Result<Expr, SqlError> {
    set.remove(column).ok_or(SqlError::MissingAssignment(column))
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Numbers arrive either as literals or, from bound parameters, as quoted text.
fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_u32(expr)?)),
    }
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64_expr(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is negative")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingAssignment(&'static str),
    MissingFilter(&'static str),
    DuplicateColumn(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing value for column: {col}"),
            SqlError::MissingAssignment(col) => write!(f, "UPDATE must set {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::DuplicateColumn(col) => write!(f, "column given more than once: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
