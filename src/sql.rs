use std::collections::HashMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, TableWithJoins, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::RoomUpdate;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        name: String,
        role: Role,
    },
    DeleteUser {
        id: Ulid,
    },
    SelectUsers,
    InsertRoom {
        id: Ulid,
        name: String,
        capacity: u32,
        location: Option<String>,
        amenities: Vec<String>,
    },
    /// `maintenance` is set when the statement assigns `status`.
    UpdateRoom {
        id: Ulid,
        update: RoomUpdate,
        maintenance: Option<bool>,
    },
    DeleteRoom {
        id: Ulid,
    },
    SelectRooms {
        id: Option<Ulid>,
    },
    SelectAvailableRooms {
        start: Ms,
        end: Ms,
    },
    SelectRoomStatus {
        room_id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        room_id: Ulid,
        start: Ms,
        end: Ms,
        purpose: String,
        participants: Vec<Ulid>,
    },
    UpdateBooking {
        id: Ulid,
        status: Option<BookingStatus>,
        start: Option<Ms>,
        end: Option<Ms>,
        purpose: Option<String>,
        participants: Option<Vec<Ulid>>,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        id: Option<Ulid>,
        room_id: Option<Ulid>,
        user_id: Option<Ulid>,
    },
    SelectUserOverlaps {
        user_id: Option<Ulid>,
        start: Ms,
        end: Ms,
    },
    SelectSchedule {
        room_id: Ulid,
        start: Ms,
        end: Ms,
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
        } => parse_update(table, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "users" => {
            let row = insert_row(insert, &["id", "name", "role"], 2)?;
            let role = match row.get("role") {
                Some(expr) => match parse_string_or_null(expr)? {
                    Some(s) => Role::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad role: {s}")))?,
                    None => Role::User,
                },
                None => Role::User,
            };
            Ok(Command::InsertUser {
                id: parse_ulid_expr(required(&row, "id")?)?,
                name: parse_string(required(&row, "name")?)?,
                role,
            })
        }
        "rooms" => {
            let row = insert_row(insert, &["id", "name", "capacity", "location", "amenities"], 3)?;
            Ok(Command::InsertRoom {
                id: parse_ulid_expr(required(&row, "id")?)?,
                name: parse_string(required(&row, "name")?)?,
                capacity: parse_u32(required(&row, "capacity")?)?,
                location: optional(&row, "location", parse_string_or_null)?.flatten(),
                amenities: optional(&row, "amenities", parse_string_list)?.unwrap_or_default(),
            })
        }
        "bookings" => {
            let row = insert_row(
                insert,
                &["id", "room_id", "start", "end", "purpose", "participants"],
                4,
            )?;
            Ok(Command::InsertBooking {
                id: parse_ulid_expr(required(&row, "id")?)?,
                room_id: parse_ulid_expr(required(&row, "room_id")?)?,
                start: parse_i64_expr(required(&row, "start")?)?,
                end: parse_i64_expr(required(&row, "end")?)?,
                purpose: optional(&row, "purpose", parse_string_or_null)?
                    .flatten()
                    .unwrap_or_default(),
                participants: optional(&row, "participants", parse_ulid_list)?.unwrap_or_default(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &TableWithJoins,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table_name = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut values: HashMap<String, &Expr> = HashMap::new();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        values.insert(column, &assignment.value);
    }
    if values.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    match table_name.as_str() {
        "rooms" => {
            reject_unknown_columns(&values, &["name", "capacity", "location", "amenities", "status"])?;
            let maintenance = match values.get("status") {
                Some(expr) => {
                    let status = parse_string(expr)?;
                    match RoomStatus::parse(&status) {
                        Some(RoomStatus::Maintenance) => Some(true),
                        Some(RoomStatus::Available) => Some(false),
                        _ => {
                            return Err(SqlError::Parse(format!(
                                "room status can only be set to maintenance or available, got {status}"
                            )));
                        }
                    }
                }
                None => None,
            };
            let update = RoomUpdate {
                name: values.get("name").map(|e| parse_string(e)).transpose()?,
                capacity: values.get("capacity").map(|e| parse_u32(e)).transpose()?,
                location: values
                    .get("location")
                    .map(|e| parse_string_or_null(e))
                    .transpose()?,
                amenities: values
                    .get("amenities")
                    .map(|e| parse_string_list(e))
                    .transpose()?,
            };
            Ok(Command::UpdateRoom {
                id,
                update,
                maintenance,
            })
        }
        "bookings" => {
            reject_unknown_columns(&values, &["status", "start", "end", "purpose", "participants"])?;
            let status = match values.get("status") {
                Some(expr) => {
                    let s = parse_string(expr)?;
                    Some(
                        BookingStatus::parse(&s)
                            .ok_or_else(|| SqlError::Parse(format!("bad booking status: {s}")))?,
                    )
                }
                None => None,
            };
            Ok(Command::UpdateBooking {
                id,
                status,
                start: values.get("start").map(|e| parse_i64_expr(e)).transpose()?,
                end: values.get("end").map(|e| parse_i64_expr(e)).transpose()?,
                purpose: values
                    .get("purpose")
                    .map(|e| parse_string_or_null(e).map(Option::unwrap_or_default))
                    .transpose()?,
                participants: values
                    .get("participants")
                    .map(|e| parse_ulid_list(e))
                    .transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table_name)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(delete.selection.as_ref())?;

    match table.as_str() {
        "users" => Ok(Command::DeleteUser { id }),
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "users" => Ok(Command::SelectUsers),
        "rooms" => Ok(Command::SelectRooms {
            id: filters.eq_ulid("id")?,
        }),
        "available_rooms" => Ok(Command::SelectAvailableRooms {
            start: filters.required_bound(&filters.lower, "start")?,
            end: filters.required_bound(&filters.upper, "end")?,
        }),
        "room_status" => Ok(Command::SelectRoomStatus {
            room_id: filters
                .eq_ulid("room_id")?
                .ok_or(SqlError::MissingFilter("room_id"))?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            id: filters.eq_ulid("id")?,
            room_id: filters.eq_ulid("room_id")?,
            user_id: filters.eq_ulid("user_id")?,
        }),
        "user_overlaps" => Ok(Command::SelectUserOverlaps {
            user_id: filters.eq_ulid("user_id")?,
            start: filters.required_bound(&filters.lower, "start")?,
            end: filters.required_bound(&filters.upper, "end")?,
        }),
        "schedule" => Ok(Command::SelectSchedule {
            room_id: filters
                .eq_ulid("room_id")?
                .ok_or(SqlError::MissingFilter("room_id"))?,
            start: filters.required_bound(&filters.lower, "start")?,
            end: filters.required_bound(&filters.upper, "end")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// Conjunction of `col = v`, `col >= v` and `col <= v` terms.
#[derive(Debug, Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    lower: HashMap<String, Expr>,
    upper: HashMap<String, Expr>,
}

impl Filters {
    fn eq_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.eq.get(column).map(parse_ulid_expr).transpose()
    }

    fn required_bound(
        &self,
        bounds: &HashMap<String, Expr>,
        column: &'static str,
    ) -> Result<Ms, SqlError> {
        bounds
            .get(column)
            .ok_or(SqlError::MissingFilter(column))
            .and_then(parse_i64_expr)
    }
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => {
            if *op == ast::BinaryOperator::And {
                collect_filters(left, filters)?;
                return collect_filters(right, filters);
            }
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            let target = match op {
                ast::BinaryOperator::Eq => &mut filters.eq,
                ast::BinaryOperator::GtEq => &mut filters.lower,
                ast::BinaryOperator::LtEq => &mut filters.upper,
                _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
            };
            target.insert(column, right.as_ref().clone());
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
}

fn extract_where_id(selection: Option<&Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
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

/// The single VALUES row of an INSERT, keyed by column. Without a column list
/// values bind positionally to `columns`; the first `min` are required.
fn insert_row(
    insert: &ast::Insert,
    columns: &[&'static str],
    min: usize,
) -> Result<HashMap<String, Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => row,
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };

    let names: Vec<String> = if insert.columns.is_empty() {
        columns.iter().take(values.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if names.len() != values.len() {
        return Err(SqlError::WrongArity("INSERT", names.len(), values.len()));
    }
    let row: HashMap<String, Expr> = names.into_iter().zip(values.iter().cloned()).collect();
    reject_unknown_columns(&row, columns)?;
    for column in &columns[..min] {
        if !row.contains_key(*column) {
            return Err(SqlError::MissingColumn(column));
        }
    }
    Ok(row)
}

fn reject_unknown_columns<V>(row: &HashMap<String, V>, known: &[&str]) -> Result<(), SqlError> {
    match row.keys().find(|k| !known.contains(&k.as_str())) {
        Some(unknown) => Err(SqlError::UnknownColumn(unknown.clone())),
        None => Ok(()),
    }
}

fn required<'a>(row: &'a HashMap<String, Expr>, column: &'static str) -> Result<&'a Expr, SqlError> {
    row.get(column).ok_or(SqlError::MissingColumn(column))
}

fn optional<T>(
    row: &HashMap<String, Expr>,
    column: &str,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    row.get(column).map(parse).transpose()
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
        Some(Value::SingleQuotedString(s)) => parse_ulid_str(s),
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_str(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// A JSON array of strings in a string literal: `'["projector", "whiteboard"]'`.
/// NULL is an empty list.
fn parse_string_list(expr: &Expr) -> Result<Vec<String>, SqlError> {
    match parse_string_or_null(expr)? {
        Some(s) => serde_json::from_str(&s)
            .map_err(|e| SqlError::Parse(format!("expected JSON array of strings: {e}"))),
        None => Ok(Vec::new()),
    }
}

fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    parse_string_list(expr)?
        .iter()
        .map(|s| parse_ulid_str(s))
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
