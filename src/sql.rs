use chrono::{NaiveDate, NaiveTime, Weekday};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertStaff {
        id: Ulid,
        name: Option<String>,
        granularity_min: u32,
        active: bool,
    },
    SetStaffActive {
        staff_id: Ulid,
        active: bool,
    },
    SetWorkingHours {
        staff_id: Ulid,
        weekday: Weekday,
        hours: WorkingHours,
    },
    ClearWorkingHours {
        staff_id: Ulid,
        weekday: Weekday,
    },
    UpsertService(Service),
    DeleteService {
        id: Ulid,
    },
    InsertCustomer(Customer),
    InsertBooking(BookingRequest),
    SetBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectSlots {
        staff: StaffSelector,
        date: NaiveDate,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookings {
        staff_id: Ulid,
        date: NaiveDate,
    },
    SelectStaff,
    SelectServices,
}

const DEFAULT_GRANULARITY_MIN: u32 = 30;

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without an explicit column list the
/// table's default column order applies.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        insert: &ast::Insert,
        values: &'a [Expr],
        default_columns: &[&str],
    ) -> Result<Self, SqlError> {
        let columns: Vec<String> = if insert.columns.is_empty() {
            default_columns.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if columns.len() < values.len() || (!insert.columns.is_empty() && columns.len() != values.len()) {
            return Err(SqlError::Parse(format!(
                "{table}: {} columns but {} values",
                columns.len(),
                values.len()
            )));
        }
        Ok(Self { table, columns, values })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// Missing column and NULL both read as `None`.
    fn text(&self, column: &str) -> Result<Option<String>, SqlError> {
        match self.get(column) {
            Some(expr) => scalar(expr),
            None => Ok(None),
        }
    }

    fn required(&self, column: &'static str) -> Result<String, SqlError> {
        self.text(column)?
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "staff" => {
            let row = Row::new("staff", insert, &values, &["id", "name", "granularity", "active"])?;
            Ok(Command::InsertStaff {
                id: parse_ulid(&row.required("id")?)?,
                name: row.text("name")?,
                granularity_min: match row.text("granularity")? {
                    Some(g) => parse_u32(&g)?,
                    None => DEFAULT_GRANULARITY_MIN,
                },
                active: match row.text("active")? {
                    Some(a) => parse_bool(&a)?,
                    None => true,
                },
            })
        }
        "staff_status" => {
            let row = Row::new("staff_status", insert, &values, &["staff_id", "active"])?;
            Ok(Command::SetStaffActive {
                staff_id: parse_ulid(&row.required("staff_id")?)?,
                active: parse_bool(&row.required("active")?)?,
            })
        }
        "working_hours" => {
            let row = Row::new(
                "working_hours",
                insert,
                &values,
                &["staff_id", "weekday", "start", "end"],
            )?;
            let start = parse_time(&row.required("start")?)?;
            let end = parse_time(&row.required("end")?)?;
            let hours = WorkingHours::new(start, end).ok_or_else(|| {
                SqlError::InvalidValue(format!(
                    "opening time {} must be before closing time {}",
                    start.format("%H:%M"),
                    end.format("%H:%M")
                ))
            })?;
            Ok(Command::SetWorkingHours {
                staff_id: parse_ulid(&row.required("staff_id")?)?,
                weekday: parse_weekday(&row.required("weekday")?)?,
                hours,
            })
        }
        "services" => {
            let row = Row::new("services", insert, &values, &["id", "name", "duration", "price"])?;
            Ok(Command::UpsertService(Service {
                id: parse_ulid(&row.required("id")?)?,
                name: row.required("name")?,
                duration_min: parse_u32(&row.required("duration")?)?,
                price: parse_i64(&row.required("price")?)?,
            }))
        }
        "customers" => {
            let row = Row::new("customers", insert, &values, &["id", "name", "phone", "email"])?;
            Ok(Command::InsertCustomer(Customer {
                id: parse_ulid(&row.required("id")?)?,
                name: row.required("name")?,
                phone: row.text("phone")?,
                email: row.text("email")?,
            }))
        }
        "bookings" => parse_insert_booking(insert, &values),
        "booking_status" => {
            let row = Row::new("booking_status", insert, &values, &["booking_id", "status"])?;
            Ok(Command::SetBookingStatus {
                id: parse_ulid(&row.required("booking_id")?)?,
                status: parse_status(&row.required("status")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_insert_booking(insert: &ast::Insert, values: &[Expr]) -> Result<Command, SqlError> {
    let row = Row::new(
        "bookings",
        insert,
        values,
        &["id", "staff_id", "date", "time", "services", "customer_id"],
    )?;

    let staff = match row.text("staff_id")? {
        None => StaffSelector::Any,
        Some(s) if s.eq_ignore_ascii_case("any") => StaffSelector::Any,
        Some(s) => StaffSelector::Specific(parse_ulid(&s)?),
    };
    let services = match row.get("services") {
        Some(expr) => parse_service_list(expr)?,
        None => return Err(SqlError::MissingColumn("bookings", "services")),
    };
    let customer = match row.text("customer_id")? {
        Some(id) => CustomerInfo::Account(parse_ulid(&id)?),
        None => CustomerInfo::Guest(GuestInfo {
            name: row
                .text("guest_name")?
                .ok_or(SqlError::MissingColumn("bookings", "customer_id or guest_name"))?,
            phone: row.text("guest_phone")?,
            email: row.text("guest_email")?,
        }),
    };

    Ok(Command::InsertBooking(BookingRequest {
        id: parse_ulid(&row.required("id")?)?,
        staff,
        date: parse_date(&row.required("date")?)?,
        time: parse_time(&row.required("time")?)?,
        services,
        customer,
        idempotency_key: row.text("idempotency_key")?,
    }))
}

/// `ARRAY['a', 'b']`, `'{a,b}'` or `'a,b'`.
fn parse_service_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    if let Expr::Array(array) = expr {
        return array
            .elem
            .iter()
            .map(|e| {
                scalar(e)?
                    .ok_or_else(|| SqlError::InvalidValue("NULL service id".into()))
                    .and_then(|s| parse_ulid(&s))
            })
            .collect();
    }
    let text = scalar(expr)?.ok_or(SqlError::MissingColumn("bookings", "services"))?;
    text.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_ulid)
        .collect()
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "working_hours" => Ok(Command::ClearWorkingHours {
            staff_id: parse_ulid(filters.required("staff_id")?)?,
            weekday: parse_weekday(filters.required("weekday")?)?,
        }),
        "services" => Ok(Command::DeleteService {
            id: parse_ulid(filters.required("id")?)?,
        }),
        "bookings" => Ok(Command::DeleteBooking {
            id: parse_ulid(filters.required("id")?)?,
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
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "slots" => {
            let staff = match filters.get("staff_id") {
                None => StaffSelector::Any,
                Some(s) if s.eq_ignore_ascii_case("any") => StaffSelector::Any,
                Some(s) => StaffSelector::Specific(parse_ulid(s)?),
            };
            Ok(Command::SelectSlots {
                staff,
                date: parse_date(filters.required("date")?)?,
            })
        }
        "bookings" => {
            if let Some(id) = filters.get("id") {
                return Ok(Command::SelectBooking { id: parse_ulid(id)? });
            }
            Ok(Command::SelectBookings {
                staff_id: parse_ulid(filters.required("staff_id")?)?,
                date: parse_date(filters.required("date")?)?,
            })
        }
        "staff" => Ok(Command::SelectStaff),
        "services" => Ok(Command::SelectServices),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = literal` conditions joined by AND.
#[derive(Default)]
struct Filters(Vec<(String, String)>);

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                if let Some(value) = scalar(right)? {
                    self.0.push((column, value));
                }
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn get(&self, column: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    fn required(&self, column: &'static str) -> Result<&str, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
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

/// First VALUES row. One statement books one thing.
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

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Literal as text; `NULL` is `None`.
fn scalar(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } => {
            Ok(scalar(expr)?.map(|s| format!("-{s}")))
        }
        Expr::Nested(inner) => scalar(inner),
        other => Err(SqlError::Parse(format!("expected a literal, got {other}"))),
    }
}

fn parse_ulid(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|e| SqlError::InvalidValue(format!("bad ULID {s:?}: {e}")))
}

fn parse_u32(s: &str) -> Result<u32, SqlError> {
    s.trim()
        .parse()
        .map_err(|_| SqlError::InvalidValue(format!("expected a non-negative integer, got {s:?}")))
}

fn parse_i64(s: &str) -> Result<i64, SqlError> {
    s.trim()
        .parse()
        .map_err(|_| SqlError::InvalidValue(format!("expected an integer, got {s:?}")))
}

fn parse_bool(s: &str) -> Result<bool, SqlError> {
    match s.trim().to_lowercase().as_str() {
        "true" | "t" | "1" | "yes" => Ok(true),
        "false" | "f" | "0" | "no" => Ok(false),
        _ => Err(SqlError::InvalidValue(format!("bad bool: {s}"))),
    }
}

/// `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> Result<NaiveDate, SqlError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::InvalidValue(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

/// `HH:MM`, seconds tolerated.
pub fn parse_time(s: &str) -> Result<NaiveTime, SqlError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| SqlError::InvalidValue(format!("bad time {s:?}, expected HH:MM")))
}

/// `mon`..`sun` or the full English name, any case.
pub fn parse_weekday(s: &str) -> Result<Weekday, SqlError> {
    s.trim()
        .parse::<Weekday>()
        .map_err(|_| SqlError::InvalidValue(format!("bad weekday {s:?}")))
}

fn parse_status(s: &str) -> Result<BookingStatus, SqlError> {
    BookingStatus::parse(s.trim())
        .ok_or_else(|| SqlError::InvalidValue(format!("unknown booking status {s:?}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value we cannot use.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
