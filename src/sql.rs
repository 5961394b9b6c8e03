use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    CreateBusiness {
        id: Ulid,
        name: String,
        timezone: String,
        owner_id: Option<Ulid>,
    },
    CreateService {
        id: Ulid,
        business_id: Ulid,
        name: String,
        duration_min: i64,
        price: Cents,
    },
    DeleteService {
        id: Ulid,
    },
    AddSchedule {
        id: Ulid,
        business_id: Ulid,
        weekday: u8,
        from: String,
        to: String,
    },
    UpdateSchedule {
        id: Ulid,
        from: String,
        to: String,
    },
    RemoveSchedule {
        id: Ulid,
    },
    RegisterUser {
        id: Ulid,
        name: String,
        role: Role,
        business_id: Option<Ulid>,
    },
    CreateBooking {
        id: Ulid,
        service_id: Ulid,
        business_id: Ulid,
        start: Ms,
        employee_id: Option<Ulid>,
        client_id: Option<Ulid>,
        timezone: Option<String>,
        price: Option<Cents>,
    },
    ChangeBookingStatus {
        id: Ulid,
        status: BookingStatus,
        expected: Option<BookingStatus>,
    },
    /// `employee` distinguishes "keep" (None), "auto-assign" (Some(None))
    /// and "move to this employee" (Some(Some(id))).
    RescheduleBooking {
        id: Ulid,
        start: Ms,
        employee: Option<Option<Ulid>>,
    },
    SelectMyBookings,
    SelectMyAssignments,
    SelectBookings {
        status: Option<BookingStatus>,
        from: Option<Ms>,
        to: Option<Ms>,
        client_id: Option<Ulid>,
        business_id: Option<Ulid>,
    },
    SelectAvailableEmployees {
        business_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectBusinesses,
    SelectServices {
        business_id: Option<Ulid>,
    },
    SelectSchedules {
        business_id: Ulid,
    },
    SelectEmployees {
        business_id: Ulid,
    },
    Listen {
        channel: String,
    },
    /// `UNLISTEN channel` drops one subscription; `UNLISTEN *` (None) drops
    /// them all.
    Unlisten {
        channel: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if trimmed.to_uppercase().starts_with("UNLISTEN") {
        let rest = trimmed[8..].trim().trim_matches(';').trim();
        return match rest {
            "" => Err(SqlError::Parse("UNLISTEN requires a channel name or *".into())),
            "*" => Ok(Command::Unlisten { channel: None }),
            name => Ok(Command::Unlisten {
                channel: Some(name.to_string()),
            }),
        };
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(table, assignments, selection)
        }
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "businesses" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("businesses", 3, values.len()));
            }
            let owner_id = if values.len() >= 4 {
                parse_ulid_or_null(&values[3])?
            } else {
                None
            };
            Ok(Command::CreateBusiness {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                timezone: parse_string(&values[2])?,
                owner_id,
            })
        }
        "services" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("services", 5, values.len()));
            }
            Ok(Command::CreateService {
                id: parse_ulid(&values[0])?,
                business_id: parse_ulid(&values[1])?,
                name: parse_string(&values[2])?,
                duration_min: parse_i64(&values[3])?,
                price: parse_i64(&values[4])?,
            })
        }
        "schedules" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("schedules", 5, values.len()));
            }
            Ok(Command::AddSchedule {
                id: parse_ulid(&values[0])?,
                business_id: parse_ulid(&values[1])?,
                weekday: parse_u8(&values[2])?,
                from: parse_string(&values[3])?,
                to: parse_string(&values[4])?,
            })
        }
        "users" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("users", 3, values.len()));
            }
            let business_id = if values.len() >= 4 {
                parse_ulid_or_null(&values[3])?
            } else {
                None
            };
            Ok(Command::RegisterUser {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                role: parse_role(&values[2])?,
                business_id,
            })
        }
        "bookings" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("bookings", 4, values.len()));
            }
            // Trailing columns are positional and NULL-able:
            // (.., employee_id, client_id, timezone, price)
            let employee_id = values.get(4).map(parse_ulid_or_null).transpose()?.flatten();
            let client_id = values.get(5).map(parse_ulid_or_null).transpose()?.flatten();
            let timezone = values.get(6).map(parse_string_or_null).transpose()?.flatten();
            let price = values.get(7).map(parse_i64_or_null).transpose()?.flatten();
            Ok(Command::CreateBooking {
                id: parse_ulid(&values[0])?,
                service_id: parse_ulid(&values[1])?,
                business_id: parse_ulid(&values[2])?,
                start: parse_i64(&values[3])?,
                employee_id,
                client_id,
                timezone,
                price,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "services" => Ok(Command::DeleteService { id }),
        "schedules" => Ok(Command::RemoveSchedule { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    match table.as_str() {
        "bookings" => parse_update_booking(assignments, selection),
        "schedules" => {
            let id = extract_where_id(selection)?;
            let (mut from, mut to) = (None, None);
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "from" => from = Some(parse_string(&a.value)?),
                    "to" => to = Some(parse_string(&a.value)?),
                    other => {
                        return Err(SqlError::Parse(format!("cannot assign column {other}")))
                    }
                }
            }
            Ok(Command::UpdateSchedule {
                id,
                from: from.ok_or(SqlError::Parse("UPDATE schedules requires \"from\"".into()))?,
                to: to.ok_or(SqlError::Parse("UPDATE schedules requires \"to\"".into()))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update_booking(
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let (mut id, mut expected) = (None, None);
    collect_booking_update_where(sel, &mut id, &mut expected)?;
    let id = id.ok_or(SqlError::MissingFilter("id"))?;

    let (mut status, mut start, mut employee) = (None, None, None);
    for a in assignments {
        match assignment_column(a)?.as_str() {
            "status" => status = Some(parse_status(&a.value)?),
            "start" => start = Some(parse_i64(&a.value)?),
            "employee_id" => employee = Some(parse_ulid_or_null(&a.value)?),
            other => return Err(SqlError::Parse(format!("cannot assign column {other}"))),
        }
    }

    match (status, start) {
        (Some(status), None) => {
            if employee.is_some() {
                return Err(SqlError::Unsupported(
                    "cannot change status and employee together".into(),
                ));
            }
            Ok(Command::ChangeBookingStatus { id, status, expected })
        }
        (None, Some(start)) => Ok(Command::RescheduleBooking { id, start, employee }),
        (Some(_), Some(_)) => Err(SqlError::Unsupported(
            "cannot change status and start together".into(),
        )),
        (None, None) => Err(SqlError::Parse(
            "UPDATE bookings requires SET status or SET start".into(),
        )),
    }
}

fn collect_booking_update_where(
    expr: &Expr,
    id: &mut Option<Ulid>,
    expected: &mut Option<BookingStatus>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_booking_update_where(left, id, expected)?;
            collect_booking_update_where(right, id, expected)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            match expr_column_name(left).as_deref() {
                Some("id") => *id = Some(parse_ulid_expr(right)?),
                // `AND status = '…'` is the optimistic precondition.
                Some("status") => *expected = Some(parse_status(right)?),
                _ => return Err(SqlError::Parse(format!("unsupported filter: {left}"))),
            }
            Ok(())
        }
        _ => Err(SqlError::Parse(format!("unsupported WHERE clause: {expr}"))),
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

    match table.as_str() {
        "my_bookings" => Ok(Command::SelectMyBookings),
        "my_assignments" => Ok(Command::SelectMyAssignments),
        "businesses" => Ok(Command::SelectBusinesses),
        "bookings" => {
            let mut filter = BookingsFilterAcc::default();
            if let Some(selection) = &select.selection {
                extract_bookings_filters(selection, &mut filter)?;
            }
            Ok(Command::SelectBookings {
                status: filter.status,
                from: filter.from,
                to: filter.to,
                client_id: filter.client_id,
                business_id: filter.business_id,
            })
        }
        "available_employees" => {
            let (mut business_id, mut start, mut end) = (None, None, None);
            if let Some(selection) = &select.selection {
                extract_availability_filters(selection, &mut business_id, &mut start, &mut end)?;
            }
            Ok(Command::SelectAvailableEmployees {
                business_id: business_id.ok_or(SqlError::MissingFilter("business_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        "services" => {
            let mut business_id = None;
            if let Some(selection) = &select.selection {
                business_id = Some(extract_where_business_id(selection)?);
            }
            Ok(Command::SelectServices { business_id })
        }
        "schedules" => {
            let selection = select
                .selection
                .as_ref()
                .ok_or(SqlError::MissingFilter("business_id"))?;
            Ok(Command::SelectSchedules { business_id: extract_where_business_id(selection)? })
        }
        "employees" => {
            let selection = select
                .selection
                .as_ref()
                .ok_or(SqlError::MissingFilter("business_id"))?;
            Ok(Command::SelectEmployees { business_id: extract_where_business_id(selection)? })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct BookingsFilterAcc {
    status: Option<BookingStatus>,
    from: Option<Ms>,
    to: Option<Ms>,
    client_id: Option<Ulid>,
    business_id: Option<Ulid>,
}

fn extract_bookings_filters(expr: &Expr, acc: &mut BookingsFilterAcc) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_bookings_filters(left, acc)?;
                extract_bookings_filters(right, acc)
            }
            ast::BinaryOperator::Eq => {
                match expr_column_name(left).as_deref() {
                    Some("status") => acc.status = Some(parse_status(right)?),
                    Some("client_id") => acc.client_id = Some(parse_ulid_expr(right)?),
                    Some("business_id") => acc.business_id = Some(parse_ulid_expr(right)?),
                    _ => return Err(SqlError::Parse(format!("unsupported filter: {left}"))),
                }
                Ok(())
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    acc.from = Some(parse_i64_expr(right)?);
                    Ok(())
                } else {
                    Err(SqlError::Parse(format!("unsupported filter: {left}")))
                }
            }
            ast::BinaryOperator::Lt => {
                if expr_column_name(left).as_deref() == Some("start") {
                    acc.to = Some(parse_i64_expr(right)?);
                    Ok(())
                } else {
                    Err(SqlError::Parse(format!("unsupported filter: {left}")))
                }
            }
            _ => Err(SqlError::Parse(format!("unsupported operator in filter: {op}"))),
        },
        _ => Err(SqlError::Parse(format!("unsupported WHERE clause: {expr}"))),
    }
}

fn extract_availability_filters(
    expr: &Expr,
    business_id: &mut Option<Ulid>,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_availability_filters(left, business_id, start, end)?;
                extract_availability_filters(right, business_id, start, end)?;
            }
            ast::BinaryOperator::Eq => {
                if expr_column_name(left).as_deref() == Some("business_id") {
                    *business_id = Some(parse_ulid_expr(right)?);
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        },
        _ => {}
    }
    Ok(())
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

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty assignment target".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn extract_where_business_id(selection: &Expr) -> Result<Ulid, SqlError> {
    match selection {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("business_id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("business_id"))
            }
        }
        _ => Err(SqlError::MissingFilter("business_id")),
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
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?,
            )),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64_expr(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            _ => Ok(Some(parse_i64_expr(expr)?)),
        }
    } else {
        Ok(Some(parse_i64_expr(expr)?))
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_role(expr: &Expr) -> Result<Role, SqlError> {
    let s = parse_string(expr)?;
    Role::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown role: {s}")))
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let s = parse_string(expr)?;
    BookingStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown status: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
