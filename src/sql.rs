use std::collections::HashMap;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Property settings a write may carry. Absent fields keep their value.
#[derive(Debug, Default, PartialEq)]
pub struct PropertyChanges {
    pub capacity: Option<u32>,
    pub base_rate: Option<Decimal>,
    pub booking_mode: Option<BookingMode>,
    pub cleaning_fee: Option<Decimal>,
    pub included_guests: Option<u32>,
    pub extra_guest_fee: Option<Decimal>,
    pub active: Option<bool>,
}

impl PropertyChanges {
    pub fn apply_to(&self, property: &mut Property) {
        if let Some(v) = self.capacity {
            property.capacity = v;
        }
        if let Some(v) = self.base_rate {
            property.base_rate = v;
        }
        if let Some(v) = self.booking_mode {
            property.booking_mode = v;
        }
        if let Some(v) = self.cleaning_fee {
            property.cleaning_fee = v;
        }
        if let Some(v) = self.included_guests {
            property.included_guests = v;
        }
        if let Some(v) = self.extra_guest_fee {
            property.extra_guest_fee = v;
        }
        if let Some(v) = self.active {
            property.active = v;
        }
    }
}

/// A payment provider callback. Callbacks that cannot be understood are kept
/// so they can be acknowledged without side effects.
#[derive(Debug, PartialEq)]
pub enum PaymentCallback {
    Result { booking_id: Ulid, result: PaymentResult },
    Malformed(String),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProperty {
        id: Ulid,
        capacity: u32,
        base_rate: Decimal,
        changes: PropertyChanges,
    },
    UpdateProperty {
        id: Ulid,
        changes: PropertyChanges,
    },
    DeleteProperty {
        id: Ulid,
    },
    InsertPricingRule {
        rule: PricingRule,
    },
    DeletePricingRule {
        id: Ulid,
    },
    InsertBlock {
        id: Ulid,
        property_id: Ulid,
        range: DateRange,
    },
    DeleteBlock {
        id: Ulid,
    },
    InsertBooking {
        property_id: Ulid,
        range: DateRange,
        guests: u32,
        idempotency_key: String,
    },
    CancelBooking {
        id: Ulid,
    },
    Approve {
        booking_id: Ulid,
    },
    Decline {
        booking_id: Ulid,
    },
    CheckIn {
        booking_id: Ulid,
    },
    CheckOut {
        booking_id: Ulid,
    },
    Payment {
        callback: PaymentCallback,
    },
    InsertCalendarLink {
        id: Ulid,
        property_id: Ulid,
        url: String,
        direction: LinkDirection,
        policy: ConflictPolicy,
    },
    DeleteCalendarLink {
        id: Ulid,
        /// Release the nights the link blocked instead of keeping them as manual blocks.
        clear: bool,
    },
    SelectAvailability {
        property_id: Ulid,
        range: DateRange,
    },
    SelectPriceQuote {
        property_id: Ulid,
        range: DateRange,
        guests: u32,
    },
    SelectBookings {
        property_id: Ulid,
    },
    SelectCalendar {
        property_id: Ulid,
    },
    SelectCalendarLinks {
        property_id: Ulid,
    },
}

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

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.opt(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    /// The column's value, or `None` when it is absent or NULL.
    fn opt(&self, column: &str) -> Option<&'a Expr> {
        self.values
            .get(column)
            .copied()
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }
}

/// Pair the first VALUES row with its column list. Without a column list the
/// table's default column order applies.
fn insert_row<'a>(insert: &'a ast::Insert, table: &'static str, default_order: &[&str]) -> Result<Row<'a>, SqlError> {
    let values = extract_insert_values(insert)?;
    let names: Vec<String> = if insert.columns.is_empty() {
        default_order.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() != names.len() && !(insert.columns.is_empty() && values.len() <= names.len()) {
        return Err(SqlError::WrongArity(table, names.len(), values.len()));
    }
    Ok(Row {
        table,
        values: names.into_iter().zip(values.iter()).collect(),
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "properties" => {
            let row = insert_row(
                insert,
                "properties",
                &["id", "capacity", "base_rate", "booking_mode", "cleaning_fee", "included_guests", "extra_guest_fee"],
            )?;
            Ok(Command::InsertProperty {
                id: parse_ulid_expr(row.get("id")?)?,
                capacity: parse_u32(row.get("capacity")?)?,
                base_rate: parse_decimal(row.get("base_rate")?)?,
                changes: property_changes(|c| row.opt(c))?,
            })
        }
        "property_settings" => {
            let row = insert_row(
                insert,
                "property_settings",
                &["id", "capacity", "base_rate", "booking_mode", "cleaning_fee", "included_guests", "extra_guest_fee", "active"],
            )?;
            Ok(Command::UpdateProperty {
                id: parse_ulid_expr(row.get("id")?)?,
                changes: property_changes(|c| row.opt(c))?,
            })
        }
        "pricing_rules" => {
            let row = insert_row(
                insert,
                "pricing_rules",
                &["id", "property_id", "start", "end", "kind", "value", "priority"],
            )?;
            let kind = parse_string(row.get("kind")?)?;
            Ok(Command::InsertPricingRule {
                rule: PricingRule {
                    id: parse_ulid_expr(row.get("id")?)?,
                    property_id: parse_ulid_expr(row.get("property_id")?)?,
                    range: parse_range(row.get("start")?, row.get("end")?)?,
                    kind: RuleKind::parse(&kind).ok_or_else(|| SqlError::Parse(format!("unknown rule kind {kind:?}")))?,
                    value: parse_decimal(row.get("value")?)?,
                    priority: row
                        .opt("priority")
                        .map(parse_i64_expr)
                        .transpose()?
                        .map(|p| i32::try_from(p).map_err(|_| SqlError::Parse(format!("{p} out of i32 range"))))
                        .transpose()?
                        .unwrap_or(0),
                },
            })
        }
        "blocks" => {
            let row = insert_row(insert, "blocks", &["id", "property_id", "start", "end"])?;
            Ok(Command::InsertBlock {
                id: parse_ulid_expr(row.get("id")?)?,
                property_id: parse_ulid_expr(row.get("property_id")?)?,
                range: parse_range(row.get("start")?, row.get("end")?)?,
            })
        }
        "bookings" => {
            let row = insert_row(
                insert,
                "bookings",
                &["property_id", "start", "end", "guests", "idempotency_key"],
            )?;
            Ok(Command::InsertBooking {
                property_id: parse_ulid_expr(row.get("property_id")?)?,
                range: parse_range(row.get("start")?, row.get("end")?)?,
                guests: parse_u32(row.get("guests")?)?,
                idempotency_key: parse_string(row.get("idempotency_key")?)?,
            })
        }
        "approvals" | "declines" | "check_ins" | "checkouts" => {
            let row = insert_row(insert, "booking actions", &["booking_id"])?;
            let booking_id = parse_ulid_expr(row.get("booking_id")?)?;
            Ok(match table.as_str() {
                "approvals" => Command::Approve { booking_id },
                "declines" => Command::Decline { booking_id },
                "check_ins" => Command::CheckIn { booking_id },
                _ => Command::CheckOut { booking_id },
            })
        }
        "payments" => {
            let callback = match parse_payment(insert) {
                Ok((booking_id, result)) => PaymentCallback::Result { booking_id, result },
                Err(e) => PaymentCallback::Malformed(e.to_string()),
            };
            Ok(Command::Payment { callback })
        }
        "calendar_links" => {
            let row = insert_row(
                insert,
                "calendar_links",
                &["id", "property_id", "url", "direction", "policy"],
            )?;
            let direction = match row.opt("direction") {
                Some(e) => {
                    let s = parse_string(e)?;
                    LinkDirection::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown direction {s:?}")))?
                }
                None => LinkDirection::Import,
            };
            let policy = match row.opt("policy") {
                Some(e) => {
                    let s = parse_string(e)?;
                    ConflictPolicy::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown policy {s:?}")))?
                }
                None => ConflictPolicy::Block,
            };
            Ok(Command::InsertCalendarLink {
                id: parse_ulid_expr(row.get("id")?)?,
                property_id: parse_ulid_expr(row.get("property_id")?)?,
                url: parse_string(row.get("url")?)?,
                direction,
                policy,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_payment(insert: &ast::Insert) -> Result<(Ulid, PaymentResult), SqlError> {
    let row = insert_row(insert, "payments", &["booking_id", "result", "reference"])?;
    let booking_id = parse_ulid_expr(row.get("booking_id")?)?;
    let reference = parse_string(row.get("reference")?)?;
    let result = match parse_string(row.get("result")?)?.to_ascii_lowercase().as_str() {
        "paid" => PaymentResult::Paid { reference },
        "failed" => PaymentResult::Failed { reference },
        other => return Err(SqlError::Parse(format!("unknown payment result {other:?}"))),
    };
    Ok((booking_id, result))
}

/// Read the optional property settings through `lookup`.
fn property_changes<'a>(lookup: impl Fn(&str) -> Option<&'a Expr>) -> Result<PropertyChanges, SqlError> {
    let mode = match lookup("booking_mode") {
        Some(e) => {
            let s = parse_string(e)?;
            Some(BookingMode::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown booking mode {s:?}")))?)
        }
        None => None,
    };
    Ok(PropertyChanges {
        capacity: lookup("capacity").map(parse_u32).transpose()?,
        base_rate: lookup("base_rate").map(parse_decimal).transpose()?,
        booking_mode: mode,
        cleaning_fee: lookup("cleaning_fee").map(parse_decimal).transpose()?,
        included_guests: lookup("included_guests").map(parse_u32).transpose()?,
        extra_guest_fee: lookup("extra_guest_fee").map(parse_decimal).transpose()?,
        active: lookup("active").map(parse_bool).transpose()?,
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut filters = HashMap::new();
    if let Some(selection) = &delete.selection {
        collect_eq_filters(selection, &mut filters);
    }
    let id = filters
        .get("id")
        .map(|e| parse_ulid_expr(e))
        .transpose()?
        .ok_or(SqlError::MissingFilter("id"))?;

    match table.as_str() {
        "properties" => Ok(Command::DeleteProperty { id }),
        "pricing_rules" => Ok(Command::DeletePricingRule { id }),
        "blocks" => Ok(Command::DeleteBlock { id }),
        "bookings" => Ok(Command::CancelBooking { id }),
        "calendar_links" => Ok(Command::DeleteCalendarLink {
            id,
            clear: filters.get("clear").map(|e| parse_bool(e)).transpose()?.unwrap_or(false),
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }
    let property_id = filters.property_id.ok_or(SqlError::MissingFilter("property_id"))?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            property_id,
            range: filters.range()?,
        }),
        "price_quote" => Ok(Command::SelectPriceQuote {
            property_id,
            range: filters.range()?,
            guests: filters.guests.ok_or(SqlError::MissingFilter("guests"))?,
        }),
        "bookings" => Ok(Command::SelectBookings { property_id }),
        "calendar" => Ok(Command::SelectCalendar { property_id }),
        "calendar_links" => Ok(Command::SelectCalendarLinks { property_id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    property_id: Option<Ulid>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    guests: Option<u32>,
}

impl Filters {
    fn range(&self) -> Result<DateRange, SqlError> {
        let start = self.start.ok_or(SqlError::MissingFilter("start"))?;
        let end = self.end.ok_or(SqlError::MissingFilter("end"))?;
        DateRange::try_new(start, end).ok_or(SqlError::EmptyRange)
    }
}

/// `start` accepts `=` or `>=`, `end` accepts `=` or `<=`; the window is the same either way.
fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    if let Expr::Nested(inner) = expr {
        return extract_filters(inner, filters);
    }
    let Expr::BinaryOp { left, op, right } = expr else {
        return Ok(());
    };
    let col = expr_column_name(left);
    match (op, col.as_deref()) {
        (ast::BinaryOperator::And, _) => {
            extract_filters(left, filters)?;
            extract_filters(right, filters)?;
        }
        (ast::BinaryOperator::Eq, Some("property_id")) => filters.property_id = Some(parse_ulid_expr(right)?),
        (ast::BinaryOperator::Eq, Some("guests")) => filters.guests = Some(parse_u32(right)?),
        (ast::BinaryOperator::Eq | ast::BinaryOperator::GtEq, Some("start")) => {
            filters.start = Some(parse_date(right)?)
        }
        (ast::BinaryOperator::Eq | ast::BinaryOperator::LtEq, Some("end")) => filters.end = Some(parse_date(right)?),
        _ => {}
    }
    Ok(())
}

/// `col = value` pairs joined by AND.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out);
            collect_eq_filters(right, out);
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                out.insert(col, right);
            }
        }
        _ => {}
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
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

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
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
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
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

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_decimal(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => {
            Decimal::from_str(s.trim()).map_err(|e| SqlError::Parse(format!("bad amount {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected amount, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// `'2026-08-10'`: calendar dates are always ISO strings.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_range(start: &Expr, end: &Expr) -> Result<DateRange, SqlError> {
    DateRange::try_new(parse_date(start)?, parse_date(end)?).ok_or(SqlError::EmptyRange)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    /// `start` is not before `end`.
    EmptyRange,
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
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::EmptyRange => write!(f, "start must be before end"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const PID: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    fn pid() -> Ulid {
        Ulid::from_string(PID).unwrap()
    }

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn r(a: &str, b: &str) -> DateRange {
        DateRange::new(d(a), d(b))
    }

    #[test]
    fn parse_insert_property_with_defaults() {
        let sql = format!("INSERT INTO properties (id, capacity, base_rate) VALUES ('{ID}', 4, 120.50)");
        match parse_sql(&sql).unwrap() {
            Command::InsertProperty { id: got, capacity, base_rate, changes } => {
                assert_eq!(got, id());
                assert_eq!(capacity, 4);
                assert_eq!(base_rate, Decimal::new(12050, 2));
                assert_eq!(changes, PropertyChanges::default());
            }
            cmd => panic!("expected InsertProperty, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_property_with_settings() {
        let sql = format!(
            "INSERT INTO properties (id, capacity, base_rate, booking_mode, cleaning_fee, included_guests, extra_guest_fee) \
             VALUES ('{ID}', 6, '1000', 'request', 150, 2, '25.00')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertProperty { changes, .. } => {
                assert_eq!(changes.booking_mode, Some(BookingMode::Request));
                assert_eq!(changes.cleaning_fee, Some(Decimal::from(150)));
                assert_eq!(changes.included_guests, Some(2));
                assert_eq!(changes.extra_guest_fee, Some(Decimal::from(25)));
            }
            cmd => panic!("expected InsertProperty, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_positional_insert_uses_default_order() {
        let sql = format!("INSERT INTO blocks VALUES ('{ID}', '{PID}', '2026-08-01', '2026-08-05')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBlock {
                id: id(),
                property_id: pid(),
                range: r("2026-08-01", "2026-08-05")
            }
        );
    }

    #[test]
    fn parse_property_settings() {
        let sql = format!("INSERT INTO property_settings (id, base_rate, active) VALUES ('{ID}', 140, false)");
        let Command::UpdateProperty { id: got, changes } = parse_sql(&sql).unwrap() else {
            panic!("expected UpdateProperty");
        };
        assert_eq!(got, id());
        assert_eq!(changes.base_rate, Some(Decimal::from(140)));
        assert_eq!(changes.active, Some(false));
        assert_eq!(changes.capacity, None);

        let mut property = Property::new(id(), "owner", 4, Decimal::from(100));
        changes.apply_to(&mut property);
        assert_eq!(property.base_rate, Decimal::from(140));
        assert!(!property.active);
        assert_eq!(property.capacity, 4);
    }

    #[test]
    fn parse_insert_pricing_rule() {
        let sql = format!(
            r#"INSERT INTO pricing_rules (id, property_id, start, "end", kind, value, priority) VALUES ('{ID}', '{PID}', '2026-12-20', '2027-01-05', 'seasonal_percent', 25, 3)"#
        );
        let Command::InsertPricingRule { rule } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertPricingRule");
        };
        assert_eq!(rule.range, r("2026-12-20", "2027-01-05"));
        assert_eq!(rule.kind, RuleKind::SeasonalPercent);
        assert_eq!(rule.value, Decimal::from(25));
        assert_eq!(rule.priority, 3);

        let unknown = format!(
            r#"INSERT INTO pricing_rules (id, property_id, start, "end", kind, value) VALUES ('{ID}', '{PID}', '2026-12-20', '2027-01-05', 'surge', 25)"#
        );
        assert!(parse_sql(&unknown).is_err());
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            r#"INSERT INTO bookings (property_id, start, "end", guests, idempotency_key) VALUES ('{PID}', '2026-08-10', '2026-08-12', 2, 'req-1')"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                property_id: pid(),
                range: r("2026-08-10", "2026-08-12"),
                guests: 2,
                idempotency_key: "req-1".into()
            }
        );
    }

    #[test]
    fn booking_with_empty_range_is_rejected() {
        let sql = format!(
            r#"INSERT INTO bookings (property_id, start, "end", guests, idempotency_key) VALUES ('{PID}', '2026-08-12', '2026-08-12', 2, 'k')"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::EmptyRange)));
        let missing = format!(r#"INSERT INTO bookings (property_id, start, "end") VALUES ('{PID}', '2026-08-10', '2026-08-12')"#);
        assert!(matches!(parse_sql(&missing), Err(SqlError::MissingColumn("bookings", "guests"))));
    }

    #[test]
    fn parse_booking_actions() {
        for (table, expect) in [
            ("approvals", Command::Approve { booking_id: id() }),
            ("declines", Command::Decline { booking_id: id() }),
            ("check_ins", Command::CheckIn { booking_id: id() }),
            ("checkouts", Command::CheckOut { booking_id: id() }),
        ] {
            let sql = format!("INSERT INTO {table} (booking_id) VALUES ('{ID}')");
            assert_eq!(parse_sql(&sql).unwrap(), expect);
        }
        let cancel = format!("DELETE FROM bookings WHERE id = '{ID}'");
        assert_eq!(parse_sql(&cancel).unwrap(), Command::CancelBooking { id: id() });
    }

    #[test]
    fn parse_payment_callbacks() {
        let paid = format!("INSERT INTO payments (booking_id, result, reference) VALUES ('{ID}', 'paid', 'ch_1')");
        assert_eq!(
            parse_sql(&paid).unwrap(),
            Command::Payment {
                callback: PaymentCallback::Result {
                    booking_id: id(),
                    result: PaymentResult::Paid { reference: "ch_1".into() }
                }
            }
        );

        for bad in [
            format!("INSERT INTO payments (booking_id, result, reference) VALUES ('{ID}', 'refunded', 'ch_1')"),
            "INSERT INTO payments (booking_id, result, reference) VALUES ('not-a-ulid', 'paid', 'ch_1')".to_string(),
            format!("INSERT INTO payments (booking_id, result) VALUES ('{ID}', 'paid')"),
        ] {
            assert!(
                matches!(parse_sql(&bad), Ok(Command::Payment { callback: PaymentCallback::Malformed(_) })),
                "{bad}"
            );
        }
    }

    #[test]
    fn parse_calendar_link_insert_and_delete() {
        let sql = format!(
            "INSERT INTO calendar_links (id, property_id, url, policy) VALUES ('{ID}', '{PID}', 'https://example.test/a.ics', 'notify')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertCalendarLink {
                id: id(),
                property_id: pid(),
                url: "https://example.test/a.ics".into(),
                direction: LinkDirection::Import,
                policy: ConflictPolicy::Notify
            }
        );

        let keep = format!("DELETE FROM calendar_links WHERE id = '{ID}'");
        assert_eq!(parse_sql(&keep).unwrap(), Command::DeleteCalendarLink { id: id(), clear: false });
        let clear = format!("DELETE FROM calendar_links WHERE id = '{ID}' AND clear = true");
        assert_eq!(parse_sql(&clear).unwrap(), Command::DeleteCalendarLink { id: id(), clear: true });
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(
            "SELECT * FROM availability WHERE property_id = '{PID}' AND start >= '2026-08-01' AND \"end\" <= '2026-09-01'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                property_id: pid(),
                range: r("2026-08-01", "2026-09-01")
            }
        );
    }

    #[test]
    fn parse_select_price_quote() {
        let sql = format!(
            "SELECT * FROM price_quote WHERE property_id = '{PID}' AND start = '2026-08-07' AND \"end\" = '2026-08-09' AND guests = 2"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectPriceQuote {
                property_id: pid(),
                range: r("2026-08-07", "2026-08-09"),
                guests: 2
            }
        );
        let no_guests = format!(
            "SELECT * FROM price_quote WHERE property_id = '{PID}' AND start = '2026-08-07' AND \"end\" = '2026-08-09'"
        );
        assert!(matches!(parse_sql(&no_guests), Err(SqlError::MissingFilter("guests"))));
    }

    #[test]
    fn parse_property_scoped_selects() {
        for (table, expect) in [
            ("bookings", Command::SelectBookings { property_id: pid() }),
            ("calendar", Command::SelectCalendar { property_id: pid() }),
            ("calendar_links", Command::SelectCalendarLinks { property_id: pid() }),
        ] {
            let sql = format!("SELECT * FROM {table} WHERE property_id = '{PID}'");
            assert_eq!(parse_sql(&sql).unwrap(), expect);
        }
        assert!(matches!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::MissingFilter("property_id"))
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
