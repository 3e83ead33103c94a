use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which ledger a booking listing is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingKey {
    Id(Ulid),
    User(Ulid),
    Trainer(Ulid),
    Class(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    BookSession(SessionRequest),
    BookClass {
        id: Ulid,
        user_id: Ulid,
        class_id: Ulid,
        notes: Option<String>,
    },
    CancelBooking {
        id: Ulid,
        reason: Option<String>,
    },
    CompleteBooking {
        id: Ulid,
    },
    /// Group classes and admin schedules; both are bookable at once.
    CreateClass(NewClass),
    ProposeSchedule {
        class: NewClass,
        notes: Option<String>,
    },
    ApproveSchedule {
        id: Ulid,
        by: Option<Ulid>,
    },
    RejectSchedule {
        id: Ulid,
        by: Option<Ulid>,
        reason: Option<String>,
    },
    CancelClass {
        id: Ulid,
    },
    CompleteClass {
        id: Ulid,
    },
    /// Move a class in time and optionally hand it to another trainer.
    RescheduleClass {
        id: Ulid,
        start: Ms,
        end: Ms,
        trainer_id: Option<Ulid>,
    },
    DeleteClass {
        id: Ulid,
    },
    SetAvailability {
        trainer_id: Ulid,
        date: NaiveDate,
        slots: Vec<(Ms, Ms)>,
    },
    SelectBookings {
        key: BookingKey,
        status: Option<BookingStatus>,
    },
    SelectClasses {
        id: Option<Ulid>,
        filter: ClassFilter,
    },
    SelectPending {
        trainer_id: Option<Ulid>,
    },
    SelectParticipants {
        class_id: Ulid,
    },
    SelectAvailability {
        trainer_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectConflicts {
        trainer_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectEntitlements {
        user_id: Ulid,
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
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, for describing result rows before execution.
/// Placeholders (`$1`) are accepted.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

// ── Inserts ───────────────────────────────────────────────────

/// One VALUES row keyed by its column names.
struct Row<'a> {
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn get(&self, col: &'static str) -> Option<&'a Expr> {
        self.values.get(col).copied().filter(|e| !is_null(e))
    }

    fn has(&self, col: &'static str) -> bool {
        self.values.contains_key(col)
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.get(col).ok_or(SqlError::MissingColumn(col))?)
    }

    fn opt_ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid).transpose()
    }

    fn ms(&self, col: &'static str) -> Result<Ms, SqlError> {
        parse_ms(self.get(col).ok_or(SqlError::MissingColumn(col))?)
    }

    fn text(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string(self.get(col).ok_or(SqlError::MissingColumn(col))?)
    }

    fn opt_text(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_string).transpose()
    }

    fn u32(&self, col: &'static str) -> Result<u32, SqlError> {
        let v = parse_i64(self.get(col).ok_or(SqlError::MissingColumn(col))?)?;
        u32::try_from(v).map_err(|_| SqlError::Parse(format!("{col}: {v} out of range")))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = insert_rows(insert)?;
    if rows.len() > 1 && table != "availability" {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let row = &rows[0];

    match table.as_str() {
        "bookings" => {
            let id = row.ulid("id")?;
            let user_id = row.ulid("user_id")?;
            let notes = row.opt_text("notes")?;
            if row.has("class_id") {
                return Ok(Command::BookClass {
                    id,
                    user_id,
                    class_id: row.ulid("class_id")?,
                    notes,
                });
            }
            Ok(Command::BookSession(SessionRequest {
                id,
                user_id,
                trainer_id: row.ulid("trainer_id")?,
                start: row.ms("start")?,
                end: row.ms("end")?,
                notes,
            }))
        }
        "cancellations" => Ok(Command::CancelBooking {
            id: row.ulid("booking_id")?,
            reason: row.opt_text("reason")?,
        }),
        "completions" => Ok(Command::CompleteBooking {
            id: row.ulid("booking_id")?,
        }),
        "classes" => Ok(Command::CreateClass(new_class(row, ClassKind::GroupClass)?)),
        "schedules" => Ok(Command::CreateClass(new_class(row, ClassKind::WorkoutSchedule)?)),
        "proposals" => Ok(Command::ProposeSchedule {
            class: new_class(row, ClassKind::WorkoutSchedule)?,
            notes: row.opt_text("notes")?,
        }),
        "approvals" => Ok(Command::ApproveSchedule {
            id: row.ulid("schedule_id")?,
            by: row.opt_ulid("approved_by")?,
        }),
        "rejections" => Ok(Command::RejectSchedule {
            id: row.ulid("schedule_id")?,
            by: row.opt_ulid("rejected_by")?,
            reason: row.opt_text("reason")?,
        }),
        "class_cancellations" => Ok(Command::CancelClass {
            id: row.ulid("class_id")?,
        }),
        "class_completions" => Ok(Command::CompleteClass {
            id: row.ulid("class_id")?,
        }),
        "class_reschedules" => Ok(Command::RescheduleClass {
            id: row.ulid("class_id")?,
            start: row.ms("start")?,
            end: row.ms("end")?,
            trainer_id: row.opt_ulid("trainer_id")?,
        }),
        "availability" => parse_availability_rows(&rows),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn new_class(row: &Row<'_>, kind: ClassKind) -> Result<NewClass, SqlError> {
    Ok(NewClass {
        id: row.ulid("id")?,
        trainer_id: row.ulid("trainer_id")?,
        kind,
        name: row.text("name")?,
        description: row.opt_text("description")?,
        category: row.opt_text("category")?,
        start: row.ms("start")?,
        end: row.ms("end")?,
        capacity: row.u32("capacity")?,
    })
}

/// Every row must name the same trainer and date; together they replace that
/// date's slots.
fn parse_availability_rows(rows: &[Row<'_>]) -> Result<Command, SqlError> {
    let trainer_id = rows[0].ulid("trainer_id")?;
    let date = parse_date(rows[0].get("date").ok_or(SqlError::MissingColumn("date"))?)?;
    let mut slots = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        if row.ulid("trainer_id")? != trainer_id
            || parse_date(row.get("date").ok_or(SqlError::MissingColumn("date"))?)? != date
        {
            return Err(SqlError::Parse(format!("row {i}: all slots must share trainer_id and date")));
        }
        let bound = |col: &'static str| {
            row.get(col)
                .ok_or(SqlError::MissingColumn(col))
                .and_then(|e| parse_slot_bound(e, date))
        };
        slots.push((bound("start")?, bound("end")?));
    }
    Ok(Command::SetAvailability { trainer_id, date, slots })
}

// ── Deletes ───────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "bookings" => Ok(Command::CancelBooking {
            id: filters.ulid("id")?,
            reason: None,
        }),
        "classes" | "schedules" | "proposals" => Ok(Command::DeleteClass {
            id: filters.ulid("id")?,
        }),
        "availability" => Ok(Command::SetAvailability {
            trainer_id: filters.ulid("trainer_id")?,
            date: parse_date(filters.eq("date").ok_or(SqlError::MissingFilter("date"))?)?,
            slots: Vec::new(),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Selects ───────────────────────────────────────────────────

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
        "bookings" => {
            let key = if let Some(id) = filters.opt_ulid("id")? {
                BookingKey::Id(id)
            } else if let Some(user) = filters.opt_ulid("user_id")? {
                BookingKey::User(user)
            } else if let Some(trainer) = filters.opt_ulid("trainer_id")? {
                BookingKey::Trainer(trainer)
            } else if let Some(class) = filters.opt_ulid("class_id")? {
                BookingKey::Class(class)
            } else {
                return Err(SqlError::MissingFilter("user_id, trainer_id or class_id"));
            };
            let status = match filters.eq("status") {
                Some(e) => {
                    let s = parse_string(e)?;
                    Some(BookingStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?)
                }
                None => None,
            };
            Ok(Command::SelectBookings { key, status })
        }
        "classes" | "schedules" => {
            let kind = if table == "classes" {
                ClassKind::GroupClass
            } else {
                ClassKind::WorkoutSchedule
            };
            Ok(Command::SelectClasses {
                id: filters.opt_ulid("id")?,
                filter: ClassFilter {
                    kind: Some(kind),
                    trainer_id: filters.opt_ulid("trainer_id")?,
                    category: filters.eq("category").map(parse_string).transpose()?,
                    from: filters.gte("start").map(parse_ms).transpose()?,
                    to: filters.lte("end").map(parse_ms).transpose()?,
                },
            })
        }
        "proposals" => Ok(Command::SelectPending {
            trainer_id: filters.opt_ulid("trainer_id")?,
        }),
        "participants" => Ok(Command::SelectParticipants {
            class_id: filters.ulid("class_id")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            trainer_id: filters.ulid("trainer_id")?,
            start: filters.window_start()?,
            end: filters.window_end()?,
            min_duration: filters.eq("min_duration").map(parse_i64).transpose()?,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            trainer_id: filters.ulid("trainer_id")?,
            start: filters.window_start()?,
            end: filters.window_end()?,
        }),
        "entitlements" => Ok(Command::SelectEntitlements {
            user_id: filters.ulid("user_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

/// Conjunctive `column op value` predicates from a WHERE clause.
#[derive(Default)]
struct Filters<'a> {
    preds: Vec<(String, Op, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                let op = match op {
                    ast::BinaryOperator::And => {
                        self.collect(left)?;
                        return self.collect(right);
                    }
                    ast::BinaryOperator::Eq => Op::Eq,
                    ast::BinaryOperator::GtEq => Op::GtEq,
                    ast::BinaryOperator::LtEq => Op::LtEq,
                    other => return Err(SqlError::Unsupported(format!("operator {other}"))),
                };
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                let right: &'a Expr = right;
                self.preds.push((col, op, right));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("predicate {other}"))),
        }
    }

    fn find(&self, col: &str, op: Op) -> Option<&'a Expr> {
        self.preds
            .iter()
            .find(|(c, o, _)| c == col && *o == op)
            .map(|(_, _, e)| *e)
    }

    fn eq(&self, col: &str) -> Option<&'a Expr> {
        self.find(col, Op::Eq)
    }

    fn gte(&self, col: &str) -> Option<&'a Expr> {
        self.find(col, Op::GtEq)
    }

    fn lte(&self, col: &str) -> Option<&'a Expr> {
        self.find(col, Op::LtEq)
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.eq(col).ok_or(SqlError::MissingFilter(col))?)
    }

    fn opt_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.eq(col).map(parse_ulid).transpose()
    }

    fn window_start(&self) -> Result<Ms, SqlError> {
        parse_ms(self.gte("start").ok_or(SqlError::MissingFilter("start"))?)
    }

    fn window_end(&self) -> Result<Ms, SqlError> {
        parse_ms(self.lte("end").ok_or(SqlError::MissingFilter("end"))?)
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

fn insert_rows(insert: &ast::Insert) -> Result<Vec<Row<'_>>, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::NoColumnList);
    }
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = body.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    if values.rows.is_empty() {
        return Err(SqlError::Parse("empty VALUES".into()));
    }

    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    values
        .rows
        .iter()
        .map(|row| {
            if row.len() != columns.len() {
                return Err(SqlError::ColumnCount(columns.len(), row.len()));
            }
            Ok(Row {
                values: columns.iter().cloned().zip(row.iter()).collect(),
            })
        })
        .collect()
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Unix milliseconds, or an RFC 3339 timestamp string.
fn parse_ms(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s}: {e}")));
    }
    parse_i64(expr)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

/// Slot bounds accept a time of day (`'09:30'`, interpreted in UTC on the
/// slot's date; `'24:00'` is the end of that date) besides full timestamps.
fn parse_slot_bound(expr: &Expr, date: NaiveDate) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        if s == "24:00" {
            if let Some(next) = date.succ_opt() {
                return Ok(next.and_time(NaiveTime::MIN).and_utc().timestamp_millis());
            }
        }
        if let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M") {
            return Ok(date.and_time(time).and_utc().timestamp_millis());
        }
    }
    parse_ms(expr)
}

// ── Errors ────────────────────────────────────────────────────

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
    #[error("INSERT requires an explicit column list")]
    NoColumnList,
    #[error("expected {0} values, got {1}")]
    ColumnCount(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
