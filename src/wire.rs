use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use tokio::net::TcpStream;
use tracing::info;

use crate::auth::{Credentials, GymbookAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingKey, Command, SqlError};

pub struct GymbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<GymbookQueryParser>,
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

impl GymbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(GymbookQueryParser),
        }
    }

    /// Run one statement, recording its outcome under the command's label.
    async fn run(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let booking = matches!(cmd, Command::BookSession(_) | Command::BookClass { .. });
        let started = Instant::now();

        let result = self.execute_command(cmd).await;

        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        match result {
            Ok(responses) => {
                if booking {
                    metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "command" => label)
                        .increment(1);
                }
                Ok(responses)
            }
            Err(e) => {
                if booking {
                    metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL, "reason" => e.reason())
                        .increment(1);
                }
                Err(engine_err(e))
            }
        }
    }

    async fn execute_command(&self, cmd: Command) -> Result<Vec<Response>, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::BookSession(req) => {
                engine.book_session(req).await?;
                Ok(vec![inserted()])
            }
            Command::BookClass {
                id,
                user_id,
                class_id,
                notes,
            } => {
                engine.book_class(id, user_id, class_id, notes).await?;
                Ok(vec![inserted()])
            }
            Command::CancelBooking { id, reason } => {
                engine.cancel_booking(id, reason).await?;
                metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
                Ok(vec![deleted(1)])
            }
            Command::CompleteBooking { id } => {
                engine.complete_booking(id).await?;
                Ok(vec![inserted()])
            }
            Command::CreateClass(class) => {
                let class = engine.create_class(class).await?;
                info!(class = %class.id, kind = class.kind.as_str(), "class created");
                Ok(vec![inserted()])
            }
            Command::ProposeSchedule { class, notes } => {
                let class = engine.propose_schedule(class, notes).await?;
                info!(schedule = %class.id, trainer = %class.trainer_id, "schedule proposed");
                Ok(vec![inserted()])
            }
            Command::ApproveSchedule { id, by } => {
                engine.approve_schedule(id, by).await?;
                info!(schedule = %id, "schedule approved");
                Ok(vec![inserted()])
            }
            Command::RejectSchedule { id, by, reason } => {
                engine.reject_schedule(id, by, reason).await?;
                info!(schedule = %id, "schedule rejected");
                Ok(vec![inserted()])
            }
            Command::CancelClass { id } => {
                let bookings = engine.cancel_class(id).await?;
                info!(class = %id, bookings, "class cancelled");
                metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(bookings as u64);
                Ok(vec![inserted()])
            }
            Command::CompleteClass { id } => {
                engine.complete_class(id).await?;
                info!(class = %id, "class completed");
                Ok(vec![inserted()])
            }
            Command::RescheduleClass {
                id,
                start,
                end,
                trainer_id,
            } => {
                let class = engine.reschedule_class(id, start, end, trainer_id).await?;
                info!(class = %id, trainer = %class.trainer_id, start, "class rescheduled");
                Ok(vec![inserted()])
            }
            Command::DeleteClass { id } => {
                engine.delete_class(id).await?;
                info!(class = %id, "class deleted");
                Ok(vec![deleted(1)])
            }
            Command::SetAvailability {
                trainer_id,
                date,
                slots,
            } => {
                let clear = slots.is_empty();
                let merged = engine.set_availability(trainer_id, date, slots).await?;
                if clear {
                    Ok(vec![deleted(1)])
                } else {
                    Ok(vec![Response::Execution(
                        Tag::new("INSERT").with_rows(merged.len()),
                    )])
                }
            }
            Command::SelectBookings { key, status } => {
                let bookings = match key {
                    BookingKey::Id(id) => {
                        let booking = engine.get_booking(id).await?;
                        if status.is_none_or(|s| booking.status == s) {
                            vec![booking]
                        } else {
                            Vec::new()
                        }
                    }
                    BookingKey::User(id) => engine.bookings_for_user(id, status).await,
                    BookingKey::Trainer(id) => engine.bookings_for_trainer(id, status).await,
                    BookingKey::Class(id) => engine.bookings_for_class(id, status).await,
                };
                rows(bookings_schema(), bookings.iter(), encode_booking)
            }
            Command::SelectClasses { id, filter } => {
                let classes = match id {
                    Some(id) => vec![engine.get_class(id).await?],
                    None => engine.list_classes(&filter).await,
                };
                rows(classes_schema(), classes.iter(), encode_class)
            }
            Command::SelectPending { trainer_id } => {
                let classes = engine.pending_schedules(trainer_id).await;
                rows(classes_schema(), classes.iter(), encode_class)
            }
            Command::SelectParticipants { class_id } => {
                let participants = engine.participants(class_id).await?;
                rows(participants_schema(), participants.iter(), |enc, p| {
                    enc.encode_field(&p.booking_id.to_string())?;
                    enc.encode_field(&p.user_id.to_string())?;
                    enc.encode_field(&p.booked_at)
                })
            }
            Command::SelectAvailability {
                trainer_id,
                start,
                end,
                min_duration,
            } => {
                let slots = engine.free_slots(trainer_id, start, end, min_duration).await?;
                let tid = trainer_id.to_string();
                rows(availability_schema(), slots.iter(), |enc, slot| {
                    enc.encode_field(&tid)?;
                    enc.encode_field(&slot.start)?;
                    enc.encode_field(&slot.end)
                })
            }
            Command::SelectConflicts {
                trainer_id,
                start,
                end,
            } => {
                let conflicts = engine.check_conflicts(trainer_id, start, end).await?;
                rows(conflicts_schema(), conflicts.iter(), |enc, c| {
                    enc.encode_field(&c.id.to_string())?;
                    enc.encode_field(&c.kind)?;
                    enc.encode_field(&c.start)?;
                    enc.encode_field(&c.end)?;
                    enc.encode_field(&c.approved)
                })
            }
            Command::SelectEntitlements { user_id } => {
                let remaining = engine.remaining_sessions(user_id).await?;
                let (plan, allowed, used) = match remaining {
                    Remaining::Unlimited => ("unlimited", None, None),
                    Remaining::Sessions { allowed, used } => {
                        ("monthly", Some(allowed as i32), Some(used as i32))
                    }
                    Remaining::None => ("inactive", Some(0), None),
                    Remaining::Unknown => ("unknown", None, None),
                };
                let left = remaining.count().map(|n| n as i32);
                let uid = user_id.to_string();
                rows(entitlements_schema(), std::iter::once(()), |enc, ()| {
                    enc.encode_field(&uid)?;
                    enc.encode_field(&plan)?;
                    enc.encode_field(&allowed)?;
                    enc.encode_field(&used)?;
                    enc.encode_field(&left)
                })
            }
        }
    }
}

/// Encode every item into one row of `schema`.
fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl Iterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Result<Vec<Response>, EngineError> {
    let schema = Arc::new(schema);
    let data: Vec<PgWireResult<DataRow>> = items
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(data)))])
}

fn encode_booking(enc: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.user_id.to_string())?;
    enc.encode_field(&b.trainer_id.to_string())?;
    enc.encode_field(&b.target.class_id().map(|c| c.to_string()))?;
    enc.encode_field(&b.span.start)?;
    enc.encode_field(&b.span.end)?;
    enc.encode_field(&b.status.as_str())?;
    enc.encode_field(&b.notes)?;
    enc.encode_field(&b.cancel_reason)?;
    enc.encode_field(&b.created_at)?;
    enc.encode_field(&b.cancelled_at)?;
    enc.encode_field(&b.completed_at)
}

fn encode_class(enc: &mut DataRowEncoder, c: &ClassState) -> PgWireResult<()> {
    enc.encode_field(&c.id.to_string())?;
    enc.encode_field(&c.trainer_id.to_string())?;
    enc.encode_field(&c.kind.as_str())?;
    enc.encode_field(&c.name)?;
    enc.encode_field(&c.description)?;
    enc.encode_field(&c.category)?;
    enc.encode_field(&c.span.start)?;
    enc.encode_field(&c.span.end)?;
    enc.encode_field(&(c.capacity as i32))?;
    enc.encode_field(&(c.participants as i32))?;
    enc.encode_field(&(c.remaining() as i32))?;
    enc.encode_field(&c.status.as_str())?;
    enc.encode_field(&c.approval.as_str())?;
    enc.encode_field(&c.approval.note())?;
    enc.encode_field(&c.created_at)
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn int4(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("user_id"),
        text("trainer_id"),
        text("class_id"),
        int8("start"),
        int8("end"),
        text("status"),
        text("notes"),
        text("cancel_reason"),
        int8("created_at"),
        int8("cancelled_at"),
        int8("completed_at"),
    ]
}

fn classes_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("trainer_id"),
        text("kind"),
        text("name"),
        text("description"),
        text("category"),
        int8("start"),
        int8("end"),
        int4("capacity"),
        int4("participants"),
        int4("remaining"),
        text("status"),
        text("approval"),
        text("approval_note"),
        int8("created_at"),
    ]
}

fn participants_schema() -> Vec<FieldInfo> {
    vec![text("booking_id"), text("user_id"), int8("booked_at")]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text("trainer_id"), int8("start"), int8("end")]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("kind"),
        int8("start"),
        int8("end"),
        FieldInfo::new("approved".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn entitlements_schema() -> Vec<FieldInfo> {
    vec![
        text("user_id"),
        text("plan"),
        int4("allowed"),
        int4("used"),
        int4("remaining"),
    ]
}

/// Row description for a statement, before it runs. Statements that return
/// no rows describe as empty.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("bookings") => bookings_schema(),
        Some("classes" | "schedules" | "proposals") => classes_schema(),
        Some("participants") => participants_schema(),
        Some("availability") => availability_schema(),
        Some("conflicts") => conflicts_schema(),
        Some("entitlements") => entitlements_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for GymbookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run(cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct GymbookQueryParser;

#[async_trait]
impl QueryParser for GymbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for GymbookHandler {
    type Statement = String;
    type QueryParser = GymbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run(cmd).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct GymbookFactory {
    handler: Arc<GymbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<GymbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl GymbookFactory {
    pub fn new(engine: Arc<Engine>, credentials: Arc<Credentials>) -> Self {
        let auth_source = GymbookAuthSource::new(credentials);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(GymbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for GymbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    credentials: Arc<Credentials>,
) -> std::io::Result<()> {
    let factory = GymbookFactory::new(engine, credentials);
    pgwire::tokio::process_socket(socket, None, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM bookings WHERE user_id = $1"), 1);
        assert_eq!(count_params("INSERT INTO x (a, b) VALUES ($2, $10)"), 10);
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn schemas_follow_the_table() {
        assert_eq!(result_schema("SELECT * FROM bookings WHERE user_id = $1").len(), 12);
        assert_eq!(result_schema("SELECT * FROM proposals").len(), 15);
        assert_eq!(result_schema("SELECT * FROM entitlements WHERE user_id = $1").len(), 5);
        assert!(result_schema("INSERT INTO completions (booking_id) VALUES ($1)").is_empty());
    }
}
