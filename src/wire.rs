use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::noop::NoopStartupHandler;
use pgwire::api::auth::StartupHandler;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;
use tracing::debug;
use ulid::Ulid;

use crate::engine::{BookingChange, BookingRequest, Engine, EngineError, NewRoom};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

pub struct RoombookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<RoombookQueryParser>,
}

impl RoombookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(RoombookQueryParser),
        }
    }

    /// The session's login `user` is the actor's ULID; its role comes from
    /// the user directory. Authentication happens in front of this server.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let login = client.metadata().get("user").cloned().unwrap_or_default();
        let actor = Ulid::from_string(&login)
            .ok()
            .and_then(|id| self.engine.resolve_actor(&id));
        actor.ok_or_else(|| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", format!("unknown user {login:?}"))
        })
    }

    async fn run(&self, actor: &Actor, sql_text: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!("{label} by {} failed: {e}", actor.id);
        }
        result
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        let now = now_ms();
        match cmd {
            Command::InsertUser { id, name, role } => {
                if !actor.is_admin() {
                    return Err(engine_err(EngineError::Forbidden(
                        "only an administrator may register users",
                    )));
                }
                engine.register_user(id, &name, role).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteUser { id } => {
                engine.delete_user(actor, id, now).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectUsers => {
                let users = if actor.is_admin() {
                    engine.list_users()
                } else {
                    engine.get_user(&actor.id).into_iter().collect()
                };
                let schema = Arc::new(user_schema());
                let rows = users
                    .iter()
                    .map(|u| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&u.id.to_string())?;
                        encoder.encode_field(&u.name)?;
                        encoder.encode_field(&u.role.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::InsertRoom {
                id,
                name,
                capacity,
                location,
                amenities,
            } => {
                let new = NewRoom {
                    id,
                    name,
                    capacity,
                    location,
                    amenities,
                };
                engine.create_room(actor, new).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateRoom {
                id,
                update,
                maintenance,
            } => {
                if !update.is_empty() {
                    engine.update_room(actor, id, update).await.map_err(engine_err)?;
                }
                if let Some(on) = maintenance {
                    engine
                        .set_maintenance(actor, id, on, now)
                        .await
                        .map_err(engine_err)?;
                }
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectRooms { id } => {
                let rooms = match id {
                    Some(id) => vec![engine.get_room(&id).await.map_err(engine_err)?],
                    None => engine.list_rooms().await,
                };
                Ok(rooms_response(&rooms))
            }
            Command::SelectAvailableRooms { start, end } => {
                let rooms = engine
                    .find_available_rooms(start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(rooms_response(&rooms))
            }
            Command::SelectRoomStatus { room_id } => {
                let report = engine
                    .get_room_status(room_id, now)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(room_status_schema());
                let current = report.current_booking.as_ref();
                let upcoming: Vec<serde_json::Value> = report
                    .upcoming_bookings
                    .iter()
                    .map(|b| {
                        serde_json::json!({
                            "id": b.id.to_string(),
                            "user_id": b.user_id.to_string(),
                            "start": b.span.start,
                            "end": b.span.end,
                            "purpose": b.purpose,
                        })
                    })
                    .collect();
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&report.room.id.to_string())?;
                encoder.encode_field(&report.room.name)?;
                encoder.encode_field(&report.room.status.as_str())?;
                encoder.encode_field(&current.map(|b| b.id.to_string()))?;
                encoder.encode_field(&current.map(|b| b.span.start))?;
                encoder.encode_field(&current.map(|b| b.span.end))?;
                encoder.encode_field(&serde_json::Value::Array(upcoming).to_string())?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::InsertBooking {
                id,
                room_id,
                start,
                end,
                purpose,
                participants,
            } => {
                let req = BookingRequest {
                    id,
                    room_id,
                    user_id: actor.id,
                    start,
                    end,
                    purpose,
                    participants,
                };
                engine.request_booking(req, now).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateBooking {
                id,
                status,
                start,
                end,
                purpose,
                participants,
            } => {
                let change = BookingChange {
                    status,
                    start,
                    end,
                    purpose,
                    participants,
                };
                engine
                    .update_booking(id, actor, change, now)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine
                    .cancel_booking(id, actor, now)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings {
                id,
                room_id,
                user_id,
            } => {
                let mut bookings = match (id, user_id) {
                    (Some(id), _) => vec![engine.get_booking(actor, id).await.map_err(engine_err)?],
                    (None, Some(uid)) => engine
                        .list_user_bookings(actor, uid)
                        .await
                        .map_err(engine_err)?,
                    (None, None) if actor.is_admin() => {
                        engine.list_bookings(actor).await.map_err(engine_err)?
                    }
                    (None, None) => engine
                        .list_user_bookings(actor, actor.id)
                        .await
                        .map_err(engine_err)?,
                };
                bookings.retain(|b| {
                    room_id.is_none_or(|r| b.room_id == r) && user_id.is_none_or(|u| b.user_id == u)
                });
                Ok(bookings_response(&bookings))
            }
            Command::SelectUserOverlaps {
                user_id,
                start,
                end,
            } => {
                let target = user_id.unwrap_or(actor.id);
                if target != actor.id && !actor.is_admin() {
                    return Err(engine_err(EngineError::Forbidden(
                        "users may only check their own bookings",
                    )));
                }
                let bookings = engine
                    .check_user_overlap(target, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(bookings_response(&bookings))
            }
            Command::SelectSchedule {
                room_id,
                start,
                end,
            } => {
                let schedule = engine
                    .room_schedule(room_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let mut slots: Vec<(&str, Option<String>, Span)> = schedule
                    .booked
                    .iter()
                    .map(|b| {
                        let clipped = Span::new(
                            b.span.start.max(schedule.window.start),
                            b.span.end.min(schedule.window.end),
                        );
                        ("booked", Some(b.id.to_string()), clipped)
                    })
                    .chain(schedule.free.iter().map(|s| ("free", None, *s)))
                    .collect();
                slots.sort_by_key(|(_, _, span)| span.start);

                let schema = Arc::new(schedule_schema());
                let rows = slots
                    .iter()
                    .map(|(kind, booking_id, span)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(kind)?;
                        encoder.encode_field(booking_id)?;
                        encoder.encode_field(&span.start)?;
                        encoder.encode_field(&span.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
        }
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn user_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name"), text_field("role")]
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        int_field("capacity"),
        text_field("location"),
        text_field("amenities"),
        text_field("status"),
    ]
}

fn room_status_schema() -> Vec<FieldInfo> {
    vec![
        text_field("room_id"),
        text_field("name"),
        text_field("status"),
        text_field("current_booking_id"),
        int_field("current_start"),
        int_field("current_end"),
        text_field("upcoming"),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("room_id"),
        text_field("user_id"),
        int_field("start"),
        int_field("end"),
        text_field("status"),
        text_field("purpose"),
        text_field("participants"),
        int_field("created_at"),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        text_field("kind"),
        text_field("booking_id"),
        int_field("start"),
        int_field("end"),
    ]
}

/// Column layout a statement produces, for Describe in the extended protocol.
fn result_schema(sql_text: &str) -> Vec<FieldInfo> {
    let lower = sql_text.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    if lower.contains("available_rooms") {
        room_schema()
    } else if lower.contains("room_status") {
        room_status_schema()
    } else if lower.contains("user_overlaps") || lower.contains("bookings") {
        booking_schema()
    } else if lower.contains("schedule") {
        schedule_schema()
    } else if lower.contains("rooms") {
        room_schema()
    } else if lower.contains("users") {
        user_schema()
    } else {
        vec![]
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn rooms_response(rooms: &[Room]) -> Response {
    let schema = Arc::new(room_schema());
    let rows = rooms
        .iter()
        .map(|r| {
            let amenities: Vec<&String> = r.amenities.iter().collect();
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&(r.capacity as i64))?;
            encoder.encode_field(&r.location)?;
            encoder.encode_field(&serde_json::to_string(&amenities).unwrap_or_default())?;
            encoder.encode_field(&r.status.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn bookings_response(bookings: &[Booking]) -> Response {
    let schema = Arc::new(booking_schema());
    let rows = bookings
        .iter()
        .map(|b| {
            let participants: Vec<String> = b.participants.iter().map(Ulid::to_string).collect();
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.room_id.to_string())?;
            encoder.encode_field(&b.user_id.to_string())?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.purpose)?;
            encoder.encode_field(&serde_json::to_string(&participants).unwrap_or_default())?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

#[async_trait]
impl SimpleQueryHandler for RoombookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        Ok(vec![self.run(&actor, query).await?])
    }
}

impl NoopStartupHandler for RoombookHandler {}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoombookQueryParser;

#[async_trait]
impl QueryParser for RoombookQueryParser {
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
impl ExtendedQueryHandler for RoombookHandler {
    type Statement = String;
    type QueryParser = RoombookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        let sql_text = substitute_params(portal);
        self.run(&actor, &sql_text).await
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

/// Highest `$N` placeholder in the statement.
fn count_params(sql_text: &str) -> usize {
    let bytes = sql_text.as_bytes();
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
        if let Ok(n) = sql_text[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals, highest index first so
/// `$1` never clobbers the prefix of `$10`.
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

pub struct RoombookFactory {
    handler: Arc<RoombookHandler>,
    noop: Arc<NoopHandler>,
}

impl RoombookFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(RoombookHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoombookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> std::io::Result<()> {
    let factory = RoombookFactory::new(engine);
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE per error kind, so clients can branch without parsing messages.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidWindow { .. } | EngineError::InvalidInput(_) => "22023",
        EngineError::PastBooking { .. } => "22007",
        EngineError::DurationExceeded { .. } => "22003",
        EngineError::RoomNotFound(_) | EngineError::NotFound(_) => "P0002",
        EngineError::RoomUnavailable(_) => "55006",
        EngineError::SlotConflict { .. } => "23P01",
        EngineError::UserOverlap { .. } => "23514",
        EngineError::Forbidden(_) => "42501",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::AlreadyExists(_) | EngineError::NameTaken(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::PersistenceFailure(_) => "58030",
        EngineError::PersistenceTimeout => "57014",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstates_are_distinct_per_rejection_kind() {
        let span = Span::new(1, 2);
        let id = Ulid::nil();
        let errors = [
            EngineError::InvalidWindow { start: 2, end: 1 },
            EngineError::PastBooking { start: 1, now: 2 },
            EngineError::DurationExceeded { duration: 2, max: 1 },
            EngineError::RoomNotFound(id),
            EngineError::RoomUnavailable(id),
            EngineError::SlotConflict { booking_id: id, span },
            EngineError::UserOverlap { booking_id: id, span },
            EngineError::Forbidden("no"),
            EngineError::InvalidTransition {
                from: BookingStatus::Cancelled,
                to: BookingStatus::Confirmed,
            },
            EngineError::AlreadyExists(id),
            EngineError::LimitExceeded("big"),
            EngineError::PersistenceFailure("disk".into()),
            EngineError::PersistenceTimeout,
        ];
        let mut codes: Vec<&str> = errors.iter().map(sqlstate).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn slot_conflict_maps_to_exclusion_violation() {
        let e = EngineError::SlotConflict {
            booking_id: Ulid::nil(),
            span: Span::new(10, 20),
        };
        assert_eq!(sqlstate(&e), "23P01");
        assert!(e.to_string().contains("[10, 20)"));
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM rooms"), 0);
        assert_eq!(count_params("SELECT * FROM schedule WHERE room_id = $1 AND start >= $2 AND \"end\" <= $3"), 3);
        assert_eq!(count_params("... $10 ... $2"), 10);
    }

    #[test]
    fn result_schema_by_table() {
        assert_eq!(result_schema("SELECT * FROM available_rooms WHERE start >= $1").len(), 6);
        assert_eq!(result_schema("select * from bookings").len(), 9);
        assert_eq!(result_schema("SELECT * FROM room_status WHERE room_id = $1").len(), 7);
        assert_eq!(result_schema("SELECT * FROM schedule WHERE room_id = $1").len(), 4);
        assert!(result_schema("DELETE FROM bookings WHERE id = $1").is_empty());
    }
}
