use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::auth::TurnosStartupHandler;
use crate::engine::Engine;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Serve one client socket until it disconnects. Every connection gets its
/// own handler, so LISTEN subscriptions die with the session.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls_acceptor: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(TurnosFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

pub struct TurnosHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<TurnosQueryParser>,
    /// Live LISTEN subscriptions for this connection, keyed by business id.
    /// Buffered events are flushed to the client at the next statement.
    subscriptions: Mutex<HashMap<Ulid, broadcast::Receiver<Event>>>,
}

impl TurnosHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(TurnosQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// The `user` startup parameter names the acting user by ULID. Logins
    /// that don't match a registered user get no actor; identity-scoped
    /// statements then fail with SQLSTATE 28000. Catalog statements run
    /// without one, which is how the first admin gets registered.
    fn resolve_actor<C: ClientInfo>(&self, engine: &Engine, client: &C) -> Option<Actor> {
        let login = client.metadata().get("user")?;
        let id = Ulid::from_string(login).ok()?;
        engine.store.users.get(&id).map(|u| Actor {
            id: u.id,
            role: u.role,
        })
    }

    /// Forward any events buffered on this connection's subscriptions as
    /// NotificationResponse messages. Called before each statement; the
    /// messages ride along with the statement's own response.
    async fn drain_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let mut subs = self.subscriptions.lock().await;
        if subs.is_empty() {
            return Ok(());
        }
        let pid = std::process::id() as i32;
        for (business_id, rx) in subs.iter_mut() {
            let channel = format!("business_{business_id}");
            loop {
                match rx.try_recv() {
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else {
                            continue;
                        };
                        client
                            .feed(PgWireBackendMessage::NotificationResponse(
                                NotificationResponse::new(pid, channel.clone(), payload),
                            ))
                            .await?;
                    }
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: Option<Actor>,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::CreateBusiness {
                id,
                name,
                timezone,
                owner_id,
            } => {
                engine
                    .create_business(id, owner_id, name, &timezone)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::CreateService {
                id,
                business_id,
                name,
                duration_min,
                price,
            } => {
                engine
                    .create_service(id, business_id, name, duration_min, price)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteService { id } => {
                engine.delete_service(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::AddSchedule {
                id,
                business_id,
                weekday,
                from,
                to,
            } => {
                engine
                    .add_schedule(id, business_id, weekday, &from, &to)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateSchedule { id, from, to } => {
                engine
                    .update_schedule(id, &from, &to)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::RemoveSchedule { id } => {
                engine.remove_schedule(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::RegisterUser {
                id,
                name,
                role,
                business_id,
            } => {
                engine
                    .register_user(id, name, role, business_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::CreateBooking {
                id,
                service_id,
                business_id,
                start,
                employee_id,
                client_id,
                timezone,
                price,
            } => {
                // A client session always books for itself, whatever
                // client_id the statement carried.
                let client_id = match actor {
                    Some(a) if a.role == Role::Client => Some(a.id),
                    _ => client_id,
                };
                engine
                    .create_booking(BookingRequest {
                        id,
                        service_id,
                        business_id,
                        start,
                        employee_id,
                        client_id,
                        timezone,
                        price,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::ChangeBookingStatus {
                id,
                status,
                expected,
            } => {
                let actor = actor.ok_or_else(identity_err)?;
                engine
                    .change_status(actor, id, status, expected)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::RescheduleBooking {
                id,
                start,
                employee,
            } => {
                let actor = actor.ok_or_else(identity_err)?;
                engine
                    .reschedule_booking(actor, id, start, employee)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectMyBookings => {
                let actor = actor.ok_or_else(identity_err)?;
                let rows = engine.bookings_for_client(actor).map_err(engine_err)?;
                Ok(vec![booking_rows(rows)])
            }
            Command::SelectMyAssignments => {
                let actor = actor.ok_or_else(identity_err)?;
                let rows = engine.assignments_for_employee(actor).map_err(engine_err)?;
                Ok(vec![booking_rows(rows)])
            }
            Command::SelectBookings {
                status,
                from,
                to,
                client_id,
                business_id,
            } => {
                let actor = actor.ok_or_else(identity_err)?;
                let filter = BookingFilter {
                    status,
                    from,
                    to,
                    client_id,
                    business_id,
                };
                let rows = engine.list_bookings(actor, filter).map_err(engine_err)?;
                Ok(vec![booking_rows(rows)])
            }
            Command::SelectAvailableEmployees {
                business_id,
                start,
                end,
            } => {
                // Span built without validation: the engine reports backwards
                // ranges as InvalidInput.
                let span = Span { start, end };
                let free = engine
                    .available_employees(&business_id, &span)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(available_employees_schema());
                let rows: Vec<PgWireResult<_>> = free
                    .into_iter()
                    .map(|id| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&id.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBusinesses => {
                let schema = Arc::new(business_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_businesses()
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.owner_id.map(|o| o.to_string()))?;
                        encoder.encode_field(&b.name)?;
                        encoder.encode_field(&b.timezone.name())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectServices { business_id } => {
                let schema = Arc::new(service_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_services(business_id)
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.business_id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&s.duration_min)?;
                        encoder.encode_field(&s.price)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSchedules { business_id } => {
                let schema = Arc::new(schedule_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_schedules(&business_id)
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&w.id.to_string())?;
                        encoder.encode_field(&business_id.to_string())?;
                        encoder.encode_field(&(w.weekday as i16))?;
                        encoder.encode_field(&w.from.format("%H:%M").to_string())?;
                        encoder.encode_field(&w.to.format("%H:%M").to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectEmployees { business_id } => {
                let schema = Arc::new(employee_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_employees(&business_id)
                    .into_iter()
                    .map(|u| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&u.id.to_string())?;
                        encoder.encode_field(&u.name)?;
                        encoder.encode_field(&u.role.as_str())?;
                        encoder.encode_field(&u.business_id.map(|b| b.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                let business_id = parse_channel(&channel)?;
                let mut subs = self.subscriptions.lock().await;
                // Re-LISTEN keeps the existing receiver so buffered events
                // aren't dropped.
                subs.entry(business_id)
                    .or_insert_with(|| engine.notify.subscribe(business_id));
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let mut subs = self.subscriptions.lock().await;
                match channel {
                    None => subs.clear(),
                    // Unknown or malformed channels are a no-op, as in
                    // Postgres.
                    Some(c) => {
                        if let Ok(id) = parse_channel(&c) {
                            subs.remove(&id);
                        }
                    }
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

/// Channels are named `business_{ulid}`.
fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id_str = channel.strip_prefix("business_").ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected business_{{id}})"),
        )))
    })?;
    Ulid::from_string(id_str).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new(
            "client_id".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
        FieldInfo::new(
            "service_id".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
        FieldInfo::new(
            "business_id".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
        FieldInfo::new(
            "employee_id".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
        FieldInfo::new("start".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("end".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("status".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("price".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new(
            "timezone".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
        FieldInfo::new(
            "created_at".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
    ]
}

fn booking_rows(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.client_id.map(|c| c.to_string()))?;
            encoder.encode_field(&b.service_id.to_string())?;
            encoder.encode_field(&b.business_id.to_string())?;
            encoder.encode_field(&b.employee_id.to_string())?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.price)?;
            encoder.encode_field(&b.timezone.name())?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn business_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new(
            "owner_id".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new(
            "timezone".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
    ]
}

fn service_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new(
            "business_id".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new(
            "duration_min".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
        FieldInfo::new("price".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new(
            "business_id".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
        FieldInfo::new("weekday".into(), None, None, Type::INT2, FieldFormat::Text),
        FieldInfo::new("from".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("to".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn employee_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("role".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new(
            "business_id".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
    ]
}

fn available_employees_schema() -> Vec<FieldInfo> {
    vec![FieldInfo::new(
        "employee_id".into(),
        None,
        None,
        Type::VARCHAR,
        FieldFormat::Text,
    )]
}

/// Result schema by table name in the statement text. AVAILABLE_EMPLOYEES
/// and MY_* must be checked before their substrings.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABLE_EMPLOYEES") {
        available_employees_schema()
    } else if upper.contains("BOOKINGS") || upper.contains("MY_ASSIGNMENTS") {
        booking_schema()
    } else if upper.contains("BUSINESSES") {
        business_schema()
    } else if upper.contains("SERVICES") {
        service_schema()
    } else if upper.contains("SCHEDULES") {
        schedule_schema()
    } else if upper.contains("EMPLOYEES") {
        employee_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for TurnosHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.drain_notifications(client).await?;
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        metrics::counter!(
            observability::QUERIES_TOTAL,
            "command" => observability::command_label(&cmd)
        )
        .increment(1);
        let actor = self.resolve_actor(&engine, client);
        let started = Instant::now();
        let result = self.execute_command(&engine, actor, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TurnosQueryParser;

#[async_trait]
impl QueryParser for TurnosQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TurnosHandler {
    type Statement = String;
    type QueryParser = TurnosQueryParser;

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
        self.drain_notifications(client).await?;
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        metrics::counter!(
            observability::QUERIES_TOTAL,
            "command" => observability::command_label(&cmd)
        )
        .increment(1);
        let actor = self.resolve_actor(&engine, client);
        let started = Instant::now();
        let result = self.execute_command(&engine, actor, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        let mut responses = result?;
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
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

pub struct TurnosFactory {
    handler: Arc<TurnosHandler>,
    auth_handler: Arc<TurnosStartupHandler>,
    noop: Arc<NoopHandler>,
}

impl TurnosFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(TurnosHandler::new(tenant_manager)),
            auth_handler: Arc::new(TurnosStartupHandler::new(password)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TurnosFactory {
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

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

fn identity_err() -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "28000".into(),
        "the user startup parameter does not name a registered user".into(),
    )))
}
