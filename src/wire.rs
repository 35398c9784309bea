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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::{process_socket, TlsAcceptor};
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::{AuthError, ChairtimeAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct ChairtimeHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ChairtimeQueryParser>,
}

impl ChairtimeHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ChairtimeQueryParser),
        }
    }

    /// Run one parsed command and record its outcome.
    async fn run(&self, cmd: Command, format: &Format) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertStaff { id, name, granularity_min, active } => {
                engine
                    .create_staff(id, name, granularity_min, active)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::SetStaffActive { staff_id, active } => {
                engine.set_staff_active(staff_id, active).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::SetWorkingHours { staff_id, weekday, hours } => {
                engine
                    .set_working_hours(staff_id, weekday, Some(hours))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::ClearWorkingHours { staff_id, weekday } => {
                engine
                    .set_working_hours(staff_id, weekday, None)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::UpsertService(service) => {
                engine.upsert_service(service).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteService { id } => {
                engine.remove_service(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::InsertCustomer(customer) => {
                engine.register_customer(customer).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertBooking(req) => {
                debug!(booking = %req.id, staff = ?req.staff, "booking request");
                let booking = engine.create_booking(req).await.map_err(engine_err)?;
                Ok(vec![booking_rows(&engine.config.clock, format, vec![booking])])
            }
            Command::SetBookingStatus { id, status } => {
                engine.set_booking_status(id, status).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::SelectSlots { staff, date } => {
                let slots = engine.resolve_slots(staff, date).await.map_err(engine_err)?;
                let schema = Arc::new(slots_schema(format));
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.time.format("%H:%M").to_string())?;
                        encoder.encode_field(&slot.available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(id).await.map_err(engine_err)?;
                Ok(vec![booking_rows(&engine.config.clock, format, vec![booking])])
            }
            Command::SelectBookings { staff_id, date } => {
                let bookings = engine.list_bookings(staff_id, date).await.map_err(engine_err)?;
                Ok(vec![booking_rows(&engine.config.clock, format, bookings)])
            }
            Command::SelectStaff => {
                let staff = engine.list_staff().await;
                let schema = Arc::new(staff_schema(format));
                let rows: Vec<PgWireResult<_>> = staff
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&s.active)?;
                        encoder.encode_field(&(s.granularity_min as i32))?;
                        encoder.encode_field(&format_hours(&s.hours))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectServices => {
                let services = engine.list_services();
                let schema = Arc::new(services_schema(format));
                let rows: Vec<PgWireResult<_>> = services
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&(s.duration_min as i32))?;
                        encoder.encode_field(&s.price)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

/// `mon 10:00-13:00, tue 09:00-17:00`; closed days are left out.
fn format_hours(hours: &WeeklyHours) -> String {
    hours
        .iter()
        .map(|(day, h)| {
            format!(
                "{} {}-{}",
                day.to_string().to_lowercase(),
                h.start.format("%H:%M"),
                h.end.format("%H:%M")
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn booking_rows(clock: &BusinessClock, format: &Format, bookings: Vec<Commitment>) -> Response {
    let schema = Arc::new(bookings_schema(format));
    let clock = *clock;
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let local = clock.local(b.span.start);
            let date = local.map(|dt| dt.format("%Y-%m-%d").to_string());
            let time = local.map(|dt| dt.format("%H:%M").to_string());
            let services = b
                .services
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let guest_name = match &b.customer {
                CustomerRef::Guest { info, .. } => Some(info.name.clone()),
                CustomerRef::Account(_) => None,
            };
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.staff_id.to_string())?;
            encoder.encode_field(&date)?;
            encoder.encode_field(&time)?;
            encoder.encode_field(&(b.duration_min as i32))?;
            encoder.encode_field(&services)?;
            encoder.encode_field(&b.customer.id().to_string())?;
            encoder.encode_field(&guest_name)?;
            encoder.encode_field(&b.total_price)?;
            encoder.encode_field(&b.status.as_str().to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Schemas ──────────────────────────────────────────────────────

fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(idx))
        })
        .collect()
}

fn slots_schema(format: &Format) -> Vec<FieldInfo> {
    fields(&[("time", Type::VARCHAR), ("available", Type::BOOL)], format)
}

fn bookings_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("staff_id", Type::VARCHAR),
            ("date", Type::VARCHAR),
            ("time", Type::VARCHAR),
            ("duration", Type::INT4),
            ("services", Type::VARCHAR),
            ("customer_id", Type::VARCHAR),
            ("guest_name", Type::VARCHAR),
            ("total_price", Type::INT8),
            ("status", Type::VARCHAR),
        ],
        format,
    )
}

fn staff_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("active", Type::BOOL),
            ("granularity", Type::INT4),
            ("hours", Type::VARCHAR),
        ],
        format,
    )
}

fn services_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("duration", Type::INT4),
            ("price", Type::INT8),
        ],
        format,
    )
}

/// Row shape for a statement, before its parameters are bound.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    let reads = |table: &str| normalized.contains(&format!("FROM {table}"));
    if normalized.starts_with("INSERT INTO BOOKINGS ")
        || normalized.starts_with("INSERT INTO BOOKINGS(")
    {
        return bookings_schema(format);
    }
    if !normalized.starts_with("SELECT") {
        return vec![];
    }
    if reads("SLOTS") {
        slots_schema(format)
    } else if reads("BOOKINGS") {
        bookings_schema(format)
    } else if reads("STAFF") {
        staff_schema(format)
    } else if reads("SERVICES") {
        services_schema(format)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ChairtimeHandler {
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
        self.run(cmd, &Format::UnifiedText).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ChairtimeQueryParser;

#[async_trait]
impl QueryParser for ChairtimeQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ChairtimeHandler {
    type Statement = String;
    type QueryParser = ChairtimeQueryParser;

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
        let mut responses = self.run(cmd, &portal.result_column_format).await?;
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
            result_schema(&target.statement, &Format::UnifiedText),
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
            &target.result_column_format,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
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

/// Inline bound text parameters as quoted literals, highest index first so
/// `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ChairtimeFactory {
    handler: Arc<ChairtimeHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ChairtimeAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ChairtimeFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Result<Self, AuthError> {
        let auth_source = ChairtimeAuthSource::new(password)?;
        let param_provider = DefaultServerParameterProvider::default();
        Ok(Self {
            handler: Arc::new(ChairtimeHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        })
    }
}

impl PgWireServerHandlers for ChairtimeFactory {
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
    factory: Arc<ChairtimeFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) => "42704",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::NoCapacity { .. } => "53000",
        EngineError::DuplicateRequest(_) => "40001",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
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

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidValue(_) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
