use std::fmt::Debug;
use std::io;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{caller_from_client, RoombookAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

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

    /// Parse, execute and record metrics for one statement.
    async fn run<C: ClientInfo>(&self, client: &C, sql: &str, format: &Format) -> PgWireResult<Response> {
        let caller = caller_from_client(client)?;
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(&caller, cmd, format).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, caller: &CallerId, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertOffice { name, location } => {
                let office = engine.create_office(name, location).await.map_err(engine_err)?;
                Ok(office_rows(format, vec![office]))
            }
            Command::UpdateOffice { id, name, location } => {
                let office = engine.update_office(id, name, location).await.map_err(engine_err)?;
                Ok(office_rows(format, vec![office]))
            }
            Command::DeleteOffice { id } => {
                engine.delete_office(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectOffices { id: Some(id), filter, .. } => {
                let office = engine.get_office(id).map_err(engine_err)?;
                let offices = if filter.matches(&office) { vec![office] } else { vec![] };
                Ok(office_rows(format, offices))
            }
            Command::SelectOffices { id: None, filter, page } => {
                let page = engine.list_offices(&filter, page).map_err(engine_err)?;
                Ok(office_rows(format, page.items))
            }

            Command::InsertRoom { office_id, name, capacity } => {
                let room = engine.create_room(office_id, name, capacity).await.map_err(engine_err)?;
                Ok(room_rows(format, vec![room]))
            }
            Command::UpdateRoom { id, office_id, name, capacity } => {
                let room = engine
                    .update_room(id, office_id, name, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(room_rows(format, vec![room]))
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectRooms { id: Some(id), filter, .. } => {
                let room = engine.get_room(id).await.map_err(engine_err)?;
                let rooms = if filter.matches(&room) { vec![room] } else { vec![] };
                Ok(room_rows(format, rooms))
            }
            Command::SelectRooms { id: None, filter, page } => {
                let page = engine.list_rooms(&filter, page).await.map_err(engine_err)?;
                Ok(room_rows(format, page.items))
            }

            Command::InsertBooking { room_id, start, end } => {
                let booking = engine
                    .create_booking(caller, BookingRequest::new(room_id, start, end))
                    .await
                    .map_err(engine_err)?;
                Ok(booking_rows(format, vec![BookingInfo::from(&booking)]))
            }
            Command::UpdateBooking { id, room_id, start, end } => {
                let booking = engine
                    .update_booking(caller, id, BookingRequest::new(room_id, start, end))
                    .await
                    .map_err(engine_err)?;
                Ok(booking_rows(format, vec![BookingInfo::from(&booking)]))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(caller, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(caller, id).await.map_err(engine_err)?;
                Ok(booking_rows(format, vec![BookingInfo::from(&booking)]))
            }
            Command::SelectBookings { filter, page } => {
                let page = engine.list_bookings(caller, &filter, page).await.map_err(engine_err)?;
                Ok(booking_rows(format, page.items))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn office_schema(format: &Format) -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, format.format_for(0)),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, format.format_for(1)),
        FieldInfo::new("location".into(), None, None, Type::VARCHAR, format.format_for(2)),
    ]
}

fn room_schema(format: &Format) -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, format.format_for(0)),
        FieldInfo::new("office_id".into(), None, None, Type::VARCHAR, format.format_for(1)),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, format.format_for(2)),
        FieldInfo::new("capacity".into(), None, None, Type::INT8, format.format_for(3)),
    ]
}

fn booking_schema(format: &Format) -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, format.format_for(0)),
        FieldInfo::new("room_id".into(), None, None, Type::VARCHAR, format.format_for(1)),
        FieldInfo::new("user_id".into(), None, None, Type::VARCHAR, format.format_for(2)),
        FieldInfo::new("start_time".into(), None, None, Type::INT8, format.format_for(3)),
        FieldInfo::new("end_time".into(), None, None, Type::INT8, format.format_for(4)),
    ]
}

fn office_rows(format: &Format, offices: Vec<OfficeInfo>) -> Response {
    let schema = Arc::new(office_schema(format));
    let rows: Vec<PgWireResult<_>> = offices
        .into_iter()
        .map(|o| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&o.id.to_string())?;
            encoder.encode_field(&o.name)?;
            encoder.encode_field(&o.location)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn room_rows(format: &Format, rooms: Vec<RoomInfo>) -> Response {
    let schema = Arc::new(room_schema(format));
    let rows: Vec<PgWireResult<_>> = rooms
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.office_id.to_string())?;
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&r.capacity.map(i64::from))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn booking_rows(format: &Format, bookings: Vec<BookingInfo>) -> Response {
    let schema = Arc::new(booking_schema(format));
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.room_id.to_string())?;
            encoder.encode_field(&b.owner.as_str())?;
            encoder.encode_field(&b.start)?;
            encoder.encode_field(&b.end)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Row shape of a statement, decided from its verb and target table without
/// binding parameters. DELETE returns no rows.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let words: Vec<String> = sql
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();
    if words.first().map(String::as_str) == Some("delete") {
        return vec![];
    }
    let table = words
        .windows(2)
        .find(|w| matches!(w[0].as_str(), "from" | "into" | "update"))
        .map(|w| w[1].trim_matches('"'));
    match table {
        Some("offices") => office_schema(format),
        Some("rooms") => room_schema(format),
        Some("bookings") => booking_schema(format),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for RoombookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let response = self.run(client, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoombookQueryParser;

#[async_trait]
impl QueryParser for RoombookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
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
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        self.run(client, &sql, &portal.result_column_format).await
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

/// Highest `$N` placeholder in the SQL string.
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

/// Replace each `$N` with parameter N as a quoted literal (NULL when unset).
/// One left-to-right pass, so text inside a bound value is never rescanned.
/// Placeholders without a matching parameter are left as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => {
                out.push('$');
                out.push_str(&after[..digits]);
            }
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoombookFactory {
    handler: Arc<RoombookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<RoombookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoombookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = RoombookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoombookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
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
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(RoombookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::ResourceNotFound(_) => "23503",
        EngineError::InvalidInterval { .. } => "22023",
        EngineError::SchedulingConflict(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(_) = e {
        tracing::error!("{e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
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
