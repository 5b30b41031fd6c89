use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

use crate::auth::HouseAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::Topic;
use crate::observability;
use crate::sql::{self, Command, ReservationFilter};
use crate::tenant::TenantManager;

/// Per-connection state.
#[derive(Default)]
struct Session {
    /// Set once the caller's profile exists.
    profile_ready: bool,
    listeners: HashMap<Topic, broadcast::Receiver<Event>>,
}

/// One per connection, so it can carry the session.
pub struct WaschplanHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<WaschplanQueryParser>,
    session: Mutex<Session>,
}

impl WaschplanHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(WaschplanQueryParser),
            session: Mutex::new(Session::default()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let room = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&room)
            .map_err(|e| user_error("08006", format!("laundry room unavailable: {e}")))
    }

    fn identity<C: ClientInfo>(client: &C) -> PgWireResult<String> {
        client
            .metadata()
            .get("user")
            .filter(|u| !u.trim().is_empty())
            .cloned()
            .ok_or_else(|| engine_err(EngineError::NotAuthenticated))
    }

    /// Parse, run and meter one statement. Pending notifications go out first.
    async fn run_statement<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let identity = Self::identity(client)?;
        self.flush_notifications(client).await?;

        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.ensure_profile(&engine, &identity).await?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, &identity, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn ensure_profile(&self, engine: &Engine, identity: &str) -> PgWireResult<()> {
        let mut session = self.session.lock().await;
        if !session.profile_ready {
            engine.ensure_profile(identity).await.map_err(engine_err)?;
            session.profile_ready = true;
        }
        Ok(())
    }

    /// Send every event queued for this session's channels.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pending = {
            let mut session = self.session.lock().await;
            let mut pending = Vec::new();
            for (topic, rx) in session.listeners.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(event) => pending.push((*topic, event)),
                        Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                            warn!("listener on {} lagged, {missed} events dropped", topic.channel());
                        }
                        Err(_) => break,
                    }
                }
            }
            pending
        };
        if pending.is_empty() {
            return Ok(());
        }

        let pid = std::process::id() as i32;
        for (topic, event) in pending {
            let payload =
                serde_json::to_string(&event).map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            let message = NotificationResponse::new(pid, topic.channel().to_string(), payload);
            client
                .feed(PgWireBackendMessage::NotificationResponse(message))
                .await?;
        }
        client.flush().await?;
        Ok(())
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        identity: &str,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertReservation {
                id,
                start,
                end,
                returning,
            } => {
                let reservation = match id {
                    Some(id) => engine.insert_reservation(id, identity, start, end).await,
                    None => engine.create_reservation(identity, start, end).await,
                }
                .map_err(engine_err)?;
                if returning {
                    reservation_rows(engine, vec![reservation])
                } else {
                    Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
                }
            }
            Command::UpdateReservation { id, start, end } => {
                let current = engine.get_reservation(id).await.map_err(engine_err)?;
                engine
                    .update_reservation(
                        id,
                        identity,
                        start.unwrap_or(current.span.start),
                        end.unwrap_or(current.span.end),
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteReservation { id } => {
                engine
                    .delete_reservation(id, identity)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectReservations { filter } => {
                let reservations = match filter {
                    ReservationFilter::Range { from, to } => {
                        engine.list_in_range(from, to).await.map_err(engine_err)?
                    }
                    ReservationFilter::Week(t) => engine.list_week(t).await.map_err(engine_err)?,
                    ReservationFilter::Owner(owner) => engine.list_for_owner(&owner).await,
                    ReservationFilter::Id(id) => match engine.get_reservation(id).await {
                        Ok(r) => vec![r],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                };
                reservation_rows(engine, reservations)
            }
            Command::SelectProfiles { id } => {
                let profiles = match id {
                    Some(id) => engine.get_profile(&id).into_iter().collect(),
                    None => engine.list_profiles(),
                };
                profile_rows(engine, profiles)
            }
            Command::UpdateProfile { id, patch } => {
                engine
                    .update_profile(identity, &id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectAdmins => admin_rows(engine),
            Command::InsertAdmin { id } => {
                let added = engine.grant_admin(identity, &id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("INSERT").with_rows(usize::from(added)),
                )])
            }
            Command::DeleteAdmin { id } => {
                let removed = engine.revoke_admin(identity, &id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(removed)),
                )])
            }
            Command::Listen { channel } => {
                let topic = Topic::from_channel(&channel).ok_or_else(|| {
                    user_error(
                        "42704",
                        format!("unknown channel {channel} (expected reservations or profiles)"),
                    )
                })?;
                let mut session = self.session.lock().await;
                session
                    .listeners
                    .entry(topic)
                    .or_insert_with(|| engine.notify.subscribe(topic));
                debug!("{identity} listening on {}", topic.channel());
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                if let Some(topic) = Topic::from_channel(&channel) {
                    self.session.lock().await.listeners.remove(&topic);
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.session.lock().await.listeners.clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("owner_id", Type::VARCHAR),
        text_field("owner_name", Type::VARCHAR),
        text_field("owner_color", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("created_at", Type::INT8),
    ]
}

fn profile_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("display_name", Type::VARCHAR),
        text_field("color", Type::VARCHAR),
        text_field("is_admin", Type::BOOL),
        text_field("created_at", Type::INT8),
    ]
}

fn admin_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("configured", Type::BOOL),
    ]
}

/// Columns a statement will return, for Describe in the extended protocol.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let returns_rows = upper.trim_start().starts_with("SELECT") || upper.contains("RETURNING");
    if !returns_rows {
        vec![]
    } else if upper.contains("RESERVATIONS") {
        reservation_schema()
    } else if upper.contains("PROFILES") {
        profile_schema()
    } else if upper.contains("ADMINS") {
        admin_schema()
    } else {
        vec![]
    }
}

fn reservation_rows(engine: &Engine, reservations: Vec<Reservation>) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let owner = engine.get_profile(&r.owner_id);
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.owner_id)?;
            encoder.encode_field(&owner.as_ref().and_then(|p| p.display_name.clone()))?;
            encoder.encode_field(&owner.as_ref().and_then(|p| p.color.clone()))?;
            encoder.encode_field(&r.span.start)?;
            encoder.encode_field(&r.span.end)?;
            encoder.encode_field(&r.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
}

fn profile_rows(engine: &Engine, profiles: Vec<Profile>) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(profile_schema());
    let rows: Vec<PgWireResult<_>> = profiles
        .into_iter()
        .map(|p| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&p.id)?;
            encoder.encode_field(&p.display_name)?;
            encoder.encode_field(&p.color)?;
            encoder.encode_field(&engine.is_admin(&p.id))?;
            encoder.encode_field(&p.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
}

fn admin_rows(engine: &Engine) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(admin_schema());
    let configured = &engine.options().admins;
    let rows: Vec<PgWireResult<_>> = engine
        .list_admins()
        .into_iter()
        .map(|id| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&id)?;
            encoder.encode_field(&configured.contains(&id))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for WaschplanHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run_statement(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct WaschplanQueryParser;

#[async_trait]
impl QueryParser for WaschplanQueryParser {
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
impl ExtendedQueryHandler for WaschplanHandler {
    type Statement = String;
    type QueryParser = WaschplanQueryParser;

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
        let sql = substitute_params(portal);
        self.run_statement(client, &sql)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
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

/// Highest `$n` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    sql.split('$')
        .skip(1)
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

/// Replace each `$n` outside string literals with parameter `n` as quoted
/// text, in one pass. Bound values are never rescanned.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let digits_start = i + 1;
        let mut digits_end = digits_start;
        while let Some((j, d)) = chars.peek().copied() {
            if !d.is_ascii_digit() {
                break;
            }
            digits_end = j + 1;
            chars.next();
        }
        let param = sql[digits_start..digits_end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''");
                out.push('\'');
                out.push_str(&text);
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[i..digits_end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct WaschplanFactory {
    handler: Arc<WaschplanHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<HouseAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl WaschplanFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(WaschplanHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                HouseAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for WaschplanFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = WaschplanFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM admins"), 0);
        assert_eq!(
            count_params("SELECT * FROM reservations WHERE start >= $1 AND start < $2"),
            2
        );
        assert_eq!(count_params("UPDATE reservations SET start = $10 WHERE id = $3"), 10);
    }

    #[test]
    fn params_are_inlined_once() {
        let params = [Some("Wohnung $1"), Some("anna")];
        assert_eq!(
            inline_params("UPDATE profiles SET display_name = $1 WHERE id = $2", &params),
            "UPDATE profiles SET display_name = 'Wohnung $1' WHERE id = 'anna'"
        );
    }

    #[test]
    fn params_quote_nulls_and_double_digits() {
        let mut params: Vec<Option<&str>> = (1..=10).map(|_| Some("x")).collect();
        params[0] = Some("it's");
        params[9] = None;
        assert_eq!(
            inline_params("SELECT $1, $10, '$2', $11", &params),
            "SELECT 'it''s', NULL, '$2', $11"
        );
    }

    #[test]
    fn schema_follows_table() {
        assert_eq!(
            result_schema("select * from reservations where week = $1").len(),
            reservation_schema().len()
        );
        assert_eq!(
            result_schema("INSERT INTO reservations (start, \"end\") VALUES ($1, $2) RETURNING *")
                .len(),
            reservation_schema().len()
        );
        assert_eq!(result_schema("SELECT * FROM profiles").len(), 5);
        assert_eq!(result_schema("SELECT * FROM admins").len(), 2);
        assert!(result_schema("DELETE FROM reservations WHERE id = $1").is_empty());
        assert!(result_schema("LISTEN reservations").is_empty());
    }

    #[test]
    fn engine_errors_keep_their_sqlstate() {
        let err = engine_err(EngineError::Overlap(ulid::Ulid::new()));
        match err {
            PgWireError::UserError(info) => assert_eq!(info.code, "23P01"),
            other => panic!("expected user error, got {other:?}"),
        }
    }
}
