use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};
use ulid::Ulid;

use crate::engine::{ActionSource, Engine, EngineError, SearchHorizon, SlotRequest, Transition};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = ShiftlineFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// A LISTEN registration held by one connection.
struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Event>,
}

pub struct ShiftlineHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ShiftlineQueryParser>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ShiftlineHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ShiftlineQueryParser),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Execute and time one command, then flush any pending notifications
    /// for this connection ahead of the result.
    async fn run<C>(&self, client: &mut C, cmd: Command) -> PgWireResult<Response>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let label = command_label(&cmd);
        let started = std::time::Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());

        self.flush_notifications(client).await?;
        result
    }

    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let pending = {
            let mut subs = self.subscriptions.lock().await;
            let mut pending = Vec::new();
            for sub in subs.iter_mut() {
                loop {
                    match sub.rx.try_recv() {
                        Ok(event) => pending.push((sub.channel.clone(), event)),
                        Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                            tracing::warn!(channel = %sub.channel, skipped, "listener lagged, events dropped");
                        }
                        Err(_) => break,
                    }
                }
            }
            pending
        };

        let pid = std::process::id() as i32;
        for (channel, event) in pending {
            let payload = json!({ "event": event.name(), "data": event }).to_string();
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    pid, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertBusiness(business) => {
                engine.upsert_business(business).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertProvider(profile) => {
                engine.upsert_provider(profile).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteProvider { id } => {
                engine.deactivate_provider(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertWorkingHours { provider_id, hours } => {
                engine.set_working_hours(provider_id, hours).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertBreak { provider_id, brk } => {
                engine.add_break(provider_id, brk).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteBreak { id } => {
                engine.remove_break(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertSkill { provider_id, skill } => {
                engine.upsert_skill(provider_id, skill).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteSkill { provider_id, code } => {
                engine.remove_skill(provider_id, &code).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertClient(client) => {
                engine.upsert_client(client).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertAppointment(req) => {
                engine.book_appointment(req).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            // Repeats report zero rows so callers can tell a no-op apart.
            Command::StartAppointment { id } => {
                let t = engine.start_appointment(id, ActionSource::Manual).await.map_err(engine_err)?;
                Ok(inserted(applied_rows(&t)))
            }
            Command::EndAppointment { id } => {
                let t = engine.end_appointment(id, ActionSource::Manual).await.map_err(engine_err)?;
                Ok(inserted(applied_rows(&t)))
            }
            Command::CloseAppointment { id, reason } => {
                engine
                    .close_appointment(id, reason, ActionSource::Manual)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ShiftAppointment { id, provider_id } => {
                engine
                    .shift_appointment(id, provider_id, ActionSource::Manual)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SetPresence { provider_id, online } => {
                engine.set_presence(provider_id, online).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertTransfer { id, appointment_id, receiver_id } => {
                engine
                    .request_transfer(id, appointment_id, receiver_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ResolveTransfer { id, accept } => {
                engine
                    .resolve_transfer(id, accept, ActionSource::Manual)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ApplyReassignments { business_id, appointment_id } => {
                let selection: Option<Vec<Ulid>> = appointment_id.map(|id| vec![id]);
                let applied = engine
                    .apply_reassignments(business_id, selection.as_deref(), ActionSource::Manual)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(applied.len()))
            }
            Command::SelectBusinesses => {
                let schema = Arc::new(businesses_schema());
                Ok(query_rows(schema, engine.list_businesses(), |enc, b| {
                    enc.encode_field(&b.id.to_string())?;
                    enc.encode_field(&b.name)?;
                    enc.encode_field(&b.utc_offset_minutes)?;
                    enc.encode_field(&b.admin_contacts.join(","))?;
                    enc.encode_field(&b.rebalance_mode.as_str())?;
                    enc.encode_field(&(b.warning_pct as i64))?;
                    enc.encode_field(&(b.critical_pct as i64))
                }))
            }
            Command::SelectProviders { business_id } => {
                let providers = engine.list_providers(&business_id).await.map_err(engine_err)?;
                let schema = Arc::new(providers_schema());
                Ok(query_rows(schema, providers, |enc, p| {
                    let skills: Vec<&str> = p.skills.iter().map(|s| s.code.as_str()).collect();
                    enc.encode_field(&p.id.to_string())?;
                    enc.encode_field(&p.business_id.to_string())?;
                    enc.encode_field(&p.name)?;
                    enc.encode_field(&p.contact)?;
                    enc.encode_field(&(p.buffer.minutes as i32))?;
                    enc.encode_field(&skills.join(","))?;
                    enc.encode_field(&p.online)?;
                    enc.encode_field(&p.active)
                }))
            }
            Command::SelectAppointments { provider_id, business_id, day } => {
                let appointments = match (provider_id, business_id, day) {
                    (Some(p), _, day) => engine.list_appointments(&p, day).await,
                    (None, Some(b), Some(day)) => engine.business_day(&b, day).await,
                    _ => Err(EngineError::InvalidInput("appointments need provider_id or business_id and day")),
                }
                .map_err(engine_err)?;
                let schema = Arc::new(appointments_schema());
                Ok(query_rows(schema, appointments, |enc, a| {
                    enc.encode_field(&a.id.to_string())?;
                    enc.encode_field(&a.business_id.to_string())?;
                    enc.encode_field(&a.client_id.to_string())?;
                    enc.encode_field(&a.provider_id.to_string())?;
                    enc.encode_field(&a.scheduled_start)?;
                    enc.encode_field(&(a.duration_minutes as i64))?;
                    enc.encode_field(&a.treatment)?;
                    enc.encode_field(&a.status.as_str())?;
                    enc.encode_field(&a.actual_start)?;
                    enc.encode_field(&a.actual_end)?;
                    enc.encode_field(&(a.delay_minutes as i64))?;
                    enc.encode_field(&(a.notifications_sent as i32))?;
                    enc.encode_field(&a.reminder_sent)?;
                    enc.encode_field(&a.shifted_from_id.map(|id| id.to_string()))
                }))
            }
            Command::SelectTransfers { appointment_id } => {
                let schema = Arc::new(transfers_schema());
                Ok(query_rows(schema, engine.list_transfers(&appointment_id), |enc, t| {
                    enc.encode_field(&t.id.to_string())?;
                    enc.encode_field(&t.appointment_id.to_string())?;
                    enc.encode_field(&t.sender_id.to_string())?;
                    enc.encode_field(&t.receiver_id.to_string())?;
                    enc.encode_field(&t.status.as_str())
                }))
            }
            Command::SelectAvailability { provider_id, start, end } => {
                let windows = engine.free_windows(provider_id, start, end).await.map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let pid = provider_id.to_string();
                Ok(query_rows(schema, windows, |enc, w| {
                    enc.encode_field(&pid)?;
                    enc.encode_field(&w.start)?;
                    enc.encode_field(&w.end)
                }))
            }
            Command::SelectSlotCheck { provider_id, start, duration_minutes } => {
                let verdict = engine
                    .check_availability(provider_id, start, duration_minutes)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(slot_check_schema());
                Ok(query_rows(schema, [verdict], |enc, v| {
                    enc.encode_field(&provider_id.to_string())?;
                    enc.encode_field(&start)?;
                    enc.encode_field(&v.as_str())?;
                    enc.encode_field(&v.suggested())
                }))
            }
            Command::SelectNextSlot { provider_ids, after, duration_minutes, days } => {
                let horizon = days.map_or(SearchHorizon::SameDay, SearchHorizon::Days);
                let requests: Vec<SlotRequest> = provider_ids
                    .iter()
                    .map(|&provider_id| SlotRequest { provider_id, after, duration_minutes, horizon })
                    .collect();
                let found = engine.batch_find_slots(&requests).await.map_err(engine_err)?;
                let schema = Arc::new(next_slot_schema());
                Ok(query_rows(schema, provider_ids.into_iter().zip(found), |enc, (p, slot)| {
                    enc.encode_field(&p.to_string())?;
                    enc.encode_field(&slot)
                }))
            }
            Command::SelectReassignments { business_id } => {
                let proposals = engine.smart_reassignments(business_id).await.map_err(engine_err)?;
                let schema = Arc::new(reassignments_schema());
                Ok(query_rows(schema, proposals, |enc, r| {
                    enc.encode_field(&r.appointment_id.to_string())?;
                    enc.encode_field(&r.from_provider.to_string())?;
                    enc.encode_field(&r.to_provider.to_string())?;
                    enc.encode_field(&r.scheduled_start)?;
                    enc.encode_field(&(r.delay_minutes as i64))
                }))
            }
            Command::SelectHealth { business_id } => {
                let health = engine.system_health(business_id).await.map_err(engine_err)?;
                let schema = Arc::new(health_schema());
                Ok(query_rows(schema, [health], |enc, h| {
                    let at_risk: Vec<String> = h.at_risk.iter().map(|r| r.appointment_id.to_string()).collect();
                    enc.encode_field(&h.business_id.to_string())?;
                    enc.encode_field(&h.status.as_str())?;
                    enc.encode_field(&(h.online_providers as i64))?;
                    enc.encode_field(&(h.capacity_minutes as i64))?;
                    enc.encode_field(&(h.load_minutes as i64))?;
                    enc.encode_field(&h.load_pct.map(i64::from))?;
                    enc.encode_field(&at_risk.join(","))
                }))
            }
            Command::AcquireLease { business_id, holder } => {
                let acquired = engine.try_acquire_lease(business_id, &holder).await.map_err(engine_err)?;
                Ok(inserted(usize::from(acquired)))
            }
            Command::SelectLease { business_id } => {
                let lease = engine.lease_holder(&business_id);
                let now = engine.now_ms();
                let schema = Arc::new(leases_schema());
                Ok(query_rows(schema, lease, |enc, l| {
                    enc.encode_field(&business_id.to_string())?;
                    enc.encode_field(&l.holder)?;
                    enc.encode_field(&l.renewed_at)?;
                    enc.encode_field(&l.is_stale(now))
                }))
            }
            Command::Listen { channel } => {
                let id = channel_id(&channel)?;
                let mut subs = self.subscriptions.lock().await;
                if !subs.iter().any(|s| s.channel == channel) {
                    subs.push(Subscription {
                        rx: engine.notify.subscribe(id),
                        channel,
                    });
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                let mut subs = self.subscriptions.lock().await;
                match channel {
                    Some(channel) => subs.retain(|s| s.channel != channel),
                    None => subs.clear(),
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

fn applied_rows(t: &Transition) -> usize {
    match t {
        Transition::Applied(_) => 1,
        Transition::AlreadyApplied => 0,
    }
}

fn query_rows<T>(
    schema: Arc<Vec<FieldInfo>>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// `provider_<ulid>` or `business_<ulid>`.
fn channel_id(channel: &str) -> PgWireResult<Ulid> {
    let raw = channel
        .strip_prefix("provider_")
        .or_else(|| channel.strip_prefix("business_"))
        .ok_or_else(|| {
            user_error(
                "42000",
                format!("invalid channel: {channel} (expected provider_{{id}} or business_{{id}})"),
            )
        })?;
    Ulid::from_string(raw).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn businesses_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("utc_offset_minutes", Type::INT4),
        field("admin_contacts", Type::VARCHAR),
        field("rebalance_mode", Type::VARCHAR),
        field("warning_pct", Type::INT8),
        field("critical_pct", Type::INT8),
    ]
}

fn providers_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("business_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("contact", Type::VARCHAR),
        field("buffer_minutes", Type::INT4),
        field("skills", Type::VARCHAR),
        field("online", Type::BOOL),
        field("active", Type::BOOL),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("business_id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("provider_id", Type::VARCHAR),
        field("scheduled_start", Type::INT8),
        field("duration_minutes", Type::INT8),
        field("treatment", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("actual_start", Type::INT8),
        field("actual_end", Type::INT8),
        field("delay_minutes", Type::INT8),
        field("notifications_sent", Type::INT4),
        field("reminder_sent", Type::BOOL),
        field("shifted_from_id", Type::VARCHAR),
    ]
}

fn transfers_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("appointment_id", Type::VARCHAR),
        field("sender_id", Type::VARCHAR),
        field("receiver_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("provider_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn slot_check_schema() -> Vec<FieldInfo> {
    vec![
        field("provider_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("status", Type::VARCHAR),
        field("suggested", Type::INT8),
    ]
}

fn next_slot_schema() -> Vec<FieldInfo> {
    vec![field("provider_id", Type::VARCHAR), field("start", Type::INT8)]
}

fn reassignments_schema() -> Vec<FieldInfo> {
    vec![
        field("appointment_id", Type::VARCHAR),
        field("from_provider", Type::VARCHAR),
        field("to_provider", Type::VARCHAR),
        field("scheduled_start", Type::INT8),
        field("delay_minutes", Type::INT8),
    ]
}

fn health_schema() -> Vec<FieldInfo> {
    vec![
        field("business_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("online_providers", Type::INT8),
        field("capacity_minutes", Type::INT8),
        field("load_minutes", Type::INT8),
        field("load_pct", Type::INT8),
        field("at_risk", Type::VARCHAR),
    ]
}

fn leases_schema() -> Vec<FieldInfo> {
    vec![
        field("business_id", Type::VARCHAR),
        field("holder", Type::VARCHAR),
        field("renewed_at", Type::INT8),
        field("stale", Type::BOOL),
    ]
}

/// Result columns for a statement, judged from the table after FROM.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let lower = stmt.to_lowercase();
    let mut words = lower.split_whitespace();
    if words.next() != Some("select") {
        return vec![];
    }
    let table = words
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c| c == '"' || c == ';'));
    match table {
        Some("businesses") => businesses_schema(),
        Some("providers") => providers_schema(),
        Some("appointments") => appointments_schema(),
        Some("transfers") => transfers_schema(),
        Some("availability") => availability_schema(),
        Some("slot_check") => slot_check_schema(),
        Some("next_slot") => next_slot_schema(),
        Some("reassignments") => reassignments_schema(),
        Some("health") => health_schema(),
        Some("leases") => leases_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ShiftlineHandler {
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
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            match self.run(client, cmd).await {
                Ok(response) => responses.push(response),
                // Statements before the failure stay applied; the rest of
                // the batch is skipped.
                Err(PgWireError::UserError(info)) if !responses.is_empty() => {
                    responses.push(Response::Error(info));
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ShiftlineQueryParser;

#[async_trait]
impl QueryParser for ShiftlineQueryParser {
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
impl ExtendedQueryHandler for ShiftlineHandler {
    type Statement = String;
    type QueryParser = ShiftlineQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(client, cmd).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so $1 never clobbers the prefix of $10.
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

/// One shared password for every login.
#[derive(Debug)]
pub struct SharedPassword(Vec<u8>);

#[async_trait]
impl AuthSource for SharedPassword {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.0.clone()))
    }
}

/// Handlers for one connection. Each connection gets its own factory so
/// LISTEN state stays per session.
pub struct ShiftlineFactory {
    handler: Arc<ShiftlineHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ShiftlineFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = SharedPassword(password.into_bytes());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ShiftlineHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ShiftlineFactory {
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

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE per engine error, so clients can branch without parsing text.
fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidTransition { .. } | EngineError::Inactive(_) => "55000",
        EngineError::Unavailable(_) => "23P01",
        EngineError::InvalidInput(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    };
    user_error(code, e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM health WHERE business_id = $1"), 1);
        assert_eq!(count_params("INSERT INTO appointments VALUES ($1, $2, $3, $10)"), 10);
        assert_eq!(count_params("SELECT * FROM businesses"), 0);
    }

    #[test]
    fn schema_follows_from_table() {
        let names = |s: Vec<FieldInfo>| s.iter().map(|f| f.name().to_string()).collect::<Vec<_>>();
        assert_eq!(
            names(result_schema("SELECT * FROM next_slot WHERE provider_id = $1")),
            vec!["provider_id", "start"]
        );
        assert_eq!(result_schema("select * from \"health\";").len(), 7);
        assert!(result_schema("INSERT INTO starts VALUES ($1)").is_empty());
        assert!(result_schema("SELECT * FROM nowhere").is_empty());
        assert_eq!(
            names(result_schema("SELECT * FROM leases WHERE business_id = $1")),
            vec!["business_id", "holder", "renewed_at", "stale"]
        );
    }

    #[test]
    fn channel_prefixes() {
        let id = Ulid::new();
        assert_eq!(channel_id(&format!("provider_{id}")).unwrap(), id);
        assert_eq!(channel_id(&format!("business_{id}")).unwrap(), id);
        assert!(channel_id(&format!("resource_{id}")).is_err());
        assert!(channel_id("provider_nope").is_err());
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let code = |e: EngineError| match engine_err(e) {
            PgWireError::UserError(info) => info.code.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(code(EngineError::NotFound(Ulid::nil())), "P0002");
        assert_eq!(code(EngineError::LimitExceeded("batch too large")), "54000");
        assert_eq!(code(EngineError::InvalidInput("bad")), "22023");
    }
}
