use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime};
use futures::{Sink, SinkExt, stream};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
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

use crate::engine::{Engine, EngineError, proclamation_sundays};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ProclamationTarget, SqlError};

static NEXT_PID: AtomicI32 = AtomicI32::new(1);

// ── Authentication ───────────────────────────────────────────────

/// Every connection authenticates with the one shared password.
#[derive(Debug)]
pub struct BannsAuthSource {
    password: String,
}

impl BannsAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for BannsAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(user = login.user().unwrap_or_default(), "password login");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Query handler ────────────────────────────────────────────────

/// One per connection: holds the connection's LISTEN subscriptions.
pub struct BannsHandler {
    engine: Arc<Engine>,
    query_parser: Arc<BannsQueryParser>,
    pid: i32,
    listening: Mutex<HashMap<MonthKey, broadcast::Receiver<Event>>>,
}

impl BannsHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(BannsQueryParser),
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            listening: Mutex::new(HashMap::new()),
        }
    }

    async fn run(&self, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    /// Forward calendar changes seen since the last statement. Delivery
    /// happens between statements because the protocol loop owns the socket.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listening = self.listening.lock().await;
            for (month, rx) in listening.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(event) => pending.push((month.channel(), event_payload(&event))),
                        Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                            tracing::warn!(channel = %month.channel(), skipped, "listener lagged");
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    self.pid, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        let now = Local::now().naive_local();
        let today = now.date();
        match cmd {
            Command::InsertWedding { draft } => {
                let wedding = engine.schedule_wedding(draft, today).await.map_err(engine_err)?;
                Ok(vec![wedding_rows(&[wedding])?])
            }
            Command::UpdateWedding { id, changes } => {
                if changes.is_status_only() {
                    if let Some(status) = changes.status {
                        engine.set_wedding_status(id, status).await.map_err(engine_err)?;
                    }
                } else {
                    let current = engine.wedding(id).await.map_err(engine_err)?;
                    let draft = changes.apply(&current);
                    engine
                        .update_wedding(id, draft, changes.status, today)
                        .await
                        .map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteWedding { id } => {
                engine.delete_wedding(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectWeddings { id, filter } => {
                let weddings = match id {
                    Some(id) => match engine.wedding(id).await {
                        Ok(w) if filter.matches(&w) => vec![w],
                        Ok(_) | Err(EngineError::WeddingNotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => engine.search_weddings(&filter).await,
                };
                Ok(vec![wedding_rows(&weddings)?])
            }
            Command::SelectConflicts { candidate, exclude } => {
                let conflicts = engine.evaluate(&candidate, exclude).await.map_err(engine_err)?;
                let schema = Arc::new(conflict_schema());
                let rows: Vec<PgWireResult<_>> = conflicts
                    .iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.kind.code().to_string())?;
                        encoder.encode_field(&c.kind.field().to_string())?;
                        encoder.encode_field(&c.message)?;
                        encoder.encode_field(&c.conflicting_wedding.map(|id| id.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectProclamations { target } => {
                let date = match target {
                    ProclamationTarget::Date(date) => date,
                    ProclamationTarget::Wedding(id) => {
                        engine.wedding(id).await.map_err(engine_err)?.slot.wedding_date
                    }
                };
                let sundays = proclamation_sundays(date);
                let schema = Arc::new(proclamation_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&fmt_date(date))?;
                encoder.encode_field(&fmt_date(sundays.first))?;
                encoder.encode_field(&fmt_date(sundays.second))?;
                encoder.encode_field(&fmt_date(sundays.third))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectCalendar { month } => {
                let days = engine.month_calendar(month).await;
                let schema = Arc::new(calendar_schema());
                let mut rows = Vec::new();
                for day in &days {
                    for w in &day.weddings {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&fmt_date(day.date))?;
                        encoder.encode_field(&w.slot.wedding_time.format("%H:%M").to_string())?;
                        encoder.encode_field(&w.id.to_string())?;
                        encoder.encode_field(&w.couple_label())?;
                        encoder.encode_field(&w.slot.location_id)?;
                        encoder.encode_field(&w.slot.celebrant_id)?;
                        encoder.encode_field(&w.slot.is_community)?;
                        encoder.encode_field(&w.status.as_str().to_string())?;
                        rows.push(Ok(encoder.take_row()));
                    }
                }
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectStatistics { month } => {
                let stats = engine.statistics(month).await;
                let schema = Arc::new(statistics_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(stats.total_scheduled as i64))?;
                encoder.encode_field(&(stats.month_scheduled as i64))?;
                encoder.encode_field(&(stats.month_community as i64))?;
                encoder.encode_field(&(stats.month_civil_effect as i64))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectReminders { at } => {
                let due = engine.due_reminders(at.unwrap_or(now)).await.map_err(engine_err)?;
                let schema = Arc::new(reminder_schema());
                let mut rows = Vec::with_capacity(due.len());
                for reminder in &due {
                    let message = engine.render_reminder(reminder).await.map_err(engine_err)?;
                    let to: Vec<&str> = message.recipients.iter().map(|r| r.phone.as_str()).collect();
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&reminder.wedding_id.to_string())?;
                    encoder.encode_field(&reminder.kind.code().to_string())?;
                    encoder.encode_field(&fmt_datetime(reminder.due_at))?;
                    encoder.encode_field(&fmt_datetime(reminder.target_at))?;
                    encoder.encode_field(&message.title)?;
                    encoder.encode_field(&to.join(","))?;
                    rows.push(Ok(encoder.take_row()));
                }
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertLocation { name, address, capacity } => {
                let location = engine.add_location(name, address, capacity).await.map_err(engine_err)?;
                Ok(vec![location_rows(&[location])?])
            }
            Command::UpdateLocation { id, changes } => {
                if changes.touches_details() {
                    let current = engine.location(id).map_err(engine_err)?;
                    engine
                        .update_location(
                            id,
                            changes.name.unwrap_or(current.name),
                            changes.address.unwrap_or(current.address),
                            changes.capacity.unwrap_or(current.capacity),
                        )
                        .await
                        .map_err(engine_err)?;
                }
                if let Some(active) = changes.is_active {
                    engine.set_location_active(id, active).await.map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectLocations { is_active } => {
                let locations: Vec<Location> = engine
                    .locations(true)
                    .into_iter()
                    .filter(|l| is_active.is_none_or(|a| l.is_active == a))
                    .collect();
                Ok(vec![location_rows(&locations)?])
            }
            Command::InsertCelebrant { name, title, phone } => {
                let celebrant = engine.add_celebrant(name, title, phone).await.map_err(engine_err)?;
                Ok(vec![celebrant_rows(&[celebrant])?])
            }
            Command::UpdateCelebrant { id, changes } => {
                if changes.touches_details() {
                    let current = engine.celebrant(id).map_err(engine_err)?;
                    engine
                        .update_celebrant(
                            id,
                            changes.name.unwrap_or(current.name),
                            changes.title.unwrap_or(current.title),
                            changes.phone.unwrap_or(current.phone),
                        )
                        .await
                        .map_err(engine_err)?;
                }
                if let Some(active) = changes.is_active {
                    engine.set_celebrant_active(id, active).await.map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectCelebrants { is_active } => {
                let celebrants: Vec<Celebrant> = engine
                    .celebrants(true)
                    .into_iter()
                    .filter(|c| is_active.is_none_or(|a| c.is_active == a))
                    .collect();
                Ok(vec![celebrant_rows(&celebrants)?])
            }
            Command::SetConfig { entries } => {
                let count = entries.len();
                for (key, value) in entries {
                    engine.set_config(key, value).await.map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
            }
            Command::SelectConfig { key } => {
                let entries: Vec<ConfigEntry> = engine
                    .config_entries()
                    .into_iter()
                    .filter(|e| key.as_ref().is_none_or(|k| &e.key == k))
                    .collect();
                let schema = Arc::new(config_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.key)?;
                        encoder.encode_field(&e.value)?;
                        encoder.encode_field(&e.kind.as_str().to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Listen { channel } => {
                let month = MonthKey::from_channel(&channel).ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected month_YYYY_MM)"),
                    )))
                })?;
                let mut listening = self.listening.lock().await;
                listening
                    .entry(month)
                    .or_insert_with(|| engine.notify.subscribe(month));
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                if let Some(month) = MonthKey::from_channel(&channel) {
                    self.listening.lock().await.remove(&month);
                }
                engine.notify.prune();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.listening.lock().await.clear();
                engine.notify.prune();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

/// JSON body of a calendar notification.
fn event_payload(event: &Event) -> String {
    let body = match event {
        Event::WeddingScheduled { wedding } | Event::WeddingUpdated { wedding } => serde_json::json!({
            "type": if matches!(event, Event::WeddingScheduled { .. }) { "scheduled" } else { "updated" },
            "wedding_id": wedding.id.to_string(),
            "wedding_date": fmt_date(wedding.slot.wedding_date),
            "wedding_time": wedding.slot.wedding_time.format("%H:%M").to_string(),
            "status": wedding.status.as_str(),
        }),
        Event::WeddingStatusChanged { id, status } => serde_json::json!({
            "type": "status_changed",
            "wedding_id": id.to_string(),
            "status": status.as_str(),
        }),
        Event::WeddingDeleted { id } => serde_json::json!({
            "type": "deleted",
            "wedding_id": id.to_string(),
        }),
        _ => serde_json::json!({ "type": "other" }),
    };
    body.to_string()
}

fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn fmt_datetime(at: NaiveDateTime) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

// ── Row schemas ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn wedding_schema() -> Vec<FieldInfo> {
    vec![
        field("wedding_id", Type::VARCHAR),
        field("wedding_date", Type::VARCHAR),
        field("wedding_time", Type::VARCHAR),
        field("location_id", Type::INT8),
        field("celebrant_id", Type::INT8),
        field("is_community", Type::BOOL),
        field("status", Type::VARCHAR),
        field("interview_at", Type::VARCHAR),
        field("bride_name", Type::VARCHAR),
        field("bride_whatsapp", Type::VARCHAR),
        field("groom_name", Type::VARCHAR),
        field("groom_whatsapp", Type::VARCHAR),
        field("with_civil_effect", Type::BOOL),
        field("transfer_type", Type::VARCHAR),
        field("observations", Type::VARCHAR),
        field("scheduled_on", Type::VARCHAR),
    ]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![
        field("conflict_type", Type::VARCHAR),
        field("field", Type::VARCHAR),
        field("message", Type::VARCHAR),
        field("conflicting_wedding_id", Type::VARCHAR),
    ]
}

fn proclamation_schema() -> Vec<FieldInfo> {
    vec![
        field("wedding_date", Type::VARCHAR),
        field("first_sunday", Type::VARCHAR),
        field("second_sunday", Type::VARCHAR),
        field("third_sunday", Type::VARCHAR),
    ]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        field("wedding_date", Type::VARCHAR),
        field("wedding_time", Type::VARCHAR),
        field("wedding_id", Type::VARCHAR),
        field("couple", Type::VARCHAR),
        field("location_id", Type::INT8),
        field("celebrant_id", Type::INT8),
        field("is_community", Type::BOOL),
        field("status", Type::VARCHAR),
    ]
}

fn statistics_schema() -> Vec<FieldInfo> {
    vec![
        field("total_scheduled", Type::INT8),
        field("month_scheduled", Type::INT8),
        field("month_community", Type::INT8),
        field("month_civil_effect", Type::INT8),
    ]
}

fn reminder_schema() -> Vec<FieldInfo> {
    vec![
        field("wedding_id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("due_at", Type::VARCHAR),
        field("target_at", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("recipients", Type::VARCHAR),
    ]
}

fn location_schema() -> Vec<FieldInfo> {
    vec![
        field("location_id", Type::INT8),
        field("name", Type::VARCHAR),
        field("address", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("is_active", Type::BOOL),
    ]
}

fn celebrant_schema() -> Vec<FieldInfo> {
    vec![
        field("celebrant_id", Type::INT8),
        field("name", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("is_active", Type::BOOL),
    ]
}

fn config_schema() -> Vec<FieldInfo> {
    vec![
        field("config_key", Type::VARCHAR),
        field("config_value", Type::VARCHAR),
        field("config_type", Type::VARCHAR),
    ]
}

fn wedding_rows(weddings: &[Wedding]) -> PgWireResult<Response> {
    let schema = Arc::new(wedding_schema());
    let mut rows = Vec::with_capacity(weddings.len());
    for w in weddings {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&w.id.to_string())?;
        encoder.encode_field(&fmt_date(w.slot.wedding_date))?;
        encoder.encode_field(&w.slot.wedding_time.format("%H:%M").to_string())?;
        encoder.encode_field(&w.slot.location_id)?;
        encoder.encode_field(&w.slot.celebrant_id)?;
        encoder.encode_field(&w.slot.is_community)?;
        encoder.encode_field(&w.status.as_str().to_string())?;
        encoder.encode_field(&w.interview_at.map(fmt_datetime))?;
        encoder.encode_field(&w.couple.bride_name)?;
        encoder.encode_field(&w.couple.bride_whatsapp)?;
        encoder.encode_field(&w.couple.groom_name)?;
        encoder.encode_field(&w.couple.groom_whatsapp)?;
        encoder.encode_field(&w.with_civil_effect)?;
        encoder.encode_field(&w.transfer_type.as_str().to_string())?;
        encoder.encode_field(&w.observations)?;
        encoder.encode_field(&fmt_date(w.scheduled_on))?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn location_rows(locations: &[Location]) -> PgWireResult<Response> {
    let schema = Arc::new(location_schema());
    let mut rows = Vec::with_capacity(locations.len());
    for l in locations {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&l.id)?;
        encoder.encode_field(&l.name)?;
        encoder.encode_field(&l.address)?;
        encoder.encode_field(&l.capacity.map(i64::from))?;
        encoder.encode_field(&l.is_active)?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn celebrant_rows(celebrants: &[Celebrant]) -> PgWireResult<Response> {
    let schema = Arc::new(celebrant_schema());
    let mut rows = Vec::with_capacity(celebrants.len());
    for c in celebrants {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&c.id)?;
        encoder.encode_field(&c.name)?;
        encoder.encode_field(&c.title)?;
        encoder.encode_field(&c.phone)?;
        encoder.encode_field(&c.is_active)?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns of a statement, judged from its text. Used to describe
/// prepared statements before their parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let table_after = |keyword: &str| {
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(|t| t.trim_matches('"'))
    };
    match words.first().copied() {
        Some("select") => match table_after("from") {
            Some("weddings") => wedding_schema(),
            Some("conflicts") => conflict_schema(),
            Some("proclamations") => proclamation_schema(),
            Some("calendar") => calendar_schema(),
            Some("statistics") => statistics_schema(),
            Some("reminders") => reminder_schema(),
            Some("locations") => location_schema(),
            Some("celebrants") => celebrant_schema(),
            Some("system_config") => config_schema(),
            _ => vec![],
        },
        Some("insert") => match table_after("into") {
            Some("weddings") => wedding_schema(),
            Some("locations") => location_schema(),
            Some("celebrants") => celebrant_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for BannsHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let result = self.run(query).await;
        self.flush_notifications(client).await?;
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BannsQueryParser;

#[async_trait]
impl QueryParser for BannsQueryParser {
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

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BannsHandler {
    type Statement = String;
    type QueryParser = BannsQueryParser;

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
        let result = self.run(&sql).await;
        self.flush_notifications(client).await?;
        result?
            .into_iter()
            .next()
            .ok_or_else(|| PgWireError::ApiError("statement produced no response".into()))
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
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
    let mut result = portal.statement.statement.clone();
    // Highest index first so $1 does not clobber $10.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BannsFactory {
    handler: Arc<BannsHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<BannsAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BannsFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(BannsHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                BannsAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BannsFactory {
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

/// Serve one client connection until it closes. Each connection gets its
/// own handler, so LISTEN subscriptions end with the connection.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let notify = engine.notify.clone();
    let factory = Arc::new(BannsFactory::new(engine, password));
    let result = pgwire::tokio::process_socket(socket, tls, factory).await;
    notify.prune();
    result
}

// ── Error mapping ────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflicts(_) | EngineError::SlotTaken(_) => "23P01",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) => "22023",
        EngineError::WeddingNotFound(_) | EngineError::LocationNotFound(_) | EngineError::CelebrantNotFound(_) => {
            "P0002"
        }
        EngineError::ConfigUnavailable(_) | EngineError::StoreQueryFailed(_) | EngineError::WalError(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) => "42703",
        SqlError::BadValue(_) => "22P02",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM weddings"), 0);
        assert_eq!(count_params("SELECT * FROM weddings WHERE location_id = $2 AND name = $1"), 2);
        assert_eq!(count_params("UPDATE weddings SET status = $10"), 10);
    }

    #[test]
    fn schemas_follow_the_table() {
        let names = |fields: Vec<FieldInfo>| -> Vec<String> { fields.iter().map(|f| f.name().to_string()).collect() };
        assert_eq!(
            names(result_schema("SELECT * FROM conflicts WHERE wedding_date = $1")),
            vec!["conflict_type", "field", "message", "conflicting_wedding_id"]
        );
        assert_eq!(names(result_schema("insert into celebrants (name, title) values ($1, $2)"))[0], "celebrant_id");
        assert!(result_schema("DELETE FROM weddings WHERE wedding_id = $1").is_empty());
        assert!(result_schema("LISTEN month_2040_06").is_empty());
    }

    #[test]
    fn engine_errors_map_to_sqlstates() {
        assert_eq!(sqlstate(&EngineError::Conflicts(vec![])), "23P01");
        assert_eq!(sqlstate(&EngineError::SlotTaken(Ulid::new())), "23P01");
        assert_eq!(sqlstate(&EngineError::AlreadyExists("x".into())), "23505");
        assert_eq!(sqlstate(&EngineError::invalid("bride_name", "required")), "22023");
        assert_eq!(sqlstate(&EngineError::WeddingNotFound(Ulid::new())), "P0002");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "P0001");
    }

    #[test]
    fn notification_payload_is_json() {
        let id = Ulid::new();
        let payload = event_payload(&Event::WeddingStatusChanged {
            id,
            status: WeddingStatus::Cancelled,
        });
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["type"], "status_changed");
        assert_eq!(parsed["wedding_id"], id.to_string());
        assert_eq!(parsed["status"], "CANCELLED");
    }
}
