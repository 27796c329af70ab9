use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use pgwire::messages::data::DataRow;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::InnkeepAuthSource;
use crate::calendar::FeedFetcher;
use crate::engine::{BookingRequest, Engine, EngineError, now_ms};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, PaymentCallback};

pub struct InnkeepHandler {
    engine: Arc<Engine>,
    fetcher: Arc<dyn FeedFetcher>,
    query_parser: Arc<InnkeepQueryParser>,
}

impl InnkeepHandler {
    pub fn new(engine: Arc<Engine>, fetcher: Arc<dyn FeedFetcher>) -> Self {
        Self {
            engine,
            fetcher,
            query_parser: Arc::new(InnkeepQueryParser),
        }
    }

    /// The login user is the caller's identity for every ownership check.
    fn session_user<C: ClientInfo>(&self, client: &C) -> PgWireResult<String> {
        client
            .metadata()
            .get(pgwire::api::METADATA_USER)
            .filter(|u| !u.is_empty())
            .cloned()
            .ok_or_else(|| user_error("28000", "no user in startup message".into()))
    }

    async fn run(&self, actor: &str, sql: &str) -> PgWireResult<Vec<Response>> {
        let started = Instant::now();
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Arrivals and departures are recorded by the host only.
    async fn require_booking_owner(&self, booking_id: Ulid, actor: &str) -> PgWireResult<()> {
        let booking = self
            .engine
            .get_booking(&booking_id)
            .await
            .ok_or(EngineError::NotFound(booking_id))
            .map_err(engine_err)?;
        let property = self
            .engine
            .get_property(&booking.property_id)
            .await
            .ok_or(EngineError::NotFound(booking.property_id))
            .map_err(engine_err)?;
        if property.owner != actor {
            return Err(engine_err(EngineError::Forbidden("only the property owner can record arrivals")));
        }
        Ok(())
    }

    async fn require_owner_of(&self, property_id: Ulid, actor: &str) -> PgWireResult<Property> {
        let property = self
            .engine
            .get_property(&property_id)
            .await
            .ok_or(EngineError::NotFound(property_id))
            .map_err(engine_err)?;
        if property.owner != actor {
            return Err(engine_err(EngineError::Forbidden("only the property owner can see this")));
        }
        Ok(property)
    }

    async fn execute_command(&self, actor: &str, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertProperty {
                id,
                capacity,
                base_rate,
                changes,
            } => {
                let mut property = Property::new(id, actor, capacity, base_rate);
                changes.apply_to(&mut property);
                engine.create_property(property).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::UpdateProperty { id, changes } => {
                let mut property = engine
                    .get_property(&id)
                    .await
                    .ok_or(EngineError::NotFound(id))
                    .map_err(engine_err)?;
                changes.apply_to(&mut property);
                engine.update_property(property, actor).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::DeleteProperty { id } => {
                match engine.delete_property(id, actor).await {
                    Ok(()) => {}
                    Err(EngineError::HasBookings(_)) => {
                        // Booking history must survive; the listing is withdrawn instead.
                        engine.set_property_active(id, false, actor).await.map_err(engine_err)?;
                        tracing::info!("property {id} has bookings; deactivated instead of deleted");
                    }
                    Err(e) => return Err(engine_err(e)),
                }
                Ok(vec![deleted(1)])
            }
            Command::InsertPricingRule { rule } => {
                engine.add_pricing_rule(rule, actor).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::DeletePricingRule { id } => {
                engine.remove_pricing_rule(id, actor).await.map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::InsertBlock { id, property_id, range } => {
                engine.add_block(id, property_id, range, actor).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::DeleteBlock { id } => {
                engine.remove_block(id, actor).await.map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::InsertBooking {
                property_id,
                range,
                guests,
                idempotency_key,
            } => {
                let request = BookingRequest {
                    property_id,
                    guest: actor.to_string(),
                    range,
                    guests,
                    idempotency_key,
                };
                let outcome = engine.create_booking(request, now_ms()).await.map_err(engine_err)?;
                Ok(vec![booking_response(&[outcome.booking])?])
            }
            Command::CancelBooking { id } => {
                let outcome = engine.cancel_booking(id, actor).await.map_err(engine_err)?;
                Ok(vec![deleted(usize::from(outcome.changed))])
            }
            Command::Approve { booking_id } => {
                let outcome = engine.approve(booking_id, actor).await.map_err(engine_err)?;
                Ok(vec![booking_response(&[outcome.booking])?])
            }
            Command::Decline { booking_id } => {
                let outcome = engine.decline(booking_id, actor).await.map_err(engine_err)?;
                Ok(vec![booking_response(&[outcome.booking])?])
            }
            Command::CheckIn { booking_id } => {
                self.require_booking_owner(booking_id, actor).await?;
                let booking = engine.check_in(booking_id, now_ms()).await.map_err(engine_err)?;
                Ok(vec![booking_response(&[booking])?])
            }
            Command::CheckOut { booking_id } => {
                self.require_booking_owner(booking_id, actor).await?;
                let booking = engine.complete(booking_id, now_ms()).await.map_err(engine_err)?;
                Ok(vec![booking_response(&[booking])?])
            }
            Command::Payment { .. } if actor != engine.config.payment_user => {
                tracing::warn!("payment callback from {actor} rejected");
                metrics::counter!(observability::PAYMENT_CALLBACKS_TOTAL, "result" => "forbidden").increment(1);
                Err(engine_err(EngineError::Forbidden("only the payment provider can report payments")))
            }
            Command::Payment { callback } => match callback {
                PaymentCallback::Malformed(why) => {
                    tracing::warn!("malformed payment callback from {actor} ignored: {why}");
                    metrics::counter!(observability::PAYMENT_CALLBACKS_TOTAL, "result" => "malformed").increment(1);
                    Ok(vec![inserted(0)])
                }
                PaymentCallback::Result { booking_id, result } => {
                    match engine.record_payment(booking_id, result, now_ms()).await {
                        Ok(outcome) => Ok(vec![inserted(usize::from(outcome.changed))]),
                        Err(EngineError::NotFound(_)) => {
                            tracing::warn!("payment callback for unknown booking {booking_id} ignored");
                            metrics::counter!(observability::PAYMENT_CALLBACKS_TOTAL, "result" => "unknown")
                                .increment(1);
                            Ok(vec![inserted(0)])
                        }
                        Err(e) => Err(engine_err(e)),
                    }
                }
            },
            Command::InsertCalendarLink {
                id,
                property_id,
                url,
                direction,
                policy,
            } => {
                let link = engine
                    .add_calendar_link(id, property_id, url, direction, policy, actor, now_ms())
                    .await
                    .map_err(engine_err)?;
                if link.direction.imports() {
                    let engine = engine.clone();
                    let fetcher = self.fetcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = engine.sync_import(id, fetcher.as_ref(), now_ms()).await {
                            tracing::debug!("initial sync of link {id} skipped: {e}");
                        }
                    });
                }
                Ok(vec![inserted(1)])
            }
            Command::DeleteCalendarLink { id, clear } => {
                engine.remove_calendar_link(id, clear, actor).await.map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::SelectAvailability { property_id, range } => {
                let slots = engine.availability(property_id, range).await.map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let rows = slots
                    .iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.property_id.to_string())?;
                        encoder.encode_field(&slot.date.to_string())?;
                        encoder.encode_field(&slot.status.as_str())?;
                        encoder.encode_field(&slot.price.to_string())?;
                        encoder.encode_field(&slot.source.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectPriceQuote {
                property_id,
                range,
                guests,
            } => {
                let quote = engine.price_quote(property_id, range, guests).await.map_err(engine_err)?;
                let per_night = serde_json::to_string(&quote.per_night)
                    .map_err(|e| user_error("XX000", format!("cannot encode nightly rates: {e}")))?;
                let schema = Arc::new(price_quote_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&i64::from(quote.nights))?;
                encoder.encode_field(&quote.subtotal.to_string())?;
                encoder.encode_field(&quote.extra_guest_fee.to_string())?;
                encoder.encode_field(&quote.cleaning_fee.to_string())?;
                encoder.encode_field(&quote.service_fee.to_string())?;
                encoder.encode_field(&quote.taxes.to_string())?;
                encoder.encode_field(&quote.total.to_string())?;
                encoder.encode_field(&quote.currency)?;
                encoder.encode_field(&per_night)?;
                Ok(vec![query_response(schema, vec![Ok(encoder.take_row())])])
            }
            Command::SelectBookings { property_id } => {
                let property = engine
                    .get_property(&property_id)
                    .await
                    .ok_or(EngineError::NotFound(property_id))
                    .map_err(engine_err)?;
                let mut bookings = engine.list_bookings(property_id).await.map_err(engine_err)?;
                // Guests only see their own stays.
                if property.owner != actor {
                    bookings.retain(|b| b.guest == actor);
                }
                Ok(vec![booking_response(&bookings)?])
            }
            Command::SelectCalendar { property_id } => {
                let feed = engine.export_feed(property_id, now_ms()).await.map_err(engine_err)?;
                let schema = Arc::new(calendar_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&property_id.to_string())?;
                encoder.encode_field(&feed)?;
                Ok(vec![query_response(schema, vec![Ok(encoder.take_row())])])
            }
            Command::SelectCalendarLinks { property_id } => {
                self.require_owner_of(property_id, actor).await?;
                let links = engine.list_calendar_links(property_id).await.map_err(engine_err)?;
                let schema = Arc::new(calendar_links_schema());
                let rows = links
                    .iter()
                    .map(|link| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&link.id.to_string())?;
                        encoder.encode_field(&link.url)?;
                        encoder.encode_field(&link.direction.as_str())?;
                        encoder.encode_field(&link.policy.as_str())?;
                        encoder.encode_field(&link.status.as_str())?;
                        encoder.encode_field(&link.last_sync)?;
                        encoder.encode_field(&link.last_error)?;
                        encoder.encode_field(&i64::from(link.consecutive_failures))?;
                        encoder.encode_field(&link.next_attempt_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn booking_response(bookings: &[Booking]) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let rows = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.property_id.to_string())?;
            encoder.encode_field(&b.guest)?;
            encoder.encode_field(&b.range.start.to_string())?;
            encoder.encode_field(&b.range.end.to_string())?;
            encoder.encode_field(&i64::from(b.guests))?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.price.total.to_string())?;
            encoder.encode_field(&b.price.currency)?;
            encoder.encode_field(&b.payment_deadline)?;
            encoder.encode_field(&b.cancel_reason.map(|r| r.as_str()))?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(query_response(schema, rows))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("property_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("price", Type::VARCHAR),
        field("source", Type::VARCHAR),
    ]
}

fn price_quote_schema() -> Vec<FieldInfo> {
    vec![
        field("nights", Type::INT8),
        field("subtotal", Type::VARCHAR),
        field("extra_guest_fee", Type::VARCHAR),
        field("cleaning_fee", Type::VARCHAR),
        field("service_fee", Type::VARCHAR),
        field("taxes", Type::VARCHAR),
        field("total", Type::VARCHAR),
        field("currency", Type::VARCHAR),
        field("per_night", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("property_id", Type::VARCHAR),
        field("guest", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("guests", Type::INT8),
        field("status", Type::VARCHAR),
        field("total", Type::VARCHAR),
        field("currency", Type::VARCHAR),
        field("payment_deadline", Type::INT8),
        field("cancel_reason", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![field("property_id", Type::VARCHAR), field("ics", Type::VARCHAR)]
}

fn calendar_links_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("url", Type::VARCHAR),
        field("direction", Type::VARCHAR),
        field("policy", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("last_sync", Type::INT8),
        field("last_error", Type::VARCHAR),
        field("consecutive_failures", Type::INT8),
        field("next_attempt_at", Type::INT8),
    ]
}

/// Columns a statement returns, judged from its verb and target table so that
/// statements with unbound `$n` placeholders can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_ascii_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    let target = words
        .windows(2)
        .find(|w| w[0] == "from" || w[0] == "into")
        .and_then(|w| w[1].split('(').next())
        .map(|t| t.trim_matches(|c: char| c == '"' || c == ';'));
    match (words.first().copied(), target) {
        (Some("select"), Some("availability")) => availability_schema(),
        (Some("select"), Some("price_quote")) => price_quote_schema(),
        (Some("select"), Some("bookings"))
        | (Some("insert"), Some("bookings" | "approvals" | "declines" | "check_ins" | "checkouts")) => {
            booking_schema()
        }
        (Some("select"), Some("calendar")) => calendar_schema(),
        (Some("select"), Some("calendar_links")) => calendar_links_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for InnkeepHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.session_user(client)?;
        self.run(&actor, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InnkeepQueryParser;

#[async_trait]
impl QueryParser for InnkeepQueryParser {
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
impl ExtendedQueryHandler for InnkeepHandler {
    type Statement = String;
    type QueryParser = InnkeepQueryParser;

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
        let actor = self.session_user(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&actor, &sql).await?;
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
    // Highest index first so $1 does not clobber the prefix of $10.
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

pub struct InnkeepFactory {
    handler: Arc<InnkeepHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<InnkeepAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl InnkeepFactory {
    pub fn new(engine: Arc<Engine>, fetcher: Arc<dyn FeedFetcher>, password: String) -> Self {
        let auth_source = InnkeepAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(InnkeepHandler::new(engine, fetcher)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InnkeepFactory {
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
pub async fn process_connection(socket: TcpStream, factory: Arc<InnkeepFactory>) -> std::io::Result<()> {
    socket.set_nodelay(true)?;
    pgwire::tokio::process_socket(socket, None, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::SlotConflict { .. } => "23P01",
        EngineError::DateRangeInvalid(_) => "22008",
        EngineError::Forbidden(_) => "42501",
        _ => "P0001",
    };
    user_error(code, e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    let code = match e {
        sql::SqlError::EmptyRange => "22008",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
