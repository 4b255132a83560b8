// =============================================================================
// Live Adapter — brokerage REST endpoints plus the streaming WebSocket
// =============================================================================
//
// REST:   price history, instrument search, option chains and the account
//         summary, all authenticated with a bearer token.
// Stream: one WebSocket session.  Connection details come from the user
//         preference endpoint; the session must LOGIN before any
//         subscription command.  A single task owns the socket: it writes
//         subscription commands and turns `data` frames into `StreamEvent`s.
//         A command succeeds only once the server answers its request id
//         with code 0.
//
// When the socket closes or errors, the task ends and drops the event sender.
// The pipeline treats that as a fatal loss of the stream.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{StreamEvent, StreamKind, StreamOp, StreamRequest};
use crate::options::{ExpiryChains, OptionContract, OptionsQuery};
use crate::runtime_config::LiveConfig;
use crate::types::{AccountInfo, Bar, Quote};

const CHART_SERVICE: &str = "CHART_EQUITY";
const QUOTE_SERVICE: &str = "LEVELONE_EQUITIES";
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection parameters handed out by the user preference endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerInfo {
    pub streamer_socket_url: String,
    pub schwab_client_customer_id: String,
    pub schwab_client_correl_id: String,
    pub schwab_client_channel: String,
    pub schwab_client_function_id: String,
}

struct StreamerCommand {
    request: StreamRequest,
    ack: oneshot::Sender<Result<()>>,
}

pub struct LiveAdapter {
    client: reqwest::Client,
    base_url: String,
    token: String,
    extended_hours: bool,
    account: AccountInfo,
    commands: mpsc::UnboundedSender<StreamerCommand>,
}

impl LiveAdapter {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Fetch streamer info and the account, log the stream in and start the
    /// socket task.
    pub async fn connect(config: &LiveConfig) -> Result<(Self, mpsc::UnboundedReceiver<StreamEvent>)> {
        if config.api_token.is_empty() {
            bail!("live adapter requires an API token (PULSE_API_TOKEN)");
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client for live adapter")?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let mut adapter = Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            extended_hours: config.extended_hours,
            account: AccountInfo {
                number: String::new(),
                balance: 0.0,
            },
            commands: cmd_tx,
        };

        let info = adapter.fetch_streamer_info().await?;
        adapter.account = adapter.fetch_account().await?;

        info!(url = %info.streamer_socket_url, "connecting to streamer WebSocket");
        let (mut ws, _response) = connect_async(info.streamer_socket_url.as_str())
            .await
            .context("failed to connect to streamer WebSocket")?;

        let login = login_message(&info, &adapter.token, 0);
        ws.send(Message::Text(login.to_string()))
            .await
            .context("failed to send LOGIN")?;
        loop {
            let msg = ws
                .next()
                .await
                .context("streamer closed before LOGIN was acknowledged")?
                .context("streamer read error during LOGIN")?;
            let Message::Text(text) = msg else { continue };
            let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
            let Some((code, msg)) = response_code(&value, 0) else { continue };
            if code != 0 {
                bail!("streamer LOGIN failed with code {code}: {msg}");
            }
            info!("streamer LOGIN acknowledged");
            break;
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_streamer(ws, info, cmd_rx, event_tx));

        Ok((adapter, event_rx))
    }

    pub fn account(&self) -> AccountInfo {
        self.account.clone()
    }

    // -------------------------------------------------------------------------
    // REST
    // -------------------------------------------------------------------------

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("GET {path} returned {status}: {body}");
        }
        resp.json().await.with_context(|| format!("failed to parse {path} response body"))
    }

    async fn fetch_streamer_info(&self) -> Result<StreamerInfo> {
        let body = self.get_json("/trader/v1/userPreference", &[]).await?;
        let infos: Vec<StreamerInfo> = serde_json::from_value(body["streamerInfo"].clone())
            .context("userPreference response has no usable streamerInfo")?;
        infos.into_iter().last().context("streamerInfo list is empty")
    }

    async fn fetch_account(&self) -> Result<AccountInfo> {
        let numbers = self.get_json("/trader/v1/accounts/accountNumbers", &[]).await?;
        let first = numbers
            .as_array()
            .and_then(|a| a.first())
            .context("no brokerage account available")?;
        let number = first["accountNumber"].as_str().unwrap_or_default().to_string();
        let hash = first["hashValue"].as_str().context("account has no hashValue")?;

        let details = self.get_json(&format!("/trader/v1/accounts/{hash}"), &[]).await?;
        let balance = details["securitiesAccount"]["currentBalances"]["cashAvailableForTrading"]
            .as_f64()
            .unwrap_or_else(|| {
                warn!("account balance missing from account details");
                0.0
            });
        Ok(AccountInfo { number, balance })
    }

    pub async fn fetch_historical_bars(&self, symbol: &str, since: DateTime<Utc>) -> Result<Vec<Bar>> {
        let query = [
            ("symbol", symbol.to_uppercase()),
            ("frequencyType", "minute".to_string()),
            ("frequency", "1".to_string()),
            ("startDate", since.timestamp_millis().to_string()),
            ("endDate", Utc::now().timestamp_millis().to_string()),
            ("needExtendedHoursData", self.extended_hours.to_string()),
        ];
        let body = self.get_json("/marketdata/v1/pricehistory", &query).await?;
        let bars = parse_candles(symbol, &body)?;
        debug!(symbol, bars = bars.len(), "price history fetched");
        Ok(bars)
    }

    pub async fn resolve_symbol(&self, query: &str) -> Result<Option<String>> {
        let wanted = query.trim().to_uppercase();
        if wanted.is_empty() {
            return Ok(None);
        }
        let params = [("symbol", wanted.clone()), ("projection", "symbol-search".to_string())];
        let body = self.get_json("/marketdata/v1/instruments", &params).await?;
        let symbols: Vec<&str> = body["instruments"]
            .as_array()
            .map(|a| a.iter().filter_map(|i| i["symbol"].as_str()).collect())
            .unwrap_or_default();
        let exact = symbols.iter().find(|s| **s == wanted);
        Ok(exact.or(symbols.first()).map(|s| s.to_string()))
    }

    pub async fn options_chain(&self, query: &OptionsQuery) -> Result<ExpiryChains> {
        let params = [
            ("symbol", query.symbol.clone()),
            ("contractType", "ALL".to_string()),
            ("strikeCount", query.strike_count.to_string()),
            ("fromDate", query.from.to_string()),
            ("toDate", query.to.to_string()),
        ];
        let body = self.get_json("/marketdata/v1/chains", &params).await?;
        Ok(ExpiryChains {
            calls: parse_expiry_map(&body["callExpDateMap"]),
            puts: parse_expiry_map(&body["putExpDateMap"]),
        })
    }

    // -------------------------------------------------------------------------
    // Stream
    // -------------------------------------------------------------------------

    /// Hand the request to the socket task and wait for the server's answer.
    pub async fn request(&self, request: StreamRequest) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(StreamerCommand { request, ack })
            .map_err(|_| anyhow!("streamer task is gone"))?;
        tokio::time::timeout(ACK_TIMEOUT, done)
            .await
            .map_err(|_| anyhow!("stream request not answered within {ACK_TIMEOUT:?}"))?
            .context("streamer task dropped the request")?
    }
}

// =============================================================================
// Socket task
// =============================================================================

async fn run_streamer<S>(
    ws: WebSocketStream<S>,
    info: StreamerInfo,
    mut commands: mpsc::UnboundedReceiver<StreamerCommand>,
    events: mpsc::UnboundedSender<StreamEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();
    let mut request_id: u64 = 1;
    // Acks waiting for their response frame.  Dropped with the task.
    let mut pending: HashMap<u64, oneshot::Sender<Result<()>>> = HashMap::new();

    loop {
        tokio::select! {
            Some(cmd) = commands.recv() => {
                let id = request_id;
                request_id += 1;
                let message = command_message(&info, &cmd.request, id);
                debug!(request = %message, "sending stream command");
                if let Err(e) = write.send(Message::Text(message.to_string())).await {
                    let _ = cmd.ack.send(Err(anyhow!(e).context("failed to write stream command")));
                    error!("streamer write failed, closing stream");
                    return;
                }
                pending.insert(id, cmd.ack);
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(value) = serde_json::from_str::<Value>(&text) else {
                            warn!("unparseable streamer frame");
                            continue;
                        };
                        if value.get("notify").is_some() {
                            continue;
                        }
                        for response in parse_responses(&value) {
                            settle(&mut pending, response);
                        }
                        if let Some(data) = value.get("data") {
                            for event in parse_stream_data(data) {
                                if events.send(event).is_err() {
                                    info!("stream receiver dropped, stopping streamer");
                                    return;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        error!(frame = ?frame, "streamer closed the connection");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "streamer read error");
                        return;
                    }
                    None => {
                        error!("streamer stream ended");
                        return;
                    }
                }
            }
        }
    }
}

/// Resolve the ack waiting on `response`, failing it on a non-zero code.
fn settle(pending: &mut HashMap<u64, oneshot::Sender<Result<()>>>, response: StreamResponse) {
    let StreamResponse {
        request_id,
        service,
        command,
        code,
        msg,
    } = response;
    let outcome = if code == 0 {
        debug!(request_id, service = %service, command = %command, "stream command acknowledged");
        Ok(())
    } else {
        warn!(request_id, service = %service, command = %command, code, msg = %msg, "stream command rejected");
        Err(anyhow!("{service} {command} rejected with code {code}: {msg}"))
    };
    match pending.remove(&request_id) {
        Some(ack) => {
            let _ = ack.send(outcome);
        }
        None => debug!(request_id, "response for unknown request"),
    }
}

// =============================================================================
// Wire helpers
// =============================================================================

fn login_message(info: &StreamerInfo, token: &str, request_id: u64) -> Value {
    json!({
        "service": "ADMIN",
        "command": "LOGIN",
        "requestid": request_id,
        "SchwabClientCustomerId": info.schwab_client_customer_id,
        "SchwabClientCorrelId": info.schwab_client_correl_id,
        "parameters": {
            "Authorization": token,
            "SchwabClientChannel": info.schwab_client_channel,
            "SchwabClientFunctionId": info.schwab_client_function_id,
        },
    })
}

fn command_message(info: &StreamerInfo, req: &StreamRequest, request_id: u64) -> Value {
    let (service, fields) = match req.kind {
        StreamKind::Chart => (CHART_SERVICE, "0,1,2,3,4,5,6,7"),
        StreamKind::Quote => (QUOTE_SERVICE, "0,1,2,3"),
    };
    let command = match req.op {
        StreamOp::Open => "SUBS",
        StreamOp::Add => "ADD",
        StreamOp::Remove => "UNSUBS",
    };
    json!({
        "service": service,
        "command": command,
        "requestid": request_id,
        "SchwabClientCustomerId": info.schwab_client_customer_id,
        "SchwabClientCorrelId": info.schwab_client_correl_id,
        "parameters": {
            "keys": req.symbols.join(","),
            "fields": fields,
        },
    })
}

#[derive(Debug, Clone, PartialEq)]
struct StreamResponse {
    request_id: u64,
    service: String,
    command: String,
    /// `-1` when the server sent none.
    code: i64,
    msg: String,
}

/// Entries of a frame's `response` array that carry a usable request id.
fn parse_responses(value: &Value) -> Vec<StreamResponse> {
    let Some(responses) = value.get("response").and_then(Value::as_array) else {
        return Vec::new();
    };
    responses
        .iter()
        .filter_map(|r| {
            let request_id = match &r["requestid"] {
                Value::String(s) => s.parse::<u64>().ok(),
                other => other.as_u64(),
            };
            let Some(request_id) = request_id else {
                warn!(response = %r, "stream response without request id");
                return None;
            };
            let content = &r["content"];
            Some(StreamResponse {
                request_id,
                service: r["service"].as_str().unwrap_or_default().to_string(),
                command: r["command"].as_str().unwrap_or_default().to_string(),
                code: content["code"].as_i64().unwrap_or(-1),
                msg: content["msg"].as_str().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

/// `(code, msg)` of the response to `request_id`, if this frame carries it.
fn response_code(value: &Value, request_id: u64) -> Option<(i64, String)> {
    parse_responses(value)
        .into_iter()
        .find(|r| r.request_id == request_id)
        .map(|r| (r.code, r.msg))
}

/// Turn the `data` array of a stream frame into event batches.
fn parse_stream_data(data: &Value) -> Vec<StreamEvent> {
    let mut bars = Vec::new();
    let mut quotes = Vec::new();
    for entry in data.as_array().map(Vec::as_slice).unwrap_or_default() {
        let service = entry["service"].as_str().unwrap_or_default();
        let contents = entry["content"].as_array().map(Vec::as_slice).unwrap_or_default();
        match service {
            CHART_SERVICE => bars.extend(contents.iter().filter_map(|c| logged("chart", c, parse_chart_content(c)))),
            QUOTE_SERVICE => quotes.extend(contents.iter().filter_map(|c| logged("quote", c, parse_quote_content(c)))),
            other => warn!(service = other, "unknown stream service"),
        }
    }

    let mut events = Vec::new();
    if !bars.is_empty() {
        events.push(StreamEvent::Bars(bars));
    }
    if !quotes.is_empty() {
        events.push(StreamEvent::Quotes(quotes));
    }
    events
}

/// Pass `parsed` through, warning when `item` could not be read.
fn logged<T>(kind: &str, item: &Value, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        warn!(kind, item = %item, "malformed stream item dropped");
    }
    parsed
}

fn parse_chart_content(item: &Value) -> Option<Bar> {
    let bar = Bar {
        symbol: item["key"].as_str()?.to_string(),
        timestamp: DateTime::from_timestamp_millis(item["7"].as_i64()?)?,
        open: item["2"].as_f64()?,
        high: item["3"].as_f64()?,
        low: item["4"].as_f64()?,
        close: item["5"].as_f64()?,
        volume: item["6"].as_f64()? as u64,
    };
    Some(bar)
}

fn parse_quote_content(item: &Value) -> Option<Quote> {
    Some(Quote {
        symbol: item["key"].as_str()?.to_string(),
        bid: item["1"].as_f64(),
        ask: item["2"].as_f64(),
        last: item["3"].as_f64(),
    })
}

fn parse_candles(symbol: &str, body: &Value) -> Result<Vec<Bar>> {
    let candles = body["candles"]
        .as_array()
        .with_context(|| format!("price history for {symbol} has no candles"))?;
    let bars: Vec<Bar> = candles.iter().filter_map(|c| parse_candle(symbol, c)).collect();
    let dropped = candles.len() - bars.len();
    if dropped > 0 {
        warn!(symbol, dropped, "malformed candles dropped from price history");
    }
    Ok(bars)
}

fn parse_candle(symbol: &str, c: &Value) -> Option<Bar> {
    Some(Bar {
        symbol: symbol.to_string(),
        timestamp: DateTime::from_timestamp_millis(c["datetime"].as_i64()?)?,
        open: c["open"].as_f64()?,
        high: c["high"].as_f64()?,
        low: c["low"].as_f64()?,
        close: c["close"].as_f64()?,
        volume: c["volume"].as_f64()? as u64,
    })
}

/// `"YYYY-MM-DD:dte" -> strike -> [contract]` into contracts per expiry.
fn parse_expiry_map(map: &Value) -> BTreeMap<NaiveDate, Vec<OptionContract>> {
    let mut out: BTreeMap<NaiveDate, Vec<OptionContract>> = BTreeMap::new();
    let Some(expiries) = map.as_object() else {
        return out;
    };
    for (key, strikes) in expiries {
        let date = key.split(':').next().unwrap_or_default();
        let Ok(expiration) = NaiveDate::parse_from_str(date, "%Y-%m-%d") else {
            warn!(key = %key, "unparseable option expiry");
            continue;
        };
        let Some(strikes) = strikes.as_object() else { continue };
        let contracts = out.entry(expiration).or_default();
        for c in strikes.values().filter_map(Value::as_array).flatten() {
            let (Some(symbol), Some(strike)) = (c["symbol"].as_str(), c["strikePrice"].as_f64()) else {
                continue;
            };
            contracts.push(OptionContract {
                symbol: symbol.trim().to_string(),
                strike,
                expiration,
                bid: c["bid"].as_f64().unwrap_or_default(),
                ask: c["ask"].as_f64().unwrap_or_default(),
                last: c["last"].as_f64().unwrap_or_default(),
                volume: c["totalVolume"].as_u64().unwrap_or_default(),
                open_interest: c["openInterest"].as_u64().unwrap_or_default(),
                // -999 marks a missing greek
                delta: c["delta"].as_f64().filter(|d| d.abs() <= 1.0),
            });
        }
    }
    out
}
