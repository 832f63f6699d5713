/*
[INPUT]:  Raw inbound relay frames + the subscription registry
[OUTPUT]: Routing decisions (deliver to handler, control, discard, malformed)
[POS]:    WebSocket layer - inbound frame classification and dispatch
[UPDATE]: When adding new frame types or changing routing rules
*/

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::message::ServerFrame;
use super::subscription::{SubscriptionKey, SubscriptionRegistry, UpdateHandler};

const PARSE_FAIL_LOG_LIMIT: usize = 3;
const UNROUTED_LOG_LIMIT: usize = 10;
const RAW_LOG_MAX_BYTES: usize = 1024;

static PARSE_FAIL_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static UNROUTED_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Outcome of routing one inbound frame
pub enum Route {
    /// Data update with a registered handler; invoke it with `payload`
    Deliver {
        key: SubscriptionKey,
        handler: UpdateHandler,
        payload: Value,
    },
    /// Data update nobody is subscribed to
    Discard { key: SubscriptionKey },
    /// Protocol-control frame, handled locally
    Control(ServerFrame),
    /// Frame that could not be decoded
    Malformed,
    /// Transport-level frame carrying no relay payload (ping/pong/close)
    Ignored,
}

impl Route {
    /// Run the handler of a `Deliver` route. Returns whether anything was delivered.
    pub fn dispatch(self) -> bool {
        match self {
            Route::Deliver { handler, payload, .. } => {
                handler(payload);
                true
            }
            _ => false,
        }
    }
}

/// Classifies inbound frames and looks up the subscriber for data updates
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageRouter;

impl MessageRouter {
    pub fn new() -> Self {
        Self
    }

    /// Decode a transport message into a relay frame
    pub fn decode(&self, message: WsMessage) -> Option<ServerFrame> {
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(err) => {
                    log_parse_fail_once(&err.to_string(), "<binary>");
                    return None;
                }
            },
            _ => return None,
        };
        self.decode_text(&text)
    }

    pub fn decode_text(&self, text: &str) -> Option<ServerFrame> {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => Some(frame),
            Err(err) => {
                log_parse_fail_once(&err.to_string(), text);
                None
            }
        }
    }

    /// Route a transport message against the registry.
    ///
    /// The handler is returned rather than called so the caller can release any
    /// lock guarding the registry before running subscriber code.
    pub fn route(&self, message: WsMessage, registry: &SubscriptionRegistry) -> Route {
        if matches!(
            message,
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_) | WsMessage::Frame(_)
        ) {
            return Route::Ignored;
        }
        match self.decode(message) {
            Some(frame) => self.route_frame(frame, registry),
            None => Route::Malformed,
        }
    }

    pub fn route_frame(&self, frame: ServerFrame, registry: &SubscriptionRegistry) -> Route {
        match frame {
            ServerFrame::Trade(_) | ServerFrame::Candle(_) | ServerFrame::Depth(_) => {
                let Some((channel, update)) = frame.into_update() else {
                    return Route::Malformed;
                };
                let key = SubscriptionKey::new(channel, &update.symbol, update.interval.as_deref());
                match registry.handler(&key) {
                    Some(handler) => Route::Deliver {
                        key,
                        handler,
                        payload: update.data,
                    },
                    None => {
                        log_unrouted_once(&key);
                        Route::Discard { key }
                    }
                }
            }
            control => {
                log_control_frame(&control);
                Route::Control(control)
            }
        }
    }
}

fn log_control_frame(frame: &ServerFrame) {
    match frame {
        ServerFrame::Welcome { message } => info!(%message, "relay welcome"),
        ServerFrame::Subscribed {
            channel,
            symbol,
            interval,
        } => debug!(?channel, ?symbol, ?interval, "relay subscription acknowledged"),
        ServerFrame::Unsubscribed { channel } => {
            debug!(?channel, "relay unsubscription acknowledged")
        }
        ServerFrame::Error { message } => warn!(%message, "relay reported error"),
        ServerFrame::Pong { timestamp } => debug!(?timestamp, "relay pong"),
        ServerFrame::Unknown => debug!("relay frame type unrecognized"),
        ServerFrame::Trade(_) | ServerFrame::Candle(_) | ServerFrame::Depth(_) => {}
    }
}

fn log_unrouted_once(key: &SubscriptionKey) {
    let count = UNROUTED_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < UNROUTED_LOG_LIMIT {
        debug!(
            sample_index = count + 1,
            sample_limit = UNROUTED_LOG_LIMIT,
            key = %key,
            "relay update without subscriber discarded"
        );
    }
}

fn log_parse_fail_once(err: &str, raw: &str) {
    let count = PARSE_FAIL_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < PARSE_FAIL_LOG_LIMIT {
        warn!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            bytes = raw.len(),
            "relay frame parse failed"
        );
        let preview = truncate_for_log(raw, RAW_LOG_MAX_BYTES);
        debug!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            message = %preview,
            "relay frame parse failed"
        );
    }
}

pub(crate) fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut cut = max_len;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = String::with_capacity(cut + 3);
    out.push_str(&value[..cut]);
    out.push_str("...");
    out
}
