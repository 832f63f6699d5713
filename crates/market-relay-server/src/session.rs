/*
[INPUT]:  One accepted dashboard WebSocket connection + the relay hub
[OUTPUT]: Control replies and forwarded hub updates on that connection
[POS]:    Session layer - per-subscriber protocol handling
[UPDATE]: When changing client frame handling or reply shapes
*/

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use market_relay_client::{Channel, ClientFrame, RelayError, ServerFrame, SubscriptionKey, normalize_symbol};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hub::{RelayHub, SessionId};

const INVALID_FRAME_LOG_EVERY: usize = 50;
static INVALID_FRAME_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Serve one subscriber until it closes, errors, or the relay shuts down
pub async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    hub: RelayHub,
    welcome_message: String,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let ws = accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    let session = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    hub.register(session, tx);
    info!(%session, %peer, "session opened");

    let result = session_loop(session, &hub, &mut write, &mut read, rx, welcome_message, &shutdown).await;

    hub.deregister(session);
    match &result {
        Ok(()) => info!(%session, %peer, "session closed"),
        Err(err) => warn!(%session, %peer, error = %err, "session ended with error"),
    }
    result
}

async fn session_loop<W, R>(
    session: SessionId,
    hub: &RelayHub,
    write: &mut W,
    read: &mut R,
    mut rx: mpsc::UnboundedReceiver<ServerFrame>,
    welcome_message: String,
    shutdown: &CancellationToken,
) -> Result<(), RelayError>
where
    W: Sink<WsMessage, Error = WsError> + Unpin,
    R: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    send_frame(write, &ServerFrame::Welcome { message: welcome_message }).await?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return Ok(());
            }
            frame = rx.recv() => {
                match frame {
                    Some(frame) => send_frame(write, &frame).await?,
                    None => return Ok(()),
                }
            }
            msg = read.next() => {
                let text = match msg {
                    Some(Ok(WsMessage::Text(text))) => text.to_string(),
                    Some(Ok(WsMessage::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(err.into()),
                };
                let reply = handle_client_text(session, hub, &text);
                send_frame(write, &reply).await?;
            }
        }
    }
}

async fn send_frame<S>(write: &mut S, frame: &ServerFrame) -> Result<(), RelayError>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let text = frame.to_json()?;
    write.send(WsMessage::Text(text.into())).await?;
    Ok(())
}

/// Apply one client frame to the hub and build the reply
pub(crate) fn handle_client_text(session: SessionId, hub: &RelayHub, text: &str) -> ServerFrame {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            let count = INVALID_FRAME_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
            if count <= 3 || count % INVALID_FRAME_LOG_EVERY == 0 {
                debug!(%session, count, error = %err, "invalid client frame");
            }
            return error_reply(format!("invalid message: {err}"));
        }
    };

    match frame {
        ClientFrame::Subscribe {
            channel,
            symbol,
            interval,
        } => {
            let symbol = normalize_symbol(&symbol);
            if symbol.is_empty() {
                return error_reply("symbol is required");
            }
            let interval = interval.filter(|interval| !interval.trim().is_empty());
            if channel == Channel::Candle && interval.is_none() {
                return error_reply("interval is required for candle subscriptions");
            }

            let key = SubscriptionKey::new(channel, &symbol, interval.as_deref());
            let reply = ServerFrame::Subscribed {
                channel: Some(channel),
                symbol: Some(symbol),
                interval: key.interval_opt().map(str::to_string),
            };
            hub.subscribe(session, key);
            reply
        }
        ClientFrame::Unsubscribe { all: true, .. } => {
            hub.unsubscribe_all(session);
            ServerFrame::Unsubscribed { channel: None }
        }
        ClientFrame::Unsubscribe {
            channel: Some(channel),
            symbol: Some(symbol),
            interval,
            ..
        } => {
            let key = SubscriptionKey::new(channel, &symbol, interval.as_deref());
            hub.unsubscribe(session, key);
            ServerFrame::Unsubscribed {
                channel: Some(channel),
            }
        }
        ClientFrame::Unsubscribe { .. } => error_reply("unsubscribe requires channel and symbol, or all"),
        ClientFrame::Ping { timestamp } => ServerFrame::Pong {
            timestamp: Some(timestamp),
        },
    }
}

fn error_reply(message: impl Into<String>) -> ServerFrame {
    ServerFrame::Error {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubCommand;
    use rstest::rstest;
    use serde_json::json;

    fn reply_for(text: &str) -> (ServerFrame, Vec<HubCommand>) {
        let (hub, mut rx) = RelayHub::new_for_test();
        let reply = handle_client_text(Uuid::new_v4(), &hub, text);
        let mut commands = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            commands.push(cmd);
        }
        (reply, commands)
    }

    #[test]
    fn subscribe_registers_uppercased_key() {
        let (reply, commands) =
            reply_for(r#"{"type":"subscribe","channel":"candle","symbol":"btcusdt","interval":"1m"}"#);
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"type": "subscribed", "channel": "candle", "symbol": "BTCUSDT", "interval": "1m"})
        );
        match commands.as_slice() {
            [HubCommand::Subscribe { key, .. }] => assert_eq!(key.to_string(), "candle:BTCUSDT:1m"),
            other => panic!("unexpected commands: {other:?}"),
        }
    }

    #[test]
    fn trade_subscription_drops_interval() {
        let (reply, commands) =
            reply_for(r#"{"type":"subscribe","channel":"trade","symbol":"ETHUSDT","interval":"1m"}"#);
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"type": "subscribed", "channel": "trade", "symbol": "ETHUSDT"})
        );
        assert!(matches!(
            commands.as_slice(),
            [HubCommand::Subscribe { key, .. }] if key.to_string() == "trade:ETHUSDT:"
        ));
    }

    #[rstest]
    #[case(r#"{"type":"subscribe","channel":"trade","symbol":"  "}"#, "symbol is required")]
    #[case(r#"{"type":"subscribe","channel":"candle","symbol":"BTCUSDT"}"#, "interval is required")]
    #[case(r#"{"type":"unsubscribe","channel":"trade"}"#, "unsubscribe requires")]
    #[case(r#"{"type":"subscribe","channel":"orders","symbol":"BTCUSDT"}"#, "invalid message")]
    #[case("not json", "invalid message")]
    fn bad_frames_get_error_replies(#[case] text: &str, #[case] expected: &str) {
        let (reply, commands) = reply_for(text);
        match reply {
            ServerFrame::Error { message } => assert!(message.contains(expected), "{message}"),
            other => panic!("expected error reply, got {other:?}"),
        }
        assert!(commands.is_empty());
    }

    #[test]
    fn unsubscribe_all_clears_session() {
        let (reply, commands) = reply_for(r#"{"type":"unsubscribe","all":true}"#);
        assert_eq!(reply, ServerFrame::Unsubscribed { channel: None });
        assert!(matches!(commands.as_slice(), [HubCommand::UnsubscribeAll { .. }]));
    }

    #[test]
    fn unsubscribe_single_key() {
        let (reply, commands) = reply_for(r#"{"type":"unsubscribe","channel":"depth","symbol":"solusdt"}"#);
        assert_eq!(
            reply,
            ServerFrame::Unsubscribed {
                channel: Some(Channel::Depth)
            }
        );
        assert!(matches!(
            commands.as_slice(),
            [HubCommand::Unsubscribe { key, .. }] if key.to_string() == "depth:SOLUSDT:"
        ));
    }

    #[test]
    fn ping_echoes_timestamp() {
        let (reply, commands) = reply_for(r#"{"type":"ping","timestamp":1700000000000}"#);
        assert_eq!(
            reply,
            ServerFrame::Pong {
                timestamp: Some(1_700_000_000_000)
            }
        );
        assert!(commands.is_empty());
    }
}
