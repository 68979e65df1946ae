use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use parley_types::events::{GatewayCommand, GatewayEvent};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("gateway connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// A live connection to the server gateway, bridged to channels.
///
/// Two background tasks own the socket halves: one encodes outbound
/// commands, one decodes inbound events. Unrecognized frames are logged
/// and skipped. Both tasks end when the socket closes; the event channel
/// closing is the disconnect signal for the caller.
pub struct GatewayClient {
    events: mpsc::UnboundedReceiver<GatewayEvent>,
    commands: mpsc::UnboundedSender<GatewayCommand>,
}

impl GatewayClient {
    /// Connect to `ws://host:port` using the token obtained at login.
    pub async fn connect(base_url: &str, token: &str) -> Result<Self, ClientError> {
        let url = format!("{base_url}/gateway?token={token}");
        let (socket, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let (event_tx, events) = mpsc::unbounded_channel();
        let (commands, mut command_rx) = mpsc::unbounded_channel::<GatewayCommand>();

        tokio::spawn(async move {
            while let Some(cmd) = command_rx.recv().await {
                let text = serde_json::to_string(&cmd).unwrap();
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            debug!("gateway command writer finished");
        });

        tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<GatewayEvent>(text.as_str()) {
                            Ok(event) => {
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("unrecognized gateway frame: {e}"),
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            debug!("gateway event reader finished");
        });

        Ok(Self { events, commands })
    }

    /// Sender half for outbound commands — share it with a `ChatStore` and
    /// `TypingNotifier`.
    pub fn commands(&self) -> mpsc::UnboundedSender<GatewayCommand> {
        self.commands.clone()
    }

    /// Next pushed event, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<GatewayEvent> {
        self.events.recv().await
    }
}
