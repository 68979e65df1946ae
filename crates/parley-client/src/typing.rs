use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use uuid::Uuid;

use parley_types::events::GatewayCommand;

/// Inactivity window after the last keystroke before the stop signal goes
/// out.
const TYPING_IDLE: Duration = Duration::from_secs(2);

/// Turns keystrokes into typing signals for one conversation partner.
///
/// The first keystroke of a burst emits `typing{is_typing: true}`; each
/// further keystroke extends the burst. After 2 seconds without input the
/// notifier emits `typing{is_typing: false}` on its own. Dropping the
/// notifier mid-burst emits the stop immediately, so a conversation switch
/// never leaves the peer with a stuck indicator.
pub struct TypingNotifier {
    keystrokes: mpsc::UnboundedSender<()>,
}

impl TypingNotifier {
    pub fn new(outbound: mpsc::UnboundedSender<GatewayCommand>, receiver_id: Uuid) -> Self {
        Self::with_idle(outbound, receiver_id, TYPING_IDLE)
    }

    pub fn with_idle(
        outbound: mpsc::UnboundedSender<GatewayCommand>,
        receiver_id: Uuid,
        idle: Duration,
    ) -> Self {
        let (keystrokes, mut rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            // Outer loop: wait for the keystroke that opens a burst.
            while rx.recv().await.is_some() {
                let _ = outbound.send(GatewayCommand::Typing {
                    receiver_id,
                    is_typing: true,
                });

                let mut deadline = Instant::now() + idle;
                loop {
                    tokio::select! {
                        _ = time::sleep_until(deadline) => {
                            let _ = outbound.send(GatewayCommand::Typing {
                                receiver_id,
                                is_typing: false,
                            });
                            break;
                        }
                        more = rx.recv() => match more {
                            Some(()) => deadline = Instant::now() + idle,
                            None => {
                                // Notifier dropped mid-burst: stop now.
                                let _ = outbound.send(GatewayCommand::Typing {
                                    receiver_id,
                                    is_typing: false,
                                });
                                return;
                            }
                        },
                    }
                }
            }
        });

        Self { keystrokes }
    }

    /// Record one keystroke. Cheap and non-blocking; safe to call on every
    /// input event.
    pub fn keystroke(&self) {
        let _ = self.keystrokes.send(());
    }
}
