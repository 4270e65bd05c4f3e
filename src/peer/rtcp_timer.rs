use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

enum TimerCommand {
    Start(Duration),
    Stop,
}

/// Re-armable one-shot timer driving a peer's RTCP ticks.
///
/// Each firing sends the peer id into the worker's tick queue and disarms;
/// the peer re-arms it with the next jittered interval at the end of every
/// tick. The task exits when the handle is dropped or the tick queue is
/// gone.
pub struct RtcpTimer {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl RtcpTimer {
    pub fn new(peer_id: u32, tick_tx: mpsc::UnboundedSender<u32>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;
            loop {
                // select! evaluates every arm expression, so feed it a real
                // instant even while disarmed; the precondition keeps the
                // disarmed arm from completing.
                let sleep_target =
                    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

                tokio::select! {
                    command = rx.recv() => match command {
                        Some(TimerCommand::Start(interval)) => {
                            deadline = Some(Instant::now() + interval);
                        }
                        Some(TimerCommand::Stop) => deadline = None,
                        None => return,
                    },
                    _ = sleep_until(sleep_target), if deadline.is_some() => {
                        deadline = None;
                        if tick_tx.send(peer_id).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        RtcpTimer { tx }
    }

    pub fn start(&self, interval: Duration) {
        let _ = self.tx.send(TimerCommand::Start(interval));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(TimerCommand::Stop);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_per_arm() {
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
        let timer = RtcpTimer::new(42, tick_tx);

        timer.start(Duration::from_millis(100));
        assert_eq!(tick_rx.recv().await, Some(42));

        // Disarmed after firing: nothing else arrives.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(tick_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_deadline() {
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
        let timer = RtcpTimer::new(7, tick_tx);

        timer.start(Duration::from_secs(10));
        timer.start(Duration::from_millis(50));
        assert_eq!(tick_rx.recv().await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels() {
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
        let timer = RtcpTimer::new(7, tick_tx);

        timer.start(Duration::from_millis(50));
        timer.stop();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(tick_rx.try_recv().is_err());
    }
}
