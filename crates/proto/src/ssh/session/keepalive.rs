//! Transport keep-alive.
//!
//! Sends SSH_MSG_IGNORE at a fixed interval so idle connections are not
//! dropped by NAT boxes or server idle timers. The payload is random so the
//! heartbeat is indistinguishable from padding traffic.

use crate::ssh::connection_mgr::PacketTransport;
use crate::ssh::message::MessageType;
use crate::ssh::wire::write_bytes;
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Random bytes carried by each heartbeat.
pub const KEEPALIVE_DATA_LEN: usize = 16;

/// Background heartbeat over a transport.
///
/// The task stops on the first send failure, on [`stop`](Self::stop), or
/// when the handle is dropped.
#[derive(Debug)]
pub struct Keepalive {
    interval: Duration,
    task: JoinHandle<()>,
}

impl Keepalive {
    /// Starts sending heartbeats every `interval`, first one after one interval.
    pub fn start(transport: Arc<dyn PacketTransport>, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            debug!(?interval, "Keep-alive started");
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if transport.is_closed() {
                    break;
                }
                match transport.send_packet(ignore_message(KEEPALIVE_DATA_LEN)).await {
                    Ok(()) => trace!("Keep-alive sent"),
                    Err(e) => {
                        warn!("Keep-alive failed: {} - stopping", e);
                        break;
                    }
                }
            }
            debug!("Keep-alive stopped");
        });
        Self { interval, task }
    }

    /// Heartbeat interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stops the heartbeat.
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Whether the heartbeat task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Builds an SSH_MSG_IGNORE payload with `data_len` random bytes.
///
/// ```text
/// byte    SSH_MSG_IGNORE (2)
/// string  data
/// ```
///
/// ```rust
/// use tern_proto::ssh::session::ignore_message;
///
/// let msg = ignore_message(32);
/// assert_eq!(msg[0], 2);
/// assert_eq!(msg.len(), 1 + 4 + 32);
/// ```
pub fn ignore_message(data_len: usize) -> Vec<u8> {
    let mut data = vec![0u8; data_len];
    rand::thread_rng().fill_bytes(&mut data);

    let mut msg = BytesMut::with_capacity(1 + 4 + data_len);
    msg.put_u8(MessageType::Ignore as u8);
    write_bytes(&mut msg, &data);
    msg.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tern_platform::{TernError, TernResult};

    struct CountingTransport {
        sent: AtomicU32,
        fail_after: u32,
        closed: AtomicBool,
    }

    #[async_trait]
    impl PacketTransport for CountingTransport {
        async fn send_packet(&self, payload: Vec<u8>) -> TernResult<()> {
            self.queue_packet(payload)
        }

        fn queue_packet(&self, payload: Vec<u8>) -> TernResult<()> {
            assert_eq!(payload[0], MessageType::Ignore as u8);
            let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.fail_after {
                return Err(TernError::TransportClosed("gone".to_string()));
            }
            Ok(())
        }

        async fn receive_packet(&self) -> TernResult<Vec<u8>> {
            std::future::pending().await
        }

        async fn close(&self, _reason: u32, _description: &str) -> TernResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn transport(fail_after: u32) -> Arc<CountingTransport> {
        Arc::new(CountingTransport {
            sent: AtomicU32::new(0),
            fail_after,
            closed: AtomicBool::new(false),
        })
    }

    #[test]
    fn test_ignore_message_format() {
        let msg = ignore_message(0);
        assert_eq!(msg, vec![MessageType::Ignore as u8, 0, 0, 0, 0]);

        let msg = ignore_message(32);
        let data_len = u32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]);
        assert_eq!(data_len, 32);
        assert_eq!(msg.len(), 37);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_at_interval() {
        let counter = transport(u32::MAX);
        let keepalive = Keepalive::start(counter.clone(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(counter.sent.load(Ordering::SeqCst), 3);
        assert!(keepalive.is_running());

        keepalive.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(counter.sent.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_send_failure() {
        let counter = transport(1);
        let keepalive = Keepalive::start(counter.clone(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.sent.load(Ordering::SeqCst), 2);
        assert!(!keepalive.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_transport_closed() {
        let counter = transport(u32::MAX);
        let keepalive = Keepalive::start(counter.clone(), Duration::from_secs(5));
        counter.close(11, "bye").await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(counter.sent.load(Ordering::SeqCst), 0);
        assert!(!keepalive.is_running());
    }
}
