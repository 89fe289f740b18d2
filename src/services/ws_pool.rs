use crate::error::{ApiError, ApiResult};
use crate::utils::mask_token;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{interval_at, sleep_until, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// 心跳间隔
pub const PING_INTERVAL: Duration = Duration::from_secs(8);
/// 连接寿命
pub const CONNECTION_TTL: Duration = Duration::from_secs(30 * 60);

pub(crate) const SUBPROTOCOL: &str = "json.reliable.webpubsub.azure.v1";

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// 单条 relay 连接。读与心跳都在独立任务里，外部只通过通道交互
pub struct WsConnection {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    alive: Arc<AtomicBool>,
    expires_at: Instant,
}

impl WsConnection {
    pub async fn connect(url: &str) -> ApiResult<Arc<Self>> {
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        let (socket, _) = connect_async(request).await?;
        info!("WebSocket relay 已连接");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let expires_at = Instant::now() + CONNECTION_TTL;

        tokio::spawn(run_connection(
            socket,
            outbound_rx,
            inbound_tx,
            alive.clone(),
            expires_at,
        ));

        Ok(Arc::new(Self {
            outbound: outbound_tx,
            inbound: AsyncMutex::new(inbound_rx),
            alive,
            expires_at,
        }))
    }

    /// 未断开且未过期
    pub fn is_usable(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && Instant::now() < self.expires_at
    }

    pub fn send_text(&self, text: String) -> ApiResult<()> {
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| ApiError::WebSocket("connection closed".to_string()))
    }

    /// 下一条文本帧，连接结束后返回 None
    pub async fn recv(&self) -> Option<String> {
        self.inbound.lock().await.recv().await
    }

    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None));
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Arc<Self> {
        let (outbound, _) = mpsc::unbounded_channel();
        let (_, inbound) = mpsc::unbounded_channel();
        Arc::new(Self {
            outbound,
            inbound: AsyncMutex::new(inbound),
            alive: Arc::new(AtomicBool::new(true)),
            expires_at: Instant::now() + CONNECTION_TTL,
        })
    }
}

/// 连接任务：转发读到的文本帧，定时 ping，写出外部消息。任一失败或到期即关闭
async fn run_connection(
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    inbound: mpsc::UnboundedSender<String>,
    alive: Arc<AtomicBool>,
    expires_at: Instant,
) {
    let (mut sink, mut stream) = socket.split();
    let mut ticker = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let expiry = sleep_until(expires_at);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            _ = &mut expiry => {
                debug!("WebSocket relay 已到期，关闭");
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(text).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket relay 被远端关闭");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket 读取失败: {}", e);
                    break;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    warn!("WebSocket ping 失败: {}", e);
                    break;
                }
            }
            message = outbound.recv() => match message {
                Some(Message::Close(frame)) => {
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        warn!("WebSocket 写入失败: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    alive.store(false, Ordering::SeqCst);
    let _ = sink.close().await;
}

struct Slot {
    id: u64,
    owner: Option<String>,
    connection: Option<Arc<WsConnection>>,
}

/// 按 bearer token 分组的连接池
#[derive(Default)]
pub struct WsPool {
    slots: Mutex<HashMap<String, Vec<Slot>>>,
    next_id: AtomicU64,
}

impl WsPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 锁定第一个空闲槽位，没有则新建
    pub fn lease(self: &Arc<Self>, token: &str, owner: &str) -> ConnectionLease {
        let mut slots = self.slots.lock();
        prune(&mut slots);
        let entries = slots.entry(token.to_string()).or_default();

        let slot_id = match entries.iter_mut().find(|s| s.owner.is_none()) {
            Some(slot) => {
                slot.owner = Some(owner.to_string());
                slot.id
            }
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                entries.push(Slot {
                    id,
                    owner: Some(owner.to_string()),
                    connection: None,
                });
                id
            }
        };

        debug!("租用连接槽位 {} ({})", slot_id, mask_token(token));
        ConnectionLease {
            pool: Arc::clone(self),
            token: token.to_string(),
            slot_id,
            owner: owner.to_string(),
        }
    }

    fn with_slot<R>(&self, token: &str, slot_id: u64, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        let mut slots = self.slots.lock();
        slots
            .get_mut(token)
            .and_then(|entries| entries.iter_mut().find(|s| s.id == slot_id))
            .map(f)
    }

    /// 当前被锁定的槽位数
    #[cfg(test)]
    pub fn locked_count(&self, token: &str) -> usize {
        self.slots
            .lock()
            .get(token)
            .map(|entries| entries.iter().filter(|s| s.owner.is_some()).count())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn token_count(&self) -> usize {
        self.slots.lock().len()
    }
}

/// 丢弃没有可用连接的空闲槽位，以及已经没有槽位的 token
fn prune(slots: &mut HashMap<String, Vec<Slot>>) {
    slots.retain(|_, entries| {
        entries.retain(|slot| {
            if slot.owner.is_some() {
                return true;
            }
            match &slot.connection {
                Some(conn) if conn.is_usable() => true,
                Some(conn) => {
                    conn.close();
                    false
                }
                None => false,
            }
        });
        !entries.is_empty()
    });
}

/// 持有期间独占一个槽位，Drop 时解锁
pub struct ConnectionLease {
    pool: Arc<WsPool>,
    token: String,
    slot_id: u64,
    owner: String,
}

impl ConnectionLease {
    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    #[cfg(test)]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// 可用的连接；过期或已断开的连接会被关闭并清除
    pub fn connection(&self) -> Option<Arc<WsConnection>> {
        self.pool
            .with_slot(&self.token, self.slot_id, |slot| {
                match slot.connection.take() {
                    Some(conn) if conn.is_usable() => {
                        slot.connection = Some(conn.clone());
                        Some(conn)
                    }
                    Some(conn) => {
                        conn.close();
                        None
                    }
                    None => None,
                }
            })
            .flatten()
    }

    pub fn install(&self, connection: Arc<WsConnection>) {
        self.pool.with_slot(&self.token, self.slot_id, |slot| {
            if let Some(old) = slot.connection.replace(connection) {
                old.close();
            }
        });
    }

    /// 拆除当前连接，下次使用时重建
    pub fn discard(&self) {
        self.pool.with_slot(&self.token, self.slot_id, |slot| {
            if let Some(conn) = slot.connection.take() {
                conn.close();
            }
        });
    }

    /// 复用池中连接，否则连接到 url
    pub async fn connect(&self, url: &str) -> ApiResult<Arc<WsConnection>> {
        if let Some(conn) = self.connection() {
            return Ok(conn);
        }
        let conn = WsConnection::connect(url).await?;
        self.install(conn.clone());
        Ok(conn)
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let owner = &self.owner;
        self.pool.with_slot(&self.token, self.slot_id, |slot| {
            if slot.owner.as_deref() == Some(owner.as_str()) {
                slot.owner = None;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_lease_reuses_released_slot() {
        let pool = WsPool::new();
        let first = pool.lease("token", "req-1");
        let second = pool.lease("token", "req-2");
        assert_ne!(first.slot_id(), second.slot_id());
        assert_eq!(pool.locked_count("token"), 2);

        let conn = WsConnection::detached();
        first.install(conn.clone());
        let first_id = first.slot_id();
        drop(first);
        assert_eq!(pool.locked_count("token"), 1);

        let third = pool.lease("token", "req-3");
        assert_eq!(third.slot_id(), first_id);
        assert_eq!(third.owner(), "req-3");
        assert!(Arc::ptr_eq(&third.connection().unwrap(), &conn));
    }

    #[test]
    fn test_idle_dead_slots_and_tokens_are_pruned() {
        let pool = WsPool::new();
        let old = pool.lease("old-token", "req-1");
        let conn = WsConnection::detached();
        old.install(conn.clone());
        drop(old);
        assert_eq!(pool.token_count(), 1);

        // 空闲但仍可用的连接保留
        let _other = pool.lease("new-token", "req-2");
        assert_eq!(pool.token_count(), 2);

        conn.close();
        let _again = pool.lease("new-token", "req-3");
        assert_eq!(pool.token_count(), 1);
        assert_eq!(pool.locked_count("old-token"), 0);
    }

    #[test]
    fn test_slots_are_per_token() {
        let pool = WsPool::new();
        let a = pool.lease("token-a", "req");
        let b = pool.lease("token-b", "req");
        assert_ne!(a.slot_id(), b.slot_id());
        assert_eq!(pool.locked_count("token-a"), 1);
        assert_eq!(pool.locked_count("token-b"), 1);
    }

    #[test]
    fn test_discard_and_expired_connection() {
        let pool = WsPool::new();
        let lease = pool.lease("token", "req");
        assert!(lease.connection().is_none());

        let conn = WsConnection::detached();
        lease.install(conn.clone());
        assert!(lease.connection().is_some());

        conn.close();
        assert!(!conn.is_usable());
        assert!(lease.connection().is_none());

        lease.install(WsConnection::detached());
        lease.discard();
        assert!(lease.connection().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_leases_never_share_a_slot() {
        let pool = WsPool::new();
        let held = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = Vec::new();
        for i in 0..64 {
            let pool = pool.clone();
            let held = held.clone();
            handles.push(tokio::spawn(async move {
                for round in 0..20 {
                    let lease = pool.lease("token", &format!("req-{}-{}", i, round));
                    assert!(held.lock().insert(lease.slot_id()), "slot leased twice");
                    tokio::task::yield_now().await;
                    held.lock().remove(&lease.slot_id());
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(pool.locked_count("token"), 0);
    }
}
