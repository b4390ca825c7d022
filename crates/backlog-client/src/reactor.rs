//! 单线程非阻塞反应器。
//!
//! 循环结构固定为三步：应用积压的变更请求 → 阻塞轮询 → 分派就绪事件。套接字的
//! 注册、读写与关闭全部发生在这个线程上。

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::client::Shared;
use crate::listener::ListenerKey;
use crate::mutation::{Mutation, MutationQueue};
use crate::registry::ConnectionId;
use crate::send_state::{Priority, SendState};

const WAKER_TOKEN: Token = Token(0);
const THREAD_NAME: &str = "backlog-reactor";
const POLL_BACKOFF_MIN: Duration = Duration::from_millis(10);
const POLL_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// 反应器线程的外部句柄。
pub(crate) struct ReactorHandle {
    queue: Arc<MutationQueue>,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl ReactorHandle {
    pub(crate) fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    fn thread_id(&self) -> ThreadId {
        self.thread.thread().id()
    }

    /// 请求停止并回收线程；在反应器线程内部调用时只置位，不等待。
    pub(crate) fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.queue.wake();
        if self.thread_id() == thread::current().id() {
            debug!("stop requested from the reactor thread; exiting after this iteration");
            return;
        }
        if self.thread.join().is_err() {
            error!("reactor thread panicked");
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Connecting,
    Established,
}

struct Connection {
    stream: TcpStream,
    listener: ListenerKey,
    established: Arc<AtomicBool>,
    phase: Phase,
    interest: Interest,
    send: SendState,
}

/// 连接进入故障路径的原因，只用于日志。
enum Failure {
    Connect(io::Error),
    Register(io::Error),
    Read(io::Error),
    Write(io::Error),
    RemoteClosed,
    Requested,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Connect(err) => write!(f, "connect failed: {err}"),
            Failure::Register(err) => write!(f, "poll registration failed: {err}"),
            Failure::Read(err) => write!(f, "read failed: {err}"),
            Failure::Write(err) => write!(f, "write failed: {err}"),
            Failure::RemoteClosed => f.write_str("closed by remote"),
            Failure::Requested => f.write_str("reconnect requested"),
        }
    }
}

/// 轮询失败后的退避节奏：连续失败时等待时长翻倍，封顶 [`POLL_BACKOFF_MAX`]，成功一次即复位。
#[derive(Debug, Default)]
struct PollBackoff {
    failures: u32,
}

impl PollBackoff {
    fn reset(&mut self) {
        self.failures = 0;
    }

    /// 返回重试前的等待时长；`Interrupted` 不计入失败，立即重试。
    fn on_error(&mut self, err: &io::Error) -> Option<Duration> {
        if err.kind() == io::ErrorKind::Interrupted {
            return None;
        }
        self.failures = self.failures.saturating_add(1);
        let factor = 1u32.checked_shl(self.failures - 1).unwrap_or(u32::MAX);
        Some(POLL_BACKOFF_MIN.saturating_mul(factor).min(POLL_BACKOFF_MAX))
    }
}

/// 反应器本体，仅存在于反应器线程。
///
/// # 教案式说明
/// - **意图 (Why)**：把全部套接字 I/O 串行化到一个线程，连接状态（阶段、兴趣、优先级队列、缓冲）
///   因而无需加锁；
/// - **契约 (What)**：
///   - 建连完成以可写事件为准，随后兴趣切换为“可读”，队列非空时再加上“可写”；
///   - 任何 I/O 失败都会走同一条故障路径：注销、关闭、清除登记、回调 `on_disconnected`、安排重连；
///   - 针对已不存在连接的请求一律静默丢弃（连接 ID 从不复用）；
/// - **执行 (How)**：`mio` 为边沿触发，读路径循环到 `WouldBlock` 为止，写路径由 [`SendState`] 负责续写；
/// - **风险 (Trade-offs)**：回调在本线程同步执行，慢回调会拖延所有连接的 I/O。
pub(crate) struct Reactor {
    poll: Poll,
    queue: Arc<MutationQueue>,
    stop: Arc<AtomicBool>,
    shared: Arc<Shared>,
    connections: HashMap<ConnectionId, Connection>,
    events_capacity: usize,
    max_packet_size: usize,
}

impl Reactor {
    /// 创建轮询器与唤醒器并启动反应器线程。
    pub(crate) fn spawn(shared: Arc<Shared>) -> io::Result<ReactorHandle> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let queue = Arc::new(MutationQueue::new(waker));
        let stop = Arc::new(AtomicBool::new(false));

        let events_capacity = shared.config().events_capacity;
        let max_packet_size = shared.config().max_packet_size();
        let reactor = Reactor {
            poll,
            queue: Arc::clone(&queue),
            stop: Arc::clone(&stop),
            shared,
            connections: HashMap::new(),
            events_capacity,
            max_packet_size,
        };

        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || reactor.run())?;
        info!("reactor started");
        Ok(ReactorHandle {
            queue,
            stop,
            thread,
        })
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(self.events_capacity);
        let mut backoff = PollBackoff::default();
        while !self.stop.load(Ordering::Acquire) {
            self.apply_mutations();

            if let Err(err) = self.poll.poll(&mut events, None) {
                if let Some(pause) = backoff.on_error(&err) {
                    if backoff.failures == 1 {
                        error!(error = %err, "readiness poll failed; backing off");
                    } else {
                        debug!(
                            error = %err,
                            failures = backoff.failures,
                            ?pause,
                            "readiness poll still failing"
                        );
                    }
                    thread::sleep(pause);
                }
                continue;
            }
            backoff.reset();

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.dispatch(ConnectionId::from_token(event.token()), event);
            }
        }
        self.close_all();
        info!("reactor stopped");
    }

    fn apply_mutations(&mut self) {
        let batch = self.queue.drain();
        if !batch.is_empty() {
            trace!(count = batch.len(), "applying mutation requests");
        }
        for mutation in batch {
            self.apply(mutation);
        }
    }

    fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::Register {
                id,
                stream,
                listener,
                established,
            } => self.register(id, stream, listener, established),
            Mutation::ChangeInterest { id, interest } => self.change_interest(id, interest),
            Mutation::Enqueue {
                id,
                priority,
                frame,
            } => self.enqueue(id, priority, frame),
            Mutation::Reconnect { id } => {
                if self.connections.contains_key(&id) {
                    self.fail(id, Failure::Requested);
                } else {
                    trace!(connection = %id, "reconnect request for a closed connection ignored");
                }
            }
            Mutation::Close { id } => self.close(id),
        }
    }

    fn register(
        &mut self,
        id: ConnectionId,
        mut stream: TcpStream,
        listener: ListenerKey,
        established: Arc<AtomicBool>,
    ) {
        // 投递与应用之间监听者可能已被注销。
        if !self.shared.registry().lock().contains_connection(id) {
            debug!(
                station = listener.name(),
                connection = %id,
                "dropping connection of a deregistered station"
            );
            return;
        }

        let registered = self
            .poll
            .registry()
            .register(&mut stream, id.token(), Interest::WRITABLE);
        self.connections.insert(
            id,
            Connection {
                stream,
                listener,
                established,
                phase: Phase::Connecting,
                interest: Interest::WRITABLE,
                send: SendState::new(self.max_packet_size),
            },
        );
        if let Err(err) = registered {
            self.fail(id, Failure::Register(err));
        }
    }

    fn change_interest(&mut self, id: ConnectionId, interest: Interest) {
        match self.connections.get(&id).map(|conn| conn.phase) {
            Some(Phase::Established) => {
                if let Err(err) = self.set_interest(id, interest) {
                    self.fail(id, Failure::Register(err));
                }
            }
            Some(Phase::Connecting) => {
                trace!(connection = %id, "interest change ignored while connecting");
            }
            None => {
                trace!(connection = %id, "interest change for a closed connection ignored");
            }
        }
    }

    fn enqueue(&mut self, id: ConnectionId, priority: Priority, frame: Bytes) {
        match self.connections.get_mut(&id) {
            Some(conn) if conn.phase == Phase::Established => {
                trace!(
                    station = conn.listener.name(),
                    connection = %id,
                    priority,
                    bytes = frame.len(),
                    "frame queued"
                );
                conn.send.push(priority, frame);
            }
            _ => {
                debug!(connection = %id, "frame for an unavailable connection dropped");
            }
        }
    }

    fn dispatch(&mut self, id: ConnectionId, event: &Event) {
        let Some(phase) = self.connections.get(&id).map(|conn| conn.phase) else {
            trace!(connection = %id, "event for a closed connection ignored");
            return;
        };

        match phase {
            Phase::Connecting => {
                if event.is_writable() || event.is_error() || event.is_write_closed() {
                    self.finish_connect(id);
                }
            }
            Phase::Established => {
                if (event.is_readable() || event.is_read_closed() || event.is_error())
                    && !self.read(id)
                {
                    return;
                }
                if event.is_writable() {
                    self.write(id);
                }
            }
        }
    }

    fn finish_connect(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        match connect_outcome(&conn.stream) {
            Ok(None) => {
                // 边沿触发下不保证再有可写边沿，重新登记以重新武装。
                trace!(connection = %id, "spurious wakeup while connecting; re-arming");
                if let Err(err) = rearm_connect(self.poll.registry(), &mut conn.stream, id) {
                    self.fail(id, Failure::Register(err));
                }
            }
            Err(err) => self.fail(id, Failure::Connect(err)),
            Ok(Some(peer)) => {
                conn.phase = Phase::Established;
                conn.established.store(true, Ordering::Release);
                let listener = conn.listener.clone();
                if let Err(err) = self.set_interest(id, Interest::READABLE) {
                    self.fail(id, Failure::Register(err));
                    return;
                }
                info!(
                    station = listener.name(),
                    connection = %id,
                    %peer,
                    "connected to core station"
                );
                listener.listener().on_connected();
            }
        }
    }

    /// 读到 `WouldBlock` 为止；连接因此失败时返回 `false`。
    fn read(&mut self, id: ConnectionId) -> bool {
        loop {
            let Some(conn) = self.connections.get_mut(&id) else {
                return false;
            };
            match conn.stream.read(conn.send.read_buf_mut()) {
                Ok(0) => {
                    self.fail(id, Failure::RemoteClosed);
                    return false;
                }
                Ok(n) => {
                    trace!(connection = %id, bytes = n, "inbound bytes");
                    conn.listener.listener().on_data(&conn.send.read_buf()[..n]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.fail(id, Failure::Read(err));
                    return false;
                }
            }
        }
    }

    fn write(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        match conn.send.flush_into(&mut conn.stream) {
            Ok(report) => {
                trace!(
                    connection = %id,
                    written = report.written,
                    queued = conn.send.queued(),
                    "flushed send queue"
                );
                if report.drained {
                    debug_assert!(conn.send.is_idle());
                    if let Err(err) = self.set_interest(id, Interest::READABLE) {
                        self.fail(id, Failure::Register(err));
                    }
                }
            }
            Err(err) => self.fail(id, Failure::Write(err)),
        }
    }

    fn set_interest(&mut self, id: ConnectionId, interest: Interest) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        if conn.interest == interest {
            return Ok(());
        }
        self.poll
            .registry()
            .reregister(&mut conn.stream, id.token(), interest)?;
        conn.interest = interest;
        Ok(())
    }

    /// 故障路径：关闭连接、清除登记、回调并安排重连。
    fn fail(&mut self, id: ConnectionId, failure: Failure) {
        let Some(conn) = self.detach(id) else {
            return;
        };
        let still_registered = self.shared.connection_lost(&conn.listener, id);
        if !still_registered {
            debug!(
                station = conn.listener.name(),
                connection = %id,
                reason = %failure,
                "connection of a deregistered station closed"
            );
            return;
        }

        let delay_ms = self.shared.config().reconnect_delay_ms;
        match failure {
            Failure::Requested => info!(
                station = conn.listener.name(),
                connection = %id,
                delay_ms,
                "reconnecting on request"
            ),
            reason => warn!(
                station = conn.listener.name(),
                connection = %id,
                reason = %reason,
                delay_ms,
                "core station connection lost; reconnect scheduled"
            ),
        }
        conn.listener.listener().on_disconnected();
    }

    fn close(&mut self, id: ConnectionId) {
        if let Some(conn) = self.detach(id) {
            debug!(
                station = conn.listener.name(),
                connection = %id,
                "connection closed"
            );
        }
    }

    fn detach(&mut self, id: ConnectionId) -> Option<Connection> {
        let mut conn = self.connections.remove(&id)?;
        conn.established.store(false, Ordering::Release);
        if let Err(err) = self.poll.registry().deregister(&mut conn.stream) {
            trace!(connection = %id, error = %err, "deregister failed");
        }
        Some(conn)
    }

    fn close_all(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            let Some(conn) = self.detach(id) else {
                continue;
            };
            let was_established = conn.phase == Phase::Established;
            if self.shared.connection_closed(id) && was_established {
                conn.listener.listener().on_disconnected();
            }
        }
    }
}

fn rearm_connect(
    registry: &mio::Registry,
    stream: &mut TcpStream,
    id: ConnectionId,
) -> io::Result<()> {
    registry.reregister(stream, id.token(), Interest::WRITABLE)
}

/// 判定非阻塞建连是否完成：`Ok(None)` 表示仍在进行。
fn connect_outcome(stream: &TcpStream) -> io::Result<Option<SocketAddr>> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(peer) => Ok(Some(peer)),
        Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn writable_within(
        poll: &mut Poll,
        events: &mut Events,
        id: ConnectionId,
        within: Duration,
    ) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            poll.poll(events, Some(Duration::from_millis(50)))
                .expect("轮询成功");
            if events
                .iter()
                .any(|event| event.token() == id.token() && event.is_writable())
            {
                return true;
            }
        }
        false
    }

    #[test]
    fn poll_backoff_doubles_up_to_the_cap_and_resets() {
        let mut backoff = PollBackoff::default();
        let interrupted = io::Error::from(io::ErrorKind::Interrupted);
        let broken = io::Error::from(io::ErrorKind::Other);

        assert_eq!(backoff.on_error(&interrupted), None);
        assert_eq!(backoff.on_error(&broken), Some(POLL_BACKOFF_MIN));
        assert_eq!(backoff.on_error(&broken), Some(POLL_BACKOFF_MIN * 2));
        assert_eq!(backoff.on_error(&broken), Some(POLL_BACKOFF_MIN * 4));
        for _ in 0..40 {
            backoff.on_error(&broken);
        }
        assert_eq!(backoff.on_error(&broken), Some(POLL_BACKOFF_MAX));

        backoff.reset();
        assert_eq!(backoff.on_error(&broken), Some(POLL_BACKOFF_MIN));
    }

    #[test]
    fn re_arming_a_connecting_stream_reports_writability_again() {
        let server = std::net::TcpListener::bind("127.0.0.1:0").expect("绑定回环端口");
        let addr = server.local_addr().expect("读取本地地址");
        let mut poll = Poll::new().expect("创建轮询器");
        let mut events = Events::with_capacity(8);
        let id = ConnectionId::from_token(Token(1));

        let mut stream = TcpStream::connect(addr).expect("发起建连");
        poll.registry()
            .register(&mut stream, id.token(), Interest::WRITABLE)
            .expect("登记套接字");
        assert!(writable_within(&mut poll, &mut events, id, Duration::from_secs(2)));
        assert!(matches!(connect_outcome(&stream), Ok(Some(peer)) if peer == addr));

        // 边沿已被消费；重新武装后必须再次报告可写。
        rearm_connect(poll.registry(), &mut stream, id).expect("重新登记");
        assert!(writable_within(&mut poll, &mut events, id, Duration::from_secs(2)));
    }
}
