use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use backlog_codec::hello_probe;
use bytes::Bytes;
use mio::Interest;
use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::listener::{ListenerKey, SharedListener};
use crate::mutation::Mutation;
use crate::reactor::{Reactor, ReactorHandle};
use crate::registry::{ConnectionId, Registry};
use crate::routing::{DeviceId, RoutingTable, Target};
use crate::scheduler::{ReconnectScheduler, ReconnectTask};
use crate::send_state::{HELLO_PRIORITY, Priority};

const SCHEDULER_THREAD: &str = "backlog-reconnect";

static HELLO: [u8; 2] = hello_probe();

/// 一次发送请求的即时结果。
///
/// `accepted == false` 表示目标核心站当前未建连，消息被丢弃；这不是错误，断线期间的数据由上层自行取舍。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SendOutcome {
    pub accepted: bool,
    /// 入队的线路字节数（含长度前缀与转义）。
    pub queued_bytes: usize,
}

/// 反应器、定时线程与调用线程共享的状态。
///
/// 锁顺序固定为 `reactor` → `registry` → 变更请求队列，任何路径都不反向获取。
pub(crate) struct Shared {
    config: ClientConfig,
    registry: Mutex<Registry>,
    routes: RoutingTable,
    scheduler: ReconnectScheduler<ReconnectTask>,
    reactor: Mutex<Option<ReactorHandle>>,
}

impl Shared {
    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &Mutex<Registry> {
        &self.registry
    }

    /// 反应器报告连接失败；监听者仍在册时安排重连并返回 `true`。
    pub(crate) fn connection_lost(&self, listener: &ListenerKey, id: ConnectionId) -> bool {
        let epoch = self.registry.lock().detach_connection(id);
        match epoch {
            Some(epoch) => {
                self.schedule_reconnect(listener, epoch);
                true
            }
            None => false,
        }
    }

    /// 反应器退出时摘除连接，不安排重连。
    pub(crate) fn connection_closed(&self, id: ConnectionId) -> bool {
        self.registry.lock().detach_connection(id).is_some()
    }

    fn schedule_reconnect(&self, listener: &ListenerKey, epoch: u64) {
        let task = ReconnectTask {
            listener: listener.clone(),
            epoch,
        };
        if !self.scheduler.schedule(task, self.config.reconnect_delay()) {
            debug!(station = listener.name(), "client is shutting down; reconnect dropped");
        }
    }

    /// 解析地址、发起非阻塞建连并把套接字交给反应器。
    ///
    /// 任一步失败都不会向调用方报错，而是回调 `on_disconnected` 并按延迟重试。
    fn connect(&self, listener: ListenerKey, epoch: u64) {
        if !self.registry.lock().awaits_connection(&listener, epoch) {
            debug!(station = listener.name(), epoch, "stale connection attempt skipped");
            return;
        }

        let stream = match open_stream(&listener) {
            Ok(stream) => stream,
            Err((addr, err)) => {
                warn!(
                    station = listener.name(),
                    address = listener.listener().address(),
                    port = listener.listener().port(),
                    resolved = ?addr,
                    error = %err,
                    delay_ms = self.config.reconnect_delay_ms,
                    "cannot reach core station; retrying later"
                );
                self.retry_later(&listener, epoch);
                return;
            }
        };

        let reactor = self.reactor.lock();
        let Some(handle) = reactor.as_ref() else {
            debug!(station = listener.name(), "reactor is stopped; connection attempt dropped");
            return;
        };
        let mut registry = self.registry.lock();
        if !registry.awaits_connection(&listener, epoch) {
            debug!(station = listener.name(), epoch, "connection attempt superseded");
            return;
        }
        let established = Arc::new(AtomicBool::new(false));
        let Some(id) = registry.attach(&listener, Arc::clone(&established)) else {
            return;
        };
        debug!(station = listener.name(), connection = %id, "connecting to core station");
        handle.queue().submit(Mutation::Register {
            id,
            stream,
            listener,
            established,
        });
    }

    fn retry_later(&self, listener: &ListenerKey, epoch: u64) {
        let next = self.registry.lock().retry_epoch(listener, epoch);
        if let Some(next) = next {
            self.schedule_reconnect(listener, next);
            listener.listener().on_disconnected();
        }
    }

    /// 把一条已分帧消息交给反应器；目标未建连时返回未接受。
    fn enqueue(&self, listener: &ListenerKey, priority: Priority, frame: Bytes) -> SendOutcome {
        let reactor = self.reactor.lock();
        let registry = self.registry.lock();
        let (Some(handle), Some((id, true))) = (reactor.as_ref(), registry.connection_of(listener))
        else {
            warn!(station = listener.name(), "core station is not connected; message dropped");
            return SendOutcome::default();
        };

        let queued_bytes = frame.len();
        handle.queue().submit_all([
            Mutation::Enqueue {
                id,
                priority,
                frame,
            },
            Mutation::ChangeInterest {
                id,
                interest: Interest::READABLE | Interest::WRITABLE,
            },
        ]);
        SendOutcome {
            accepted: true,
            queued_bytes,
        }
    }

    fn shutdown(&self) {
        let handle = self.reactor.lock().take();
        if let Some(handle) = handle {
            handle.stop();
        }
        self.scheduler.shutdown();
    }
}

fn open_stream(listener: &ListenerKey) -> Result<TcpStream, (Option<SocketAddr>, std::io::Error)> {
    let addrs = listener.listener().resolve().map_err(|err| (None, err))?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some((Some(addr), err)),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        (
            None,
            std::io::Error::new(std::io::ErrorKind::NotFound, "no address to connect to"),
        )
    }))
}

/// 核心站客户端。
///
/// # 教案式说明
/// - **意图 (Why)**：为上层包装器提供“注册即连、断线自愈、按设备路由发送”的统一入口，
///   把非阻塞 I/O 与重连细节全部隐藏在反应器之后；
/// - **契约 (What)**：
///   - 所有方法可从任意线程并发调用，也可在监听者回调内调用；
///   - 反应器在第一次注册时启动、在最后一个监听者注销时停止，再次注册会重新启动；
///   - 丢弃客户端会停止反应器与定时线程，仍在线的监听者收到 `on_disconnected`；
/// - **执行 (How)**：调用线程只做校验、分帧与登记表更新，随后把意图投递给反应器；
/// - **风险 (Trade-offs)**：发送结果只代表“已入队”，字节是否送达取决于连接后续状况。
pub struct CoreStationClient {
    shared: Arc<Shared>,
}

impl CoreStationClient {
    /// 以给定配置创建客户端并启动重连定时线程；反应器延迟到第一次注册时启动。
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let shared = Arc::new(Shared {
            config,
            registry: Mutex::new(Registry::new()),
            routes: RoutingTable::new(),
            scheduler: ReconnectScheduler::new(),
            reactor: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        shared
            .scheduler
            .start(SCHEDULER_THREAD, move |task: ReconnectTask| {
                if let Some(shared) = weak.upgrade() {
                    shared.connect(task.listener, task.epoch);
                }
            })
            .map_err(|err| ClientError::startup("reconnect scheduler", err))?;

        Ok(Self { shared })
    }

    pub fn with_defaults() -> Result<Self, ClientError> {
        Self::new(ClientConfig::default())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// 注册监听者并发起建连。
    ///
    /// 已注册的监听者再次注册不产生任何效果。地址解析或建连的即时失败不会返回错误，
    /// 而是回调 `on_disconnected` 并在重连延迟后重试；唯一的错误来源是反应器线程无法启动。
    pub fn register_listener(&self, listener: SharedListener) -> Result<(), ClientError> {
        let key = ListenerKey::new(listener);
        let epoch = {
            let mut reactor = self.shared.reactor.lock();
            if reactor.is_none() {
                let handle = Reactor::spawn(Arc::clone(&self.shared))
                    .map_err(|err| ClientError::startup("reactor", err))?;
                *reactor = Some(handle);
            }
            match self.shared.registry.lock().open_station(&key) {
                Some(epoch) => epoch,
                None => {
                    debug!(station = key.name(), "core station already registered");
                    return Ok(());
                }
            }
        };

        info!(
            station = key.name(),
            address = key.listener().address(),
            port = key.listener().port(),
            "core station registered"
        );
        self.shared.connect(key, epoch);
        Ok(())
    }

    /// 注销监听者，关闭其连接并删除其全部设备路由。
    ///
    /// 未注册时返回 `false`。注销最后一个监听者会停止反应器；在反应器线程（监听者回调）内
    /// 调用时不会等待反应器退出。
    pub fn deregister_listener(&self, listener: &SharedListener) -> bool {
        let key = ListenerKey::of(listener);
        let stopped = {
            let mut reactor = self.shared.reactor.lock();
            let mut registry = self.shared.registry.lock();
            let Some(connection) = registry.remove_station(&key) else {
                warn!(station = key.name(), "deregistration of an unknown core station ignored");
                return false;
            };
            let routes = self.shared.routes.remove_listener(&key);
            if let (Some(id), Some(handle)) = (connection, reactor.as_ref()) {
                handle.queue().submit(Mutation::Close { id });
            }
            info!(station = key.name(), routes, "core station deregistered");

            if registry.station_count() == 0 {
                reactor.take()
            } else {
                None
            }
        };

        if let Some(handle) = stopped {
            debug!("last core station deregistered; stopping reactor");
            handle.stop();
        }
        true
    }

    /// 按部署与目标发送一条负载。
    ///
    /// 寻址先于尺寸校验；两类错误都发生在任何字节入队之前。广播时返回最后一个接受方的结果，
    /// 没有任何核心站在线则返回未接受。
    pub fn send(
        &self,
        deployment: &str,
        target: Target<'_>,
        priority: Priority,
        payload: &[u8],
    ) -> Result<SendOutcome, ClientError> {
        let targets = self.shared.routes.resolve(deployment, target)?;
        let frame = backlog_codec::frame(payload, self.shared.config.max_packet_size())?;

        let mut outcome = SendOutcome::default();
        for listener in &targets {
            let delivered = self.shared.enqueue(listener, priority, frame.clone());
            if delivered.accepted {
                outcome = delivered;
            }
        }
        Ok(outcome)
    }

    /// 发送存活探测（两字节控制序列，不分帧，优先级为 [`HELLO_PRIORITY`]）。
    ///
    /// 未注册的监听者返回 [`ClientError::NotRegistered`]；已注册但未建连时返回未接受。
    pub fn send_hello(&self, listener: &SharedListener) -> Result<SendOutcome, ClientError> {
        let key = ListenerKey::of(listener);
        if !self.shared.registry.lock().is_registered(&key) {
            return Err(ClientError::NotRegistered {
                station: key.name().to_owned(),
            });
        }
        Ok(self
            .shared
            .enqueue(&key, HELLO_PRIORITY, Bytes::from_static(&HELLO)))
    }

    /// 请求断开并按延迟重连；监听者当前没有连接时返回 `false`。
    pub fn request_reconnect(&self, listener: &SharedListener) -> bool {
        let key = ListenerKey::of(listener);
        let reactor = self.shared.reactor.lock();
        let registry = self.shared.registry.lock();
        match (reactor.as_ref(), registry.connection_of(&key)) {
            (Some(handle), Some((id, _))) => {
                handle.queue().submit(Mutation::Reconnect { id });
                true
            }
            _ => false,
        }
    }

    /// 登记 `(deployment, device_id)` 由 `listener` 承载；可在建连之前调用。
    pub fn add_device_id(
        &self,
        deployment: &str,
        device_id: DeviceId,
        listener: &SharedListener,
    ) -> Result<(), ClientError> {
        let previous = self.shared.routes.add(deployment, device_id, listener)?;
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, listener) {
                warn!(
                    deployment,
                    device_id = device_id.get(),
                    previous = previous.name(),
                    station = listener.name(),
                    "device re-routed to another core station"
                );
            }
        }
        debug!(deployment, device_id = device_id.get(), station = listener.name(), "device route added");
        Ok(())
    }

    pub fn remove_device_id(&self, deployment: &str, device_id: DeviceId) -> bool {
        self.shared.routes.remove(deployment, device_id).is_some()
    }

    /// 监听者当前是否有已建立的连接。
    pub fn is_connected(&self, listener: &SharedListener) -> bool {
        self.shared
            .registry
            .lock()
            .connection_of(&ListenerKey::of(listener))
            .is_some_and(|(_, established)| established)
    }

    pub fn is_registered(&self, listener: &SharedListener) -> bool {
        self.shared.registry.lock().is_registered(&ListenerKey::of(listener))
    }

    pub fn registered_count(&self) -> usize {
        self.shared.registry.lock().station_count()
    }

    /// 反应器线程是否在运行。
    pub fn is_running(&self) -> bool {
        self.shared.reactor.lock().is_some()
    }

    /// 当前有路由的部署名，按字典序。
    pub fn deployments(&self) -> Vec<String> {
        self.shared.routes.deployments()
    }

    pub fn device_ids(&self, deployment: &str) -> Vec<DeviceId> {
        self.shared.routes.device_ids(deployment)
    }
}

impl Drop for CoreStationClient {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}
