use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

/// 核心站监听者：一条到远端核心站的逻辑连接在调用方一侧的化身。
///
/// # 教案式说明
/// - **意图 (Why)**：客户端不关心数据语义，只需要知道“连到哪里”以及“把事件交给谁”；
///   这一 trait 把两件事合在同一个对象上，对象身份即连接身份；
/// - **契约 (What)**：
///   - `name`/`address`/`port` 在对象生命周期内保持不变；
///   - 回调均在反应器线程上执行，实现必须 `Send + Sync` 且不得长时间阻塞；
///   - `on_data` 收到的是一次读调用的原始字节，帧重组由实现自行负责（可借助
///     [`backlog_codec::FrameDecoder`]）；
/// - **风险 (Trade-offs)**：回调内允许再次调用客户端 API（发送、注销），但注销最后一个监听者时
///   反应器线程不会在回调内等待自身退出。
pub trait CoreStationListener: Send + Sync {
    /// 日志中使用的核心站名称。
    fn name(&self) -> &str;

    /// 核心站主机名或 IP。
    fn address(&self) -> &str;

    fn port(&self) -> u16;

    /// 将 `address:port` 解析为候选套接字地址。
    ///
    /// 默认走系统解析器；解析结果为空视为失败，触发延迟重连。
    fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (self.address(), self.port()).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("`{}` resolved to no addresses", self.address()),
            ));
        }
        Ok(addrs)
    }

    /// 连接建立完成。
    fn on_connected(&self);

    /// 连接丢失（包括建连失败），随后会按配置延迟重连。
    fn on_disconnected(&self);

    /// 收到入站字节。
    fn on_data(&self, data: &[u8]);
}

/// 客户端持有的监听者句柄。
pub type SharedListener = Arc<dyn CoreStationListener>;

/// 以数据指针为身份的监听者键。
///
/// `Arc::ptr_eq` 对 trait 对象会连同虚表指针一起比较，同一对象经不同路径转型后可能判为不等，
/// 因此这里只取数据指针。
#[derive(Clone)]
pub(crate) struct ListenerKey(SharedListener);

impl ListenerKey {
    pub(crate) fn new(listener: SharedListener) -> Self {
        Self(listener)
    }

    pub(crate) fn of(listener: &SharedListener) -> Self {
        Self(Arc::clone(listener))
    }

    pub(crate) fn listener(&self) -> &dyn CoreStationListener {
        self.0.as_ref()
    }

    pub(crate) fn shared(&self) -> &SharedListener {
        &self.0
    }

    pub(crate) fn name(&self) -> &str {
        self.0.name()
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0).cast::<()>()
    }
}

impl PartialEq for ListenerKey {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ListenerKey {}

impl Hash for ListenerKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerKey")
            .field("name", &self.name())
            .field("address", &self.0.address())
            .field("port", &self.0.port())
            .finish()
    }
}
