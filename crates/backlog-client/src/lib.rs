#![doc = r#"
# backlog-client

## 设计动机（Why）
- **定位**：传感网中间件通过 TCP 从远端现场网关（核心站）接入数据；本 crate 是与这些核心站
  对话的异步客户端，负责同时维护多条连接、按优先级发送分帧消息、分发入站字节，并在故障后
  透明重连。
- **并发核心**：所有套接字系统调用集中在单个反应器线程；注册、发送、重连等请求可来自任意调用线程，
  统一经由变更请求队列合并进反应器的控制流，轮询本身从不加锁。

## 核心契约（What）
- [`CoreStationClient::register_listener`]：惰性启动反应器并发起非阻塞建连；地址解析失败不报错，
  转为延迟重连；
- [`CoreStationClient::send`]：按部署/设备路由、分帧、入队并唤醒反应器，立即返回是否已建连以及
  入队字节数，不等待字节离开套接字；
- [`CoreStationClient::deregister_listener`]：同步移除登记与路由；最后一个监听者离开时停止并回收反应器线程；
- 瞬时连接故障只在日志中以 `warn` 出现，调用方同步可见的错误仅有寻址与尺寸两类。

## 实现策略（How）
- 反应器基于 `mio` 的 `Poll` + `Waker`；变更请求队列为 `parking_lot::Mutex<VecDeque<_>>`，
  提交即唤醒，反应器每轮整体换出；
- 每条连接的优先级队列、读写缓冲只由反应器线程触碰；跨线程共享的仅有连接登记表（互斥锁）与
  设备路由表（`DashMap`）；
- 重连由独立的定时线程按固定延迟触发，执行时重新走注册路径，失效的任务依据纪元号自然作废。

## 风险与考量（Trade-offs）
- 名称解析在调用线程（或定时线程）上同步执行，慢 DNS 会推迟该线程上的其他工作；
- 监听者回调运行在反应器线程上，回调内的长耗时操作会拖慢所有连接。
"#]

mod client;
mod config;
mod error;
mod listener;
mod mutation;
mod reactor;
mod registry;
mod routing;
mod scheduler;
mod send_state;

#[cfg(feature = "telemetry")]
pub mod telemetry;

pub use client::{CoreStationClient, SendOutcome};
pub use config::{ClientConfig, ConfigError};
pub use error::ClientError;
pub use listener::{CoreStationListener, SharedListener};
pub use registry::ConnectionId;
pub use routing::{DeviceId, Target};
pub use send_state::{HELLO_PRIORITY, Priority};
