//! 跨线程变更请求。
//!
//! 调用线程不直接操作套接字或轮询注册，而是把意图封装为 [`Mutation`] 投递到
//! [`MutationQueue`]，由反应器在下一轮轮询之前统一应用。

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Waker};
use parking_lot::Mutex;
use tracing::warn;

use crate::listener::ListenerKey;
use crate::registry::ConnectionId;
use crate::send_state::Priority;

/// 反应器待处理的一条请求。
pub(crate) enum Mutation {
    /// 把正在建连的套接字纳入轮询，初始只关注可写（建连完成）。
    Register {
        id: ConnectionId,
        stream: TcpStream,
        listener: ListenerKey,
        established: Arc<AtomicBool>,
    },
    /// 调整兴趣集合；对仍在建连的连接无效。
    ChangeInterest { id: ConnectionId, interest: Interest },
    /// 把一条已分帧的消息放入连接的优先级队列。
    Enqueue {
        id: ConnectionId,
        priority: Priority,
        frame: Bytes,
    },
    /// 主动断开并走故障路径，随后按延迟重连。
    Reconnect { id: ConnectionId },
    /// 静默关闭，不回调、不重连。
    Close { id: ConnectionId },
}

impl Mutation {
    pub(crate) fn id(&self) -> ConnectionId {
        match self {
            Mutation::Register { id, .. }
            | Mutation::ChangeInterest { id, .. }
            | Mutation::Enqueue { id, .. }
            | Mutation::Reconnect { id }
            | Mutation::Close { id } => *id,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Mutation::Register { .. } => "register",
            Mutation::ChangeInterest { .. } => "change_interest",
            Mutation::Enqueue { .. } => "enqueue",
            Mutation::Reconnect { .. } => "reconnect",
            Mutation::Close { .. } => "close",
        }
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}

/// 多生产者、单消费者的变更请求队列。
///
/// # 教案式说明
/// - **意图 (Why)**：反应器阻塞在 `poll` 上时无法感知新请求；投递方必须在入队后唤醒它；
/// - **契约 (What)**：
///   - [`MutationQueue::submit`]/[`MutationQueue::submit_all`] 可从任意线程调用，同一次调用内的
///     请求保持相对顺序且在同一批次中被取走；
///   - [`MutationQueue::drain`] 只由反应器调用，整体换出当前积压，锁持有时间与请求数无关；
/// - **风险 (Trade-offs)**：唤醒失败只记录告警，请求仍留在队列中，最迟在下一次就绪事件时被处理。
pub(crate) struct MutationQueue {
    pending: Mutex<VecDeque<Mutation>>,
    waker: Waker,
}

impl MutationQueue {
    pub(crate) fn new(waker: Waker) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    pub(crate) fn submit(&self, mutation: Mutation) {
        self.pending.lock().push_back(mutation);
        self.wake();
    }

    pub(crate) fn submit_all(&self, mutations: impl IntoIterator<Item = Mutation>) {
        self.pending.lock().extend(mutations);
        self.wake();
    }

    pub(crate) fn drain(&self) -> VecDeque<Mutation> {
        std::mem::take(&mut *self.pending.lock())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(
                error = %err,
                "failed to wake the reactor; pending requests wait for the next readiness event"
            );
        }
    }
}
