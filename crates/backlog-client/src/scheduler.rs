//! 重连定时器。
//!
//! 单个后台线程持有按到期时间排序的小顶堆，条件变量在“新任务更早到期”或“关闭”时唤醒它。

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::listener::ListenerKey;

/// 一次延迟重连：到期时以 `epoch` 重新尝试为 `listener` 建连。
#[derive(Debug)]
pub(crate) struct ReconnectTask {
    pub(crate) listener: ListenerKey,
    pub(crate) epoch: u64,
}

struct Timer<T> {
    due: Instant,
    seq: u64,
    task: T,
}

impl<T> PartialEq for Timer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Timer<T> {}

impl<T> PartialOrd for Timer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Timer<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

struct State<T> {
    timers: BinaryHeap<Timer<T>>,
    next_seq: u64,
    shutdown: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    wakeup: Condvar,
}

/// 延迟任务调度器。
///
/// # 教案式说明
/// - **意图 (Why)**：重连必须在失败后固定延迟触发，且不能占用反应器线程；一个共享的定时线程即可
///   服务所有连接；
/// - **契约 (What)**：
///   - [`ReconnectScheduler::schedule`] 可在线程启动前调用，任务会在启动后按原定时刻执行；
///   - 同一时刻到期的任务按提交顺序执行；
///   - [`ReconnectScheduler::shutdown`] 之后的任务被丢弃，尚未到期的任务不再执行；
/// - **执行 (How)**：处理函数在释放锁之后运行，处理函数内可以再次调度；
/// - **风险 (Trade-offs)**：处理函数串行执行，单次处理（例如慢 DNS）会推迟后续到期任务。
pub(crate) struct ReconnectScheduler<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> ReconnectScheduler<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    timers: BinaryHeap::new(),
                    next_seq: 0,
                    shutdown: false,
                }),
                wakeup: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// 启动定时线程。重复调用无副作用。
    pub(crate) fn start<F>(&self, name: &str, handler: F) -> io::Result<()>
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(&inner, handler))?;
        *thread = Some(handle);
        Ok(())
    }

    /// 安排 `task` 在 `delay` 之后执行；调度器已关闭时返回 `false`。
    pub(crate) fn schedule(&self, task: T, delay: Duration) -> bool {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.timers.push(Timer {
            due: Instant::now() + delay,
            seq,
            task,
        });
        drop(state);
        self.inner.wakeup.notify_one();
        true
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.inner.state.lock().timers.len()
    }

    /// 停止定时线程并丢弃未到期任务；在定时线程内部调用时不等待自身退出。
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.timers.clear();
        }
        self.inner.wakeup.notify_all();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("reconnect scheduler thread panicked");
            }
        }
    }
}

impl<T: Send + 'static> Drop for ReconnectScheduler<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<T, F>(inner: &Inner<T>, mut handler: F)
where
    F: FnMut(T),
{
    debug!("reconnect scheduler started");
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        match state.timers.peek().map(|timer| timer.due) {
            None => inner.wakeup.wait(&mut state),
            Some(due) if due <= Instant::now() => {
                if let Some(timer) = state.timers.pop() {
                    MutexGuard::unlocked(&mut state, || handler(timer.task));
                }
            }
            Some(due) => {
                inner.wakeup.wait_until(&mut state, due);
            }
        }
    }
    debug!("reconnect scheduler stopped");
}
