//! 每条连接的发送状态：优先级队列 + 可复用的读写缓冲。
//!
//! 只有反应器线程会触碰这里的数据结构，因此不含任何同步原语。

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::{self, Write};

use bytes::Bytes;

/// 发送优先级，数值越小越先发送。
pub type Priority = i32;

/// 存活探测使用的优先级。
pub const HELLO_PRIORITY: Priority = 1;

/// 一条已分帧、等待发送的消息。
#[derive(Debug)]
struct QueuedFrame {
    priority: Priority,
    seq: u64,
    bytes: Bytes,
}

impl PartialEq for QueuedFrame {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedFrame {}

impl PartialOrd for QueuedFrame {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedFrame {
    // `BinaryHeap` 是大顶堆，反转比较使 (priority, seq) 最小者先出。
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

/// 一次刷写的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct FlushReport {
    /// 本次写入套接字的字节数。
    pub(crate) written: usize,
    /// 写缓冲与队列均已清空，可以撤销写兴趣。
    pub(crate) drained: bool,
}

/// 连接级发送状态。
///
/// # 教案式说明
/// - **意图 (Why)**：非阻塞套接字一次只能写出部分字节，必须记住“写到哪里”并在下一次可写事件中续写，
///   同时保证高优先级消息插队；
/// - **契约 (What)**：
///   - 出队顺序为优先级升序，同优先级按入队先后（FIFO）；
///   - 已搬入写缓冲的消息不会被后来的高优先级消息打断，线路上的帧永不交错；
///   - 读缓冲容量为两倍包上限，跨连接生命周期复用；
/// - **执行 (How)**：[`SendState::flush_into`] 循环“写完当前缓冲 → 弹出下一条”，遇到 `WouldBlock`
///   或零字节写入即停；
/// - **风险 (Trade-offs)**：每条消息在写缓冲中多一次拷贝，换来固定容量、可复用的缓冲区。
#[derive(Debug)]
pub(crate) struct SendState {
    queue: BinaryHeap<QueuedFrame>,
    next_seq: u64,
    write_buf: Vec<u8>,
    write_pos: usize,
    read_buf: Box<[u8]>,
}

impl SendState {
    pub(crate) fn new(max_packet_size: usize) -> Self {
        let buffer_size = max_packet_size.saturating_mul(2);
        Self {
            queue: BinaryHeap::new(),
            next_seq: 0,
            write_buf: Vec::with_capacity(buffer_size),
            write_pos: 0,
            read_buf: vec![0; buffer_size].into_boxed_slice(),
        }
    }

    pub(crate) fn push(&mut self, priority: Priority, bytes: Bytes) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(QueuedFrame {
            priority,
            seq,
            bytes,
        });
    }

    /// 队列与写缓冲均为空。
    pub(crate) fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.write_pos >= self.write_buf.len()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn read_buf_mut(&mut self) -> &mut [u8] {
        &mut self.read_buf
    }

    pub(crate) fn read_buf(&self) -> &[u8] {
        &self.read_buf
    }

    /// 尽可能多地把待发字节写入 `writer`。
    ///
    /// 返回 `Err` 表示连接已不可用，调用方应走故障路径。
    pub(crate) fn flush_into<W: Write>(&mut self, writer: &mut W) -> io::Result<FlushReport> {
        let mut written = 0;
        loop {
            while self.write_pos < self.write_buf.len() {
                match writer.write(&self.write_buf[self.write_pos..]) {
                    Ok(0) => {
                        return Ok(FlushReport {
                            written,
                            drained: false,
                        });
                    }
                    Ok(n) => {
                        self.write_pos += n;
                        written += n;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(FlushReport {
                            written,
                            drained: false,
                        });
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }

            self.write_buf.clear();
            self.write_pos = 0;
            match self.queue.pop() {
                Some(next) => self.write_buf.extend_from_slice(&next.bytes),
                None => {
                    return Ok(FlushReport {
                        written,
                        drained: true,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// 每次最多接受 `chunk` 字节，累计达到 `budget` 后返回 `WouldBlock`。
    struct ThrottledWriter {
        out: Vec<u8>,
        chunk: usize,
        budget: usize,
    }

    impl ThrottledWriter {
        fn new(chunk: usize, budget: usize) -> Self {
            Self {
                out: Vec::new(),
                chunk,
                budget,
            }
        }
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk).min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lower_priority_value_goes_first_and_ties_keep_fifo_order() {
        let mut state = SendState::new(64);
        state.push(3, Bytes::from_static(b"c"));
        state.push(1, Bytes::from_static(b"a1"));
        state.push(2, Bytes::from_static(b"b"));
        state.push(1, Bytes::from_static(b"a2"));

        let mut writer = ThrottledWriter::new(usize::MAX, usize::MAX);
        let report = state.flush_into(&mut writer).expect("写入成功");
        assert!(report.drained);
        assert_eq!(report.written, 5);
        assert_eq!(writer.out, b"a1a2bc");
        assert!(state.is_idle());
    }

    #[test]
    fn partial_write_resumes_where_it_stopped() {
        let mut state = SendState::new(64);
        state.push(5, Bytes::from_static(b"0123456789"));

        let mut writer = ThrottledWriter::new(3, 4);
        let report = state.flush_into(&mut writer).expect("写入成功");
        assert_eq!(
            report,
            FlushReport {
                written: 4,
                drained: false
            }
        );
        assert!(!state.is_idle());

        // 半写期间插入的高优先级消息不得打断当前帧。
        state.push(0, Bytes::from_static(b"!"));
        writer.budget = usize::MAX;
        let report = state.flush_into(&mut writer).expect("写入成功");
        assert!(report.drained);
        assert_eq!(writer.out, b"0123456789!");
    }

    #[test]
    fn hard_write_error_is_propagated() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut state = SendState::new(16);
        state.push(1, Bytes::from_static(b"x"));
        let err = state.flush_into(&mut Broken).expect_err("管道已断");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn read_buffer_holds_two_packets() {
        let state = SendState::new(100);
        assert_eq!(state.read_buf().len(), 200);
        assert_eq!(state.queued(), 0);
    }

    proptest! {
        #[test]
        fn drain_order_is_a_stable_sort_by_priority(priorities in proptest::collection::vec(-4i32..4, 0..32)) {
            let mut state = SendState::new(64);
            for (idx, priority) in priorities.iter().enumerate() {
                state.push(*priority, Bytes::copy_from_slice(&[idx as u8]));
            }

            let mut writer = ThrottledWriter::new(usize::MAX, usize::MAX);
            prop_assert!(state.flush_into(&mut writer).expect("写入成功").drained);

            let mut expected: Vec<(i32, u8)> = priorities
                .iter()
                .enumerate()
                .map(|(idx, p)| (*p, idx as u8))
                .collect();
            expected.sort_by_key(|(p, _)| *p);
            let expected: Vec<u8> = expected.into_iter().map(|(_, idx)| idx).collect();
            prop_assert_eq!(writer.out, expected);
        }
    }
}
