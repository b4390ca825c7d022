//! 接收侧流式解码器。
//!
//! 客户端核心把每次非阻塞读取到的字节原样交给监听者，帧边界可能落在任意位置；
//! [`FrameDecoder`] 在监听者一侧把这些分片还原成完整负载。

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{DEFAULT_MAX_PAYLOAD_SIZE, HELLO_BYTE, LENGTH_PREFIX_LEN, STUFFING_BYTE};

/// 解码器的一次产出。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Decoded {
    /// 一条完整负载（已去除长度前缀与转义）。
    Frame(Bytes),
    /// 对端发送的存活探测。
    Hello,
    /// 解码器丢弃了半帧并回到帧边界。
    Resync(ResyncReason),
}

/// 触发重同步的原因。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResyncReason {
    /// 未定义的控制序列 `0x7E <control>`。
    UnknownControl(u8),
    /// 长度前缀声明的负载超过上限。
    Oversize(usize),
}

/// 基于逐字节状态机的流式解码器。
///
/// # 教案式说明
/// - **意图 (Why)**：`on_data` 只保证“一次读调用的字节”，重组职责在监听者一侧；
///   解码器把转义还原、控制序列识别与长度重组集中在一处；
/// - **契约 (What)**：
///   - [`FrameDecoder::decode`] 可用任意切分的输入反复调用，产出序列与一次性输入完全一致；
///   - 存活探测不打断正在重组的帧，未知控制字节与超限长度会丢弃半帧；
/// - **执行 (How)**：`escape_pending` 记录上一字节是否为单个填充字节，其余字节进入
///   “长度前缀 → 负载”两段式累积；
/// - **风险 (Trade-offs)**：逐字节推进便于正确性审查，吞吐敏感场景可换成 `memchr` 分段扫描。
#[derive(Debug)]
pub struct FrameDecoder {
    max_payload: usize,
    escape_pending: bool,
    prefix: [u8; LENGTH_PREFIX_LEN],
    prefix_len: usize,
    expected: Option<usize>,
    body: BytesMut,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

impl FrameDecoder {
    /// 创建解码器，`max_payload` 为可接受的最大负载字节数。
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            escape_pending: false,
            prefix: [0; LENGTH_PREFIX_LEN],
            prefix_len: 0,
            expected: None,
            body: BytesMut::new(),
        }
    }

    /// 当前是否停在帧边界上（没有未完成的半帧或转义）。
    pub fn is_idle(&self) -> bool {
        !self.escape_pending && self.prefix_len == 0 && self.expected.is_none()
    }

    /// 喂入一段字节，返回本次解出的全部结果。
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();
        for &byte in chunk {
            if self.escape_pending {
                self.escape_pending = false;
                match byte {
                    STUFFING_BYTE => self.accept(byte, &mut out),
                    HELLO_BYTE => out.push(Decoded::Hello),
                    control => {
                        self.reset();
                        out.push(Decoded::Resync(ResyncReason::UnknownControl(control)));
                    }
                }
            } else if byte == STUFFING_BYTE {
                self.escape_pending = true;
            } else {
                self.accept(byte, &mut out);
            }
        }
        out
    }

    fn accept(&mut self, byte: u8, out: &mut Vec<Decoded>) {
        let Some(expected) = self.expected else {
            self.prefix[self.prefix_len] = byte;
            self.prefix_len += 1;
            if self.prefix_len == LENGTH_PREFIX_LEN {
                let declared = u32::from_le_bytes(self.prefix) as usize;
                self.prefix_len = 0;
                if declared > self.max_payload {
                    out.push(Decoded::Resync(ResyncReason::Oversize(declared)));
                } else if declared == 0 {
                    out.push(Decoded::Frame(Bytes::new()));
                } else {
                    self.body.reserve(declared);
                    self.expected = Some(declared);
                }
            }
            return;
        };

        self.body.put_u8(byte);
        if self.body.len() == expected {
            self.expected = None;
            out.push(Decoded::Frame(self.body.split().freeze()));
        }
    }

    fn reset(&mut self) {
        self.prefix_len = 0;
        self.expected = None;
        self.body.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DEFAULT_MAX_PACKET_SIZE, frame, hello_probe};
    use proptest::prelude::*;

    fn wire_of(payloads: &[&[u8]]) -> Vec<u8> {
        let mut wire = Vec::new();
        for payload in payloads {
            wire.extend_from_slice(&frame(payload, DEFAULT_MAX_PACKET_SIZE).expect("编码成功"));
        }
        wire
    }

    #[test]
    fn decodes_back_to_back_frames_and_probes() {
        let mut wire = wire_of(&[b"first", &[STUFFING_BYTE; 3]]);
        wire.extend_from_slice(&hello_probe());
        wire.extend_from_slice(&wire_of(&[b""]));

        let mut decoder = FrameDecoder::default();
        let decoded = decoder.decode(&wire);
        assert_eq!(
            decoded,
            vec![
                Decoded::Frame(Bytes::from_static(b"first")),
                Decoded::Frame(Bytes::from_static(&[STUFFING_BYTE; 3])),
                Decoded::Hello,
                Decoded::Frame(Bytes::new()),
            ]
        );
        assert!(decoder.is_idle());
    }

    #[test]
    fn escape_split_across_chunks_is_honoured() {
        let wire = wire_of(&[&[STUFFING_BYTE]]);
        let split = wire
            .iter()
            .position(|b| *b == STUFFING_BYTE)
            .expect("负载中必有填充字节")
            + 1;

        let mut decoder = FrameDecoder::default();
        assert!(decoder.decode(&wire[..split]).is_empty());
        assert!(!decoder.is_idle());
        assert_eq!(
            decoder.decode(&wire[split..]),
            vec![Decoded::Frame(Bytes::from_static(&[STUFFING_BYTE]))]
        );
    }

    #[test]
    fn unknown_control_drops_partial_frame() {
        let wire = wire_of(&[b"abcdef"]);
        let mut decoder = FrameDecoder::default();
        assert!(decoder.decode(&wire[..6]).is_empty());
        assert_eq!(
            decoder.decode(&[STUFFING_BYTE, 0x01]),
            vec![Decoded::Resync(ResyncReason::UnknownControl(0x01))]
        );
        assert!(decoder.is_idle());
        assert_eq!(
            decoder.decode(&wire_of(&[b"ok"])),
            vec![Decoded::Frame(Bytes::from_static(b"ok"))]
        );
    }

    #[test]
    fn oversize_prefix_triggers_resync() {
        let mut decoder = FrameDecoder::new(8);
        assert_eq!(
            decoder.decode(&[9, 0, 0, 0]),
            vec![Decoded::Resync(ResyncReason::Oversize(9))]
        );
        assert!(decoder.is_idle());
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_the_decoded_stream(
            payloads in proptest::collection::vec(
                proptest::collection::vec(
                    prop_oneof![Just(STUFFING_BYTE), Just(HELLO_BYTE), any::<u8>()],
                    0..64,
                ),
                1..8,
            ),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let refs: Vec<&[u8]> = payloads.iter().map(Vec::as_slice).collect();
            let wire = wire_of(&refs);

            let mut points: Vec<usize> = cuts.iter().map(|idx| idx.index(wire.len() + 1)).collect();
            points.sort_unstable();

            let mut decoder = FrameDecoder::default();
            let mut decoded = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(wire.len())) {
                decoded.extend(decoder.decode(&wire[start..point]));
                start = point;
            }

            let expected: Vec<Decoded> = payloads
                .iter()
                .map(|p| Decoded::Frame(Bytes::copy_from_slice(p)))
                .collect();
            prop_assert_eq!(decoded, expected);
            prop_assert!(decoder.is_idle());
        }
    }
}
