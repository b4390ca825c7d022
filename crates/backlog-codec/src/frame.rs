use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// 需要加倍转义的保留字节。
pub const STUFFING_BYTE: u8 = 0x7E;

/// 紧随单个填充字节出现时表示存活探测。
pub const HELLO_BYTE: u8 = 0x7D;

/// 长度前缀宽度，固定为 `u32` 小端。
pub const LENGTH_PREFIX_LEN: usize = 4;

/// 默认单条负载上限。
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 65_535;

/// 默认包上限：长度前缀 + 负载，转义之前的字节数。
pub const DEFAULT_MAX_PACKET_SIZE: usize = DEFAULT_MAX_PAYLOAD_SIZE + LENGTH_PREFIX_LEN;

/// 分帧与还原过程中的错误。
///
/// # 教案式说明
/// - **意图 (Why)**：发送侧唯一可能的失败是尺寸超限，接收侧则需要区分“截断”与“格式破坏”，
///   便于调用方决定是等待更多字节还是丢弃连接；
/// - **契约 (What)**：每个变体携带足以排障的数值上下文，并通过 [`FrameError::code`] 暴露稳定错误码。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FrameError {
    /// 负载加上长度前缀后超过包上限。
    #[error("payload of {len} bytes exceeds the packet limit ({limit} bytes of payload)")]
    PayloadTooLarge { len: usize, limit: usize },

    /// 单个填充字节后跟了非填充字节，`unframe` 只接受纯数据帧。
    #[error("unexpected control sequence 0x7e 0x{control:02x} inside a frame")]
    UnexpectedControl { control: u8 },

    /// 字节流在长度前缀或负载中途结束。
    #[error("frame truncated: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },

    /// 长度前缀与实际负载长度不一致。
    #[error("frame declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

impl FrameError {
    /// 稳定错误码，供日志与告警聚合使用。
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::PayloadTooLarge { .. } => "backlog.codec.payload_too_large",
            FrameError::UnexpectedControl { .. } => "backlog.codec.unexpected_control",
            FrameError::Truncated { .. } => "backlog.codec.truncated",
            FrameError::LengthMismatch { .. } => "backlog.codec.length_mismatch",
        }
    }
}

/// 给定包上限时允许的最大负载字节数。
pub fn max_payload_for(max_packet_size: usize) -> usize {
    max_packet_size.saturating_sub(LENGTH_PREFIX_LEN)
}

/// 将负载编码为线路片段。
///
/// # 教案式说明
/// - **意图 (Why)**：在字节流上为每条消息提供自定界边界，同时保证长度前缀本身也被转义，
///   使接收方永远不会把数据误判为控制序列；
/// - **契约 (What)**：
///   - 先校验 `payload.len() + 4 <= max_packet_size`，失败返回 [`FrameError::PayloadTooLarge`]，
///     此时不产生任何字节；
///   - 成功时返回 `[小端 u32 长度][负载]` 经填充字节加倍后的只读缓冲；
/// - **执行 (How)**：按无转义长度预留容量，再用 [`stuff`] 分段拷贝，命中填充字节时额外追加一次。
pub fn frame(payload: &[u8], max_packet_size: usize) -> Result<Bytes, FrameError> {
    let limit = max_payload_for(max_packet_size);
    let too_large = || FrameError::PayloadTooLarge {
        len: payload.len(),
        limit,
    };
    if payload.len() > limit {
        return Err(too_large());
    }
    let declared = u32::try_from(payload.len()).map_err(|_| too_large())?;

    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    stuff(&declared.to_le_bytes(), &mut out);
    stuff(payload, &mut out);
    Ok(out.freeze())
}

/// 将 `src` 转义后追加到 `dst`：每个 [`STUFFING_BYTE`] 写出两次。
pub fn stuff(src: &[u8], dst: &mut BytesMut) {
    dst.reserve(src.len());
    let mut start = 0;
    for (idx, byte) in src.iter().enumerate() {
        if *byte == STUFFING_BYTE {
            dst.extend_from_slice(&src[start..=idx]);
            dst.put_u8(STUFFING_BYTE);
            start = idx + 1;
        }
    }
    dst.extend_from_slice(&src[start..]);
}

/// 存活探测字节，刻意不经过转义。
pub const fn hello_probe() -> [u8; 2] {
    [STUFFING_BYTE, HELLO_BYTE]
}

/// [`frame`] 的逆变换，要求输入恰好是一条完整帧。
///
/// 流式场景（分片、多帧、探测混杂）请使用 [`crate::FrameDecoder`]。
pub fn unframe(wire: &[u8]) -> Result<Bytes, FrameError> {
    let mut plain = BytesMut::with_capacity(wire.len());
    let mut iter = wire.iter().copied();
    while let Some(byte) = iter.next() {
        if byte == STUFFING_BYTE {
            match iter.next() {
                Some(STUFFING_BYTE) => plain.put_u8(STUFFING_BYTE),
                Some(control) => return Err(FrameError::UnexpectedControl { control }),
                None => {
                    return Err(FrameError::Truncated {
                        expected: plain.len() + 2,
                        actual: plain.len() + 1,
                    });
                }
            }
        } else {
            plain.put_u8(byte);
        }
    }

    if plain.len() < LENGTH_PREFIX_LEN {
        return Err(FrameError::Truncated {
            expected: LENGTH_PREFIX_LEN,
            actual: plain.len(),
        });
    }
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&plain[..LENGTH_PREFIX_LEN]);
    let declared = u32::from_le_bytes(prefix) as usize;
    let body = plain.split_off(LENGTH_PREFIX_LEN);
    match body.len() {
        actual if actual < declared => Err(FrameError::Truncated {
            expected: declared,
            actual,
        }),
        actual if actual > declared => Err(FrameError::LengthMismatch { declared, actual }),
        _ => Ok(body.freeze()),
    }
}
