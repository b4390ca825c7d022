#![doc = r#"
# backlog-codec

## 设计动机（Why）
- **定位**：BackLog 协议在一条 TCP 字节流上复用多条消息，本 crate 负责把单条负载
  包装成自定界的线路片段，并提供接收侧的流式还原。
- **架构角色**：发送侧由 `backlog-client` 在入队前调用 [`frame`]；接收侧由持有负载
  语义的监听者（插件、测试桩）使用 [`FrameDecoder`] 自行重组，客户端核心不解析入站字节。

## 核心契约（What）
- 线路格式：`[4 字节小端长度][负载]`，随后对“长度 + 负载”整体执行填充字节加倍；
- 超过 `max_packet_size`（长度前缀 + 负载，转义前）的负载在产生任何字节前即被拒绝；
- 单个填充字节后跟非填充字节构成控制序列，目前仅定义存活探测 [`hello_probe`]。

## 实现策略（How）
- 编码使用 `bytes::BytesMut` 一次性预留容量后逐段拷贝，避免逐字节推入；
- 解码器逐字节推进有限状态机，天然支持任意分片边界。

## 风险与考量（Trade-offs）
- 转义最坏情况下使帧长度翻倍，发送侧写缓冲按 `2 * max_packet_size` 预留；
- 解码器遇到未知控制字节时丢弃半帧并上报 [`Decoded::Resync`]，不尝试猜测对端意图。
"#]

mod decoder;
mod frame;

pub use decoder::{Decoded, FrameDecoder, ResyncReason};
pub use frame::{
    DEFAULT_MAX_PACKET_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, FrameError, HELLO_BYTE, LENGTH_PREFIX_LEN,
    STUFFING_BYTE, frame, hello_probe, max_payload_for, stuff, unframe,
};
