#![allow(dead_code)]

//! 回环集成测试共用的核心站替身。
//!
//! - [`CoreStationServer`]：阻塞式 `std::net::TcpListener`，扮演远端核心站；
//! - [`RecordingStation`]：把客户端回调转成通道事件的监听者，可切换“解析失败”以驱动重连路径。

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use backlog_client::{ClientConfig, CoreStationClient, CoreStationListener, SharedListener};
use backlog_codec::{Decoded, FrameDecoder};

/// 单个等待步骤的上限；正常情况下远小于此值。
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Eq, PartialEq)]
pub enum StationEvent {
    Connected,
    Disconnected,
    Data(Vec<u8>),
}

pub struct RecordingStation {
    name: String,
    host: String,
    addr: SocketAddr,
    events: Sender<StationEvent>,
    resolutions: AtomicUsize,
    unresolvable: AtomicBool,
}

impl RecordingStation {
    pub fn new(name: &str, addr: SocketAddr) -> (Arc<Self>, Receiver<StationEvent>) {
        let (tx, rx) = mpsc::channel();
        let station = Arc::new(Self {
            name: name.to_owned(),
            host: addr.ip().to_string(),
            addr,
            events: tx,
            resolutions: AtomicUsize::new(0),
            unresolvable: AtomicBool::new(false),
        });
        (station, rx)
    }

    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }

    pub fn set_unresolvable(&self, unresolvable: bool) {
        self.unresolvable.store(unresolvable, Ordering::SeqCst);
    }

    fn emit(&self, event: StationEvent) {
        // 测试结束后接收端可能已释放。
        let _ = self.events.send(event);
    }
}

impl CoreStationListener for RecordingStation {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.addr.port()
    }

    fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        if self.unresolvable.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unresolvable in test"));
        }
        Ok(vec![self.addr])
    }

    fn on_connected(&self) {
        self.emit(StationEvent::Connected);
    }

    fn on_disconnected(&self) {
        self.emit(StationEvent::Disconnected);
    }

    fn on_data(&self, data: &[u8]) {
        self.emit(StationEvent::Data(data.to_vec()));
    }
}

pub fn shared(station: &Arc<RecordingStation>) -> SharedListener {
    station.clone()
}

pub fn client(reconnect_delay: Duration) -> CoreStationClient {
    CoreStationClient::new(ClientConfig::new().with_reconnect_delay(reconnect_delay))
        .expect("测试配置合法")
}

pub struct CoreStationServer {
    listener: TcpListener,
}

impl CoreStationServer {
    pub fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("绑定回环端口");
        listener.set_nonblocking(true).expect("非阻塞监听");
        Self { listener }
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("读取本地地址")
    }

    /// 在 `within` 内等待一个入站连接。
    pub fn try_accept(&self, within: Duration) -> Option<TcpStream> {
        let deadline = Instant::now() + within;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).expect("切回阻塞模式");
                    stream.set_read_timeout(Some(WAIT)).expect("设置读超时");
                    return Some(stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("accept 失败: {err}"),
            }
        }
    }

    pub fn accept(&self) -> TcpStream {
        self.try_accept(WAIT).expect("客户端应在时限内建连")
    }
}

/// 跳过数据事件，等待指定的连接事件。
pub fn wait_for(rx: &Receiver<StationEvent>, expected: StationEvent) {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(event) if event == expected => return,
            Ok(_) => continue,
            Err(err) => panic!("等待 {expected:?} 超时: {err}"),
        }
    }
}

/// 断言在 `window` 内没有出现指定事件。
pub fn assert_no_event(rx: &Receiver<StationEvent>, unexpected: &StationEvent, window: Duration) {
    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        match rx.recv_timeout(remaining) {
            Ok(event) => assert_ne!(&event, unexpected, "不应出现的事件"),
            Err(_) => return,
        }
    }
}

/// 从监听者收到的数据事件中解出 `count` 个结果。
pub fn decode_from_station(rx: &Receiver<StationEvent>, count: usize) -> Vec<Decoded> {
    let mut decoder = FrameDecoder::default();
    let mut out = Vec::new();
    while out.len() < count {
        match rx.recv_timeout(WAIT) {
            Ok(StationEvent::Data(bytes)) => out.extend(decoder.decode(&bytes)),
            Ok(StationEvent::Disconnected) => panic!("解码途中连接断开"),
            Ok(StationEvent::Connected) => continue,
            Err(err) => panic!("等待入站数据超时: {err}"),
        }
    }
    out
}

/// 从核心站一侧的套接字解出 `count` 个结果。
pub fn decode_from_socket(stream: &mut TcpStream, count: usize) -> Vec<Decoded> {
    let mut decoder = FrameDecoder::default();
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    while out.len() < count {
        let n = stream.read(&mut buf).expect("读取客户端发出的字节");
        assert!(n > 0, "客户端提前关闭了连接");
        out.extend(decoder.decode(&buf[..n]));
    }
    out
}

/// 断言在 `window` 内套接字上没有更多字节。
pub fn assert_silent(stream: &mut TcpStream, window: Duration) {
    stream.set_read_timeout(Some(window)).expect("设置读超时");
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => panic!("连接被意外关闭"),
        Ok(n) => panic!("收到多余的 {n} 字节"),
        Err(err) => assert!(
            matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
            "意外的读错误: {err}"
        ),
    }
    stream.set_read_timeout(Some(WAIT)).expect("恢复读超时");
}

/// 等待对端关闭（读到 EOF 或连接被重置）。
pub fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => return,
            Err(err) => panic!("等待关闭时出错: {err}"),
        }
    }
}
