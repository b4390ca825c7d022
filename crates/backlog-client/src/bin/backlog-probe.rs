//! # backlog-probe
//!
//! 连通性诊断工具：按配置文件注册一组核心站，周期性发送存活探测，并把入站字节解码后
//! 以结构化日志输出。用于在部署前确认网关可达、分帧正确。

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use backlog_client::{
    ClientConfig, CoreStationClient, CoreStationListener, DeviceId, SharedListener, telemetry,
};
use backlog_codec::{Decoded, FrameDecoder};
use clap::Parser;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

const DEFAULT_HELLO_INTERVAL_MS: u64 = 10_000;

/// 命令行参数。
#[derive(Parser, Debug)]
#[command(author, version, about = "Probes BackLog core stations and logs decoded traffic", long_about = None)]
struct Args {
    /// 探针配置文件（TOML）。
    #[arg(short, long, env = "BACKLOG_PROBE_CONFIG")]
    config: PathBuf,

    /// 日志过滤指令，语法同 `RUST_LOG`；缺省读取环境变量。
    #[arg(long)]
    log: Option<String>,

    /// 运行时长（秒），0 表示一直运行。
    #[arg(long, default_value_t = 0)]
    run_for: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProbeConfig {
    #[serde(default)]
    client: ClientConfig,
    #[serde(default = "default_hello_interval_ms")]
    hello_interval_ms: u64,
    #[serde(default, rename = "station")]
    stations: Vec<StationConfig>,
}

fn default_hello_interval_ms() -> u64 {
    DEFAULT_HELLO_INTERVAL_MS
}

impl ProbeConfig {
    fn parse(text: &str) -> Result<Self> {
        let config: ProbeConfig = toml::from_str(text).context("malformed probe configuration")?;
        config.client.validate()?;
        if config.hello_interval_ms == 0 {
            bail!("`hello_interval_ms` must be positive");
        }
        if config.stations.is_empty() {
            bail!("at least one [[station]] entry is required");
        }
        Ok(config)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StationConfig {
    name: String,
    host: String,
    port: u16,
    deployment: String,
    #[serde(default)]
    device_ids: Vec<u16>,
}

/// 把入站字节解码为日志的监听者。
struct ProbeStation {
    config: StationConfig,
    max_payload: usize,
    decoder: Mutex<FrameDecoder>,
    frames: AtomicU64,
    hellos: AtomicU64,
}

impl ProbeStation {
    fn new(config: StationConfig, max_payload: usize) -> Self {
        Self {
            config,
            max_payload,
            decoder: Mutex::new(FrameDecoder::new(max_payload)),
            frames: AtomicU64::new(0),
            hellos: AtomicU64::new(0),
        }
    }
}

impl CoreStationListener for ProbeStation {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn address(&self) -> &str {
        &self.config.host
    }

    fn port(&self) -> u16 {
        self.config.port
    }

    fn on_connected(&self) {
        // 新连接从帧边界开始。
        *self.decoder.lock() = FrameDecoder::new(self.max_payload);
        info!(station = self.name(), "probe connected");
    }

    fn on_disconnected(&self) {
        info!(station = self.name(), "probe disconnected");
    }

    fn on_data(&self, data: &[u8]) {
        let decoded = self.decoder.lock().decode(data);
        for item in decoded {
            match item {
                Decoded::Frame(payload) => {
                    self.frames.fetch_add(1, Ordering::Relaxed);
                    info!(
                        station = self.name(),
                        bytes = payload.len(),
                        message_type = payload.first().copied(),
                        "frame received"
                    );
                }
                Decoded::Hello => {
                    self.hellos.fetch_add(1, Ordering::Relaxed);
                    debug!(station = self.name(), "hello received");
                }
                Decoded::Resync(reason) => {
                    warn!(station = self.name(), ?reason, "stream resynchronised; partial frame dropped");
                }
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init_tracing(args.log.as_deref())?;

    let text = fs::read_to_string(&args.config)
        .with_context(|| format!("cannot read {}", args.config.display()))?;
    let config = ProbeConfig::parse(&text)?;
    let interval = Duration::from_millis(config.hello_interval_ms);

    let client = CoreStationClient::new(config.client.clone())?;
    let max_payload = client.config().max_payload_size;

    let mut stations: Vec<(Arc<ProbeStation>, SharedListener)> = Vec::new();
    for station in config.stations {
        let probe = Arc::new(ProbeStation::new(station, max_payload));
        let listener: SharedListener = probe.clone();
        for device_id in &probe.config.device_ids {
            client.add_device_id(&probe.config.deployment, DeviceId::new(*device_id), &listener)?;
        }
        client.register_listener(Arc::clone(&listener))?;
        stations.push((probe, listener));
    }

    let deadline = (args.run_for > 0).then(|| Instant::now() + Duration::from_secs(args.run_for));
    loop {
        let pause = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                remaining.min(interval)
            }
            None => interval,
        };
        thread::sleep(pause);

        for (probe, listener) in &stations {
            let outcome = client.send_hello(listener)?;
            info!(
                station = probe.name(),
                connected = outcome.accepted,
                frames = probe.frames.load(Ordering::Relaxed),
                hellos = probe.hellos.load(Ordering::Relaxed),
                "hello sent"
            );
        }
    }

    for (probe, listener) in &stations {
        client.deregister_listener(listener);
        info!(
            station = probe.name(),
            frames = probe.frames.load(Ordering::Relaxed),
            hellos = probe.hellos.load(Ordering::Relaxed),
            "probe finished"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
hello_interval_ms = 2500

[client]
reconnect_delay_ms = 5000

[[station]]
name = "cs-dirruhorn"
host = "10.0.0.5"
port = 9002
deployment = "dirruhorn"
device_ids = [1, 2]

[[station]]
name = "cs-matterhorn"
host = "gateway.example"
port = 9002
deployment = "matterhorn"
"#;

    #[test]
    fn parses_stations_and_client_overrides() {
        let config = ProbeConfig::parse(SAMPLE).expect("样例配置合法");
        assert_eq!(config.hello_interval_ms, 2500);
        assert_eq!(config.client.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.stations.len(), 2);
        assert_eq!(config.stations[0].device_ids, vec![1, 2]);
        assert!(config.stations[1].device_ids.is_empty());
    }

    #[test]
    fn rejects_configs_without_stations() {
        let err = ProbeConfig::parse("hello_interval_ms = 10").expect_err("缺少核心站");
        assert!(err.to_string().contains("[[station]]"));
    }

    #[test]
    fn decoded_frames_are_counted() {
        let probe = ProbeStation::new(
            StationConfig {
                name: "cs".to_owned(),
                host: "127.0.0.1".to_owned(),
                port: 9002,
                deployment: "dep".to_owned(),
                device_ids: Vec::new(),
            },
            1024,
        );
        let wire = backlog_codec::frame(b"\x01data", 1028).expect("编码成功");
        probe.on_data(&wire[..3]);
        probe.on_data(&wire[3..]);
        probe.on_data(&backlog_codec::hello_probe());
        assert_eq!(probe.frames.load(Ordering::Relaxed), 1);
        assert_eq!(probe.hellos.load(Ordering::Relaxed), 1);
    }
}
