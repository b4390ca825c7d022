//! 部署/设备路由表。
//!
//! 键为 `(部署名, 设备号)` 复合键，值为负责该设备的监听者。同一部署下的设备可能由不同核心站承载，
//! 同一核心站也可能承载多个设备号。

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::ClientError;
use crate::listener::{ListenerKey, SharedListener};

/// 设备号；`0xFFFF` 保留为通配值，表示部署下的全部设备。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DeviceId(u16);

impl DeviceId {
    pub const WILDCARD: DeviceId = DeviceId(u16::MAX);

    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    pub const fn is_wildcard(self) -> bool {
        self.0 == u16::MAX
    }
}

impl From<u16> for DeviceId {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 发送目标。
#[derive(Clone, Copy)]
pub enum Target<'a> {
    /// 直接指定监听者，跳过设备路由（部署仍需已知）。
    Listener(&'a SharedListener),
    /// 指定设备号；传入 [`DeviceId::WILDCARD`] 等价于 [`Target::AllDevices`]。
    Device(DeviceId),
    /// 部署下全部设备所在的核心站，每个核心站只发送一次。
    AllDevices,
}

impl fmt::Debug for Target<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Listener(listener) => f.debug_tuple("Listener").field(&listener.name()).finish(),
            Target::Device(id) => f.debug_tuple("Device").field(id).finish(),
            Target::AllDevices => f.write_str("AllDevices"),
        }
    }
}

/// 并发路由表。
///
/// # 教案式说明
/// - **意图 (Why)**：发送路径来自任意线程且远多于路由变更，`DashMap` 的分片锁让查找互不阻塞；
/// - **契约 (What)**：
///   - 同一 `(部署, 设备)` 至多对应一个监听者，重复登记以最后一次为准；
///   - 部署“存在”当且仅当至少有一条属于它的路由，删除最后一个设备即删除部署；
///   - 通配设备号永远不会作为键出现；
/// - **风险 (Trade-offs)**：按部署的查询需要遍历全部分片，部署数与设备数均为小规模时可接受。
#[derive(Debug, Default)]
pub(crate) struct RoutingTable {
    routes: DashMap<(Arc<str>, DeviceId), ListenerKey>,
}

impl RoutingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 登记路由，返回被替换的旧监听者（若有）。
    pub(crate) fn add(
        &self,
        deployment: &str,
        device_id: DeviceId,
        listener: &SharedListener,
    ) -> Result<Option<SharedListener>, ClientError> {
        if device_id.is_wildcard() {
            return Err(ClientError::ReservedDeviceId { device_id });
        }
        let previous = self
            .routes
            .insert((Arc::from(deployment), device_id), ListenerKey::of(listener));
        Ok(previous.map(|key| Arc::clone(key.shared())))
    }

    pub(crate) fn remove(&self, deployment: &str, device_id: DeviceId) -> Option<SharedListener> {
        self.routes
            .remove(&(Arc::from(deployment), device_id))
            .map(|(_, key)| Arc::clone(key.shared()))
    }

    /// 删除某个监听者的全部路由，返回删除条数。
    pub(crate) fn remove_listener(&self, listener: &ListenerKey) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, owner| owner != listener);
        before.saturating_sub(self.routes.len())
    }

    pub(crate) fn knows_deployment(&self, deployment: &str) -> bool {
        self.routes.iter().any(|entry| entry.key().0.as_ref() == deployment)
    }

    /// 把发送目标解析为去重后的监听者集合。
    pub(crate) fn resolve(
        &self,
        deployment: &str,
        target: Target<'_>,
    ) -> Result<Vec<ListenerKey>, ClientError> {
        let unknown_deployment = || ClientError::UnknownDeployment {
            deployment: deployment.to_owned(),
        };

        match target {
            Target::Listener(listener) => {
                if !self.knows_deployment(deployment) {
                    return Err(unknown_deployment());
                }
                Ok(vec![ListenerKey::of(listener)])
            }
            Target::Device(device_id) if !device_id.is_wildcard() => {
                if let Some(entry) = self.routes.get(&(Arc::from(deployment), device_id)) {
                    return Ok(vec![entry.value().clone()]);
                }
                if self.knows_deployment(deployment) {
                    Err(ClientError::UnknownDevice {
                        deployment: deployment.to_owned(),
                        device_id,
                    })
                } else {
                    Err(unknown_deployment())
                }
            }
            Target::Device(_) | Target::AllDevices => {
                let mut targets: Vec<ListenerKey> = Vec::new();
                for entry in self.routes.iter() {
                    if entry.key().0.as_ref() == deployment && !targets.contains(entry.value()) {
                        targets.push(entry.value().clone());
                    }
                }
                if targets.is_empty() {
                    return Err(unknown_deployment());
                }
                Ok(targets)
            }
        }
    }

    pub(crate) fn deployments(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .routes
            .iter()
            .map(|entry| entry.key().0.to_string())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub(crate) fn device_ids(&self, deployment: &str) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .routes
            .iter()
            .filter(|entry| entry.key().0.as_ref() == deployment)
            .map(|entry| entry.key().1)
            .collect();
        ids.sort_unstable();
        ids
    }
}
