//! Process-wide device registry: device id → live tunnel session.
//!
//! The registry is the only cross-session mutable structure in the proxy.
//! Mutations are serialised behind the write lock; a re-registration for an
//! already-registered device id displaces and closes the prior session
//! (*superseded*), and a deregistration only removes the entry when it still
//! refers to the caller's session, so a stale handler from a previous
//! connection can never evict a newer registration during a reconnect storm.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::protocol::CameraInfo;
use crate::tunnel::session::{CloseReason, DeviceSession};

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, DeviceSession>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session under its device id. Any live session for that id
    /// is closed with *superseded* before the new one becomes visible.
    pub async fn register(&self, session: DeviceSession) {
        let device_id = session.device_id().to_string();
        let mut devices = self.devices.write().await;
        if let Some(old) = devices.remove(&device_id) {
            warn!(device = %device_id, "device re-registered, superseding previous session");
            old.close(CloseReason::Superseded).await;
        }
        devices.insert(device_id.clone(), session);
        info!(device = %device_id, "device registered");
    }

    /// Remove the entry for this session's device id, but only if it is
    /// still this exact session.
    pub async fn deregister(&self, session: &DeviceSession) {
        let mut devices = self.devices.write().await;
        match devices.get(session.device_id()) {
            Some(current) if current.same_session(session) => {
                devices.remove(session.device_id());
                info!(device = %session.device_id(), "device deregistered");
            }
            Some(_) => {
                debug!(
                    device = %session.device_id(),
                    "skipping deregister: a newer session holds this device id"
                );
            }
            None => {}
        }
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceSession> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Resolve an HTTP path parameter: device id first, then a camera-id
    /// scan across registrations.
    pub async fn resolve(&self, id: &str) -> Option<DeviceSession> {
        let devices = self.devices.read().await;
        if let Some(session) = devices.get(id) {
            return Some(session.clone());
        }
        devices.values().find(|s| s.has_camera(id)).cloned()
    }

    /// Flat enumeration of every camera on every live session.
    pub async fn cameras(&self) -> Vec<CameraInfo> {
        let devices = self.devices.read().await;
        let mut cameras: Vec<CameraInfo> = devices
            .values()
            .flat_map(|session| {
                session.camera_ids().iter().map(|camera_id| CameraInfo {
                    device_id: session.device_id().to_string(),
                    camera_id: camera_id.clone(),
                })
            })
            .collect();
        cameras.sort_by(|a, b| (&a.device_id, &a.camera_id).cmp(&(&b.device_id, &b.camera_id)));
        cameras
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Close sessions that have been silent past `timeout`. The closed
    /// session's gateway loop observes the cancellation and deregisters.
    /// Returns the ids of evicted devices.
    pub async fn sweep_idle(&self, timeout: Duration) -> Vec<String> {
        let sessions: Vec<DeviceSession> = self.devices.read().await.values().cloned().collect();
        let mut evicted = Vec::new();
        for session in sessions {
            if session.idle_for() > timeout {
                warn!(
                    device = %session.device_id(),
                    idle_secs = session.idle_for().as_secs(),
                    "closing silent device session"
                );
                session.close(CloseReason::HeartbeatTimeout).await;
                evicted.push(session.device_id().to_string());
            }
        }
        evicted
    }

    /// Close every session (shutdown path).
    pub async fn close_all(&self, reason: CloseReason) {
        let sessions: Vec<DeviceSession> = {
            let mut devices = self.devices.write().await;
            devices.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close(reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(device: &str, cameras: &[&str]) -> DeviceSession {
        let (session, _rx) = DeviceSession::new(
            device.to_string(),
            cameras.iter().map(|c| c.to_string()).collect(),
        );
        session
    }

    #[tokio::test]
    async fn register_and_get() {
        let registry = DeviceRegistry::new();
        registry.register(session("pi-a", &["cam1"])).await;
        assert!(registry.get("pi-a").await.is_some());
        assert!(registry.get("pi-b").await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn reregistration_supersedes_and_closes_old() {
        let registry = DeviceRegistry::new();
        let first = session("pi-a", &["cam1"]);
        registry.register(first.clone()).await;

        let second = session("pi-a", &["cam1", "cam2"]);
        registry.register(second.clone()).await;

        assert!(first.is_closed());
        assert_eq!(first.close_reason(), Some(CloseReason::Superseded));
        assert!(!second.is_closed());

        // At most one entry per device id, and it is the new session
        assert_eq!(registry.len().await, 1);
        let current = registry.get("pi-a").await.unwrap();
        assert!(current.same_session(&second));
    }

    #[tokio::test]
    async fn stale_deregistration_is_ignored() {
        let registry = DeviceRegistry::new();
        let first = session("pi-a", &["cam1"]);
        registry.register(first.clone()).await;
        let second = session("pi-a", &["cam1"]);
        registry.register(second.clone()).await;

        // The superseded handler wakes up late and tries to deregister
        registry.deregister(&first).await;
        assert_eq!(registry.len().await, 1, "newer registration must survive");

        registry.deregister(&second).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn resolve_prefers_device_id_then_scans_cameras() {
        let registry = DeviceRegistry::new();
        registry.register(session("pi-a", &["cam1", "cam2"])).await;
        registry.register(session("pi-b", &["cam3"])).await;

        let by_device = registry.resolve("pi-b").await.unwrap();
        assert_eq!(by_device.device_id(), "pi-b");

        let by_camera = registry.resolve("cam2").await.unwrap();
        assert_eq!(by_camera.device_id(), "pi-a");

        assert!(registry.resolve("cam9").await.is_none());
    }

    #[tokio::test]
    async fn cameras_enumerates_all_sessions() {
        let registry = DeviceRegistry::new();
        registry.register(session("pi-b", &["cam3"])).await;
        registry.register(session("pi-a", &["cam1", "cam2"])).await;

        let cameras = registry.cameras().await;
        let pairs: Vec<(String, String)> = cameras
            .into_iter()
            .map(|c| (c.device_id, c.camera_id))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("pi-a".into(), "cam1".into()),
                ("pi-a".into(), "cam2".into()),
                ("pi-b".into(), "cam3".into()),
            ]
        );
    }

    #[tokio::test]
    async fn sweep_evicts_only_silent_sessions() {
        let registry = DeviceRegistry::new();
        let quiet = session("pi-quiet", &["cam1"]);
        let lively = session("pi-lively", &["cam2"]);
        registry.register(quiet.clone()).await;
        registry.register(lively.clone()).await;

        // A zero timeout makes any session "silent"; keep one alive by
        // touching it after the comparison baseline.
        tokio::time::sleep(Duration::from_millis(20)).await;
        lively.touch();

        let evicted = registry.sweep_idle(Duration::from_millis(10)).await;
        assert_eq!(evicted, vec!["pi-quiet".to_string()]);
        assert!(quiet.is_closed());
        assert_eq!(quiet.close_reason(), Some(CloseReason::HeartbeatTimeout));
        assert!(!lively.is_closed());
    }

    #[tokio::test]
    async fn close_all_drains_the_table() {
        let registry = DeviceRegistry::new();
        let a = session("pi-a", &["cam1"]);
        let b = session("pi-b", &["cam2"]);
        registry.register(a.clone()).await;
        registry.register(b.clone()).await;

        registry.close_all(CloseReason::Shutdown).await;
        assert!(registry.is_empty().await);
        assert_eq!(a.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(b.close_reason(), Some(CloseReason::Shutdown));
    }
}
