//! Per-server PALF environment: the registry of partition handles, the scoped
//! guard handed out to request handlers, and local resource checks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::palf::{
    is_valid_palf_id, MembershipConfig, PalfConfig, PalfHandleImpl, PalfId,
    PalfReplica,
};
use crate::storage::{LogStorage, MemLogStorage};
use crate::transport::{Outbox, OutboxReceiver};
use crate::utils::PalfError;

/// Scoped acquisition of a partition handle. While a guard is alive the
/// handle cannot be torn down; dropping the guard releases the reference on
/// every exit path.
#[derive(Debug)]
pub struct PalfHandleGuard {
    handle: Arc<PalfHandleImpl>,
}

impl PalfHandleGuard {
    fn new(handle: Arc<PalfHandleImpl>) -> Self {
        handle.inc_ref();
        PalfHandleGuard { handle }
    }

    /// The guarded partition handle.
    #[inline]
    pub fn get_palf_handle_impl(&self) -> &PalfHandleImpl {
        &self.handle
    }
}

impl Deref for PalfHandleGuard {
    type Target = PalfHandleImpl;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for PalfHandleGuard {
    fn drop(&mut self) {
        self.handle.dec_ref();
    }
}

/// Local disk / memory headroom flags, flipped by whatever monitors them.
#[derive(Debug)]
pub struct ResourceMonitor {
    disk_space_enough: AtomicBool,
    memory_enough: AtomicBool,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        ResourceMonitor {
            disk_space_enough: AtomicBool::new(true),
            memory_enough: AtomicBool::new(true),
        }
    }
}

impl ResourceMonitor {
    #[inline]
    pub fn check_disk_space_enough(&self) -> bool {
        self.disk_space_enough.load(Ordering::Acquire)
    }

    #[inline]
    pub fn check_memory_enough(&self) -> bool {
        self.memory_enough.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_disk_space_enough(&self, enough: bool) {
        self.disk_space_enough.store(enough, Ordering::Release);
    }

    #[inline]
    pub fn set_memory_enough(&self, enough: bool) {
        self.memory_enough.store(enough, Ordering::Release);
    }
}

/// Server-wide PALF environment owning every partition handle.
#[derive(Debug)]
pub struct PalfEnv {
    /// My server address.
    me: SocketAddr,

    /// Configuration parameters struct shared by all handles.
    config: PalfConfig,

    /// Outbound channel shared by all handles.
    outbox: Outbox,

    /// Map from partition ID -> handle.
    palf_handles: RwLock<HashMap<PalfId, Arc<PalfHandleImpl>>>,

    /// Local resource checks.
    resource_monitor: ResourceMonitor,
}

impl PalfEnv {
    /// Creates a new environment for server `me`, parsing config from an
    /// optional TOML string. Returns the env along with the receiver side of
    /// its outbound message channel, to be drained by the network layer.
    pub fn new_and_setup(
        me: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<(Self, OutboxReceiver), PalfError> {
        let config = PalfConfig::from_config_str(config_str)?;
        let (outbox, rx) = Outbox::new_pair(me);
        pf_info!("palf env {} set up with {:?}", me, config);
        Ok((
            PalfEnv {
                me,
                config,
                outbox,
                palf_handles: RwLock::new(HashMap::new()),
                resource_monitor: ResourceMonitor::default(),
            },
            rx,
        ))
    }

    #[inline]
    pub fn me(&self) -> SocketAddr {
        self.me
    }

    #[inline]
    pub fn config(&self) -> &PalfConfig {
        &self.config
    }

    #[inline]
    pub fn resource_monitor(&self) -> &ResourceMonitor {
        &self.resource_monitor
    }

    /// Creates a partition backed by in-memory storage.
    pub fn create_palf_handle(
        &self,
        palf_id: PalfId,
        init_config: MembershipConfig,
    ) -> Result<(), PalfError> {
        self.create_palf_handle_with_storage(
            palf_id,
            init_config,
            Box::new(MemLogStorage::new()),
        )
    }

    /// Creates a partition on top of the given storage.
    pub fn create_palf_handle_with_storage(
        &self,
        palf_id: PalfId,
        init_config: MembershipConfig,
        storage: Box<dyn LogStorage>,
    ) -> Result<(), PalfError> {
        if !is_valid_palf_id(palf_id) {
            return Err(PalfError::invalid(format!("palf_id {}", palf_id)));
        }
        let replica = PalfReplica::new(
            palf_id,
            self.me,
            self.config.clone(),
            self.outbox.clone(),
            storage,
            init_config,
        )?;

        let mut palf_handles = self.palf_handles.write()?;
        if palf_handles.contains_key(&palf_id) {
            return Err(PalfError::StateNotMatch(format!(
                "palf {} already exists",
                palf_id
            )));
        }
        palf_handles.insert(palf_id, Arc::new(PalfHandleImpl::new(replica)));
        pf_info!("palf {} created", palf_id);
        Ok(())
    }

    /// Looks up a live partition and returns a scoped guard over it.
    pub fn get_palf_handle(
        &self,
        palf_id: PalfId,
    ) -> Result<PalfHandleGuard, PalfError> {
        let palf_handles = self.palf_handles.read()?;
        match palf_handles.get(&palf_id) {
            Some(handle) if !handle.is_destroyed() => {
                Ok(PalfHandleGuard::new(handle.clone()))
            }
            _ => Err(PalfError::PartitionNotFound(palf_id)),
        }
    }

    /// Unlinks a partition so no new guards can be handed out, waits for all
    /// outstanding guards to be released, then destroys it.
    pub async fn remove_palf_handle(
        &self,
        palf_id: PalfId,
    ) -> Result<(), PalfError> {
        let handle = self
            .palf_handles
            .write()?
            .remove(&palf_id)
            .ok_or(PalfError::PartitionNotFound(palf_id))?;
        pf_info!(
            "palf {} unlinked, waiting for {} refs",
            palf_id,
            handle.ref_cnt()
        );
        handle.wait_drained().await;
        handle.destroy()
    }

    /// IDs of every registered partition, in ascending order.
    pub fn palf_ids(&self) -> Result<Vec<PalfId>, PalfError> {
        let mut ids: Vec<PalfId> =
            self.palf_handles.read()?.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod env_tests {
    use super::*;
    use std::time::Duration;

    fn env(port: u16) -> (PalfEnv, OutboxReceiver) {
        let me = SocketAddr::from(([127, 0, 0, 1], port));
        PalfEnv::new_and_setup(me, None).expect("env set up")
    }

    #[test]
    fn create_get_and_duplicate() -> Result<(), PalfError> {
        let (env, _rx) = env(9001);
        let config = MembershipConfig::new(vec![env.me()]);
        env.create_palf_handle(3, config.clone())?;
        env.create_palf_handle(1, config.clone())?;
        assert!(matches!(
            env.create_palf_handle(3, config.clone()),
            Err(PalfError::StateNotMatch(_))
        ));
        assert!(matches!(
            env.create_palf_handle(-1, config),
            Err(PalfError::InvalidArgument(_))
        ));
        assert_eq!(env.palf_ids()?, vec![1, 3]);
        assert!(matches!(
            env.get_palf_handle(2),
            Err(PalfError::PartitionNotFound(2))
        ));

        let guard = env.get_palf_handle(3)?;
        assert_eq!(guard.ref_cnt(), 1);
        {
            let second = env.get_palf_handle(3)?;
            assert_eq!(second.get_palf_handle_impl().palf_id(), 3);
            assert_eq!(guard.ref_cnt(), 2);
        }
        assert_eq!(guard.ref_cnt(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_waits_for_guards() -> Result<(), PalfError> {
        let (env, _rx) = env(9002);
        let env = Arc::new(env);
        env.create_palf_handle(7, MembershipConfig::new(vec![env.me()]))?;

        let guard = env.get_palf_handle(7)?;
        let remover = {
            let env = env.clone();
            tokio::spawn(async move { env.remove_palf_handle(7).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        // unlinked already, but still usable through the live guard
        assert!(!remover.is_finished());
        assert!(matches!(
            env.get_palf_handle(7),
            Err(PalfError::PartitionNotFound(7))
        ));
        assert!(guard.stat().is_ok());

        drop(guard);
        remover.await.expect("remover joined")?;
        assert!(env.palf_ids()?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_guards_never_see_destroyed() -> Result<(), PalfError> {
        let (env, _rx) = env(9003);
        let env = Arc::new(env);
        env.create_palf_handle(1, MembershipConfig::new(vec![env.me()]))?;

        let mut workers = Vec::new();
        for _ in 0..8 {
            let env = env.clone();
            workers.push(tokio::spawn(async move {
                let mut acquired = 0;
                for _ in 0..2000 {
                    match env.get_palf_handle(1) {
                        Ok(guard) => {
                            assert!(!guard.is_destroyed());
                            assert!(guard.stat().is_ok());
                            acquired += 1;
                        }
                        Err(e) => {
                            assert_eq!(e, PalfError::PartitionNotFound(1));
                        }
                    }
                    tokio::task::yield_now().await;
                }
                acquired
            }));
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        env.remove_palf_handle(1).await?;
        for worker in workers {
            worker.await.expect("worker joined");
        }
        assert!(matches!(
            env.get_palf_handle(1),
            Err(PalfError::PartitionNotFound(1))
        ));
        Ok(())
    }
}
