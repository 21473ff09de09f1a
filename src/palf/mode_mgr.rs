//! PALF -- access mode meta management.

use std::net::SocketAddr;

use super::*;

use crate::utils::{Bitmap, PalfError};

/// Leader-side in-flight mode change.
#[derive(Debug, Clone)]
struct PendingMode {
    voters: Vec<SocketAddr>,
    acks: Bitmap,
}

/// Installed mode meta plus any leader-side change in flight.
#[derive(Debug)]
pub(super) struct ModeMgr {
    meta: ModeMeta,
    pending: Option<PendingMode>,
}

impl ModeMgr {
    pub(super) fn new() -> Self {
        ModeMgr {
            meta: ModeMeta::initial(),
            pending: None,
        }
    }

    #[inline]
    pub(super) fn meta(&self) -> &ModeMeta {
        &self.meta
    }

    /// Replaces the installed mode meta.
    #[inline]
    pub(super) fn install(&mut self, meta: ModeMeta) {
        self.meta = meta;
    }

    #[inline]
    pub(super) fn clear_pending(&mut self) {
        self.pending = None;
    }
}

// PalfReplica access mode handling
impl PalfReplica {
    /// Proposes a new access mode as the active leader. The new meta takes
    /// effect locally right away so appends stop before followers hear of it.
    pub(super) fn change_access_mode(
        &mut self,
        access_mode: AccessMode,
    ) -> Result<(), PalfError> {
        if !self.is_leader() {
            return Err(PalfError::NotLeader);
        }
        if self.mode_mgr.pending.is_some() {
            return Err(PalfError::StateNotMatch(
                "mode change already in progress".into(),
            ));
        }
        if self.mode_mgr.meta.access_mode == access_mode {
            return Ok(());
        }

        let meta = ModeMeta {
            proposal_id: self.proposal_id,
            mode_version: self.mode_mgr.meta.mode_version + 1,
            access_mode,
        };
        pf_info!(
            "palf {} changing access mode {:?} -> {:?}",
            self.palf_id,
            self.mode_mgr.meta.access_mode,
            access_mode
        );
        self.mode_mgr.install(meta.clone());

        let voters = self.config_mgr.curr_config().members.clone();
        let mut acks = Bitmap::new(voters.len(), false);
        if let Some(idx) = voters.iter().position(|v| *v == self.me) {
            acks.set(idx, true)?;
        }
        self.mode_mgr.pending = Some(PendingMode { voters, acks });

        self.bcast_members(PalfRequest::ChangeModeMeta(LogChangeModeMetaReq {
            msg_proposal_id: self.proposal_id,
            meta,
        }))?;
        self.check_mode_change_majority();
        Ok(())
    }

    /// Handler of LogChangeModeMetaReq from leader (or any server answering a
    /// mode meta fetch).
    pub(super) fn receive_mode_meta(
        &mut self,
        server: SocketAddr,
        msg_proposal_id: ProposalId,
        meta: ModeMeta,
    ) -> Result<(), PalfError> {
        self.fence_proposal_id(msg_proposal_id, None)?;
        pf_trace!(
            "palf {} received LogChangeModeMetaReq <- {} {:?}",
            self.palf_id,
            server,
            meta
        );

        let local = self.mode_mgr.meta();
        if meta.order_key() < local.order_key() {
            return Err(PalfError::ModeMismatch {
                local: local.proposal_id,
                msg: meta.proposal_id,
            });
        }
        if meta.order_key() > local.order_key() {
            pf_debug!(
                "palf {} installing mode meta {:?}",
                self.palf_id,
                meta
            );
            self.mode_mgr.install(meta);
            // a catch-up fetch refused under the old mode can go on now
            if self.role == Role::Follower {
                self.retry_catch_up()?;
            }
        }

        if self.role == Role::Follower && self.is_member() {
            self.send(
                server,
                PalfRequest::ChangeModeMetaResp(LogChangeModeMetaResp {
                    msg_proposal_id: self.proposal_id,
                }),
            )?;
        }
        Ok(())
    }

    /// Handler of LogChangeModeMetaResp from a member.
    pub(super) fn ack_mode_meta(
        &mut self,
        server: SocketAddr,
        msg_proposal_id: ProposalId,
    ) -> Result<(), PalfError> {
        self.fence_proposal_id(msg_proposal_id, None)?;
        if msg_proposal_id != self.proposal_id {
            return Ok(());
        }
        pf_trace!(
            "palf {} received LogChangeModeMetaResp <- {}",
            self.palf_id,
            server
        );

        match self.role {
            Role::Candidate => self.reconfirm_mode_acked(server),
            Role::Leader => {
                if let Some(pending) = self.mode_mgr.pending.as_mut() {
                    if let Some(idx) =
                        pending.voters.iter().position(|v| *v == server)
                    {
                        pending.acks.set(idx, true)?;
                    }
                }
                self.check_mode_change_majority();
                Ok(())
            }
            Role::Follower => Ok(()),
        }
    }

    /// Completes the pending mode change once a majority has it.
    fn check_mode_change_majority(&mut self) {
        if self
            .mode_mgr
            .pending
            .as_ref()
            .is_some_and(|p| p.acks.has_majority())
        {
            self.mode_mgr.pending = None;
            pf_info!(
                "palf {} access mode {:?} accepted by majority",
                self.palf_id,
                self.mode_mgr.meta.access_mode
            );
        }
    }
}
