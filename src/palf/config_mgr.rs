//! PALF -- membership configuration management.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use super::*;

use crate::utils::{Bitmap, PalfError};

/// Version of the configuration every stream is created with.
pub(super) const INIT_CONFIG_VERSION: ConfigVersion = ConfigVersion {
    proposal_id: 0,
    config_seq: 1,
};

/// Leader-side in-flight config change; acks are counted against the
/// previous configuration's members.
#[derive(Debug, Clone)]
struct PendingConfig {
    version: ConfigVersion,
    voters: Vec<SocketAddr>,
    acks: Bitmap,
}

/// Latest accepted config meta, the history of configs still referenced by
/// uncommitted entries, and any leader-side change in flight.
#[derive(Debug)]
pub(super) struct ConfigMgr {
    meta: LogConfigMeta,
    history: BTreeMap<ConfigVersion, MembershipConfig>,
    pending: Option<PendingConfig>,
}

impl ConfigMgr {
    pub(super) fn new(init_config: MembershipConfig) -> Self {
        let mut history = BTreeMap::new();
        history.insert(INIT_CONFIG_VERSION, init_config.clone());
        ConfigMgr {
            meta: LogConfigMeta::initial(init_config),
            history,
            pending: None,
        }
    }

    #[inline]
    pub(super) fn meta(&self) -> &LogConfigMeta {
        &self.meta
    }

    #[inline]
    pub(super) fn curr_config(&self) -> &MembershipConfig {
        &self.meta.curr
    }

    #[inline]
    pub(super) fn version(&self) -> ConfigVersion {
        self.meta.version
    }

    /// Configuration in effect at the given version, if still remembered.
    #[inline]
    pub(super) fn config_of(
        &self,
        version: &ConfigVersion,
    ) -> Option<&MembershipConfig> {
        self.history.get(version)
    }

    /// Members to broadcast to: current members, plus the previous ones
    /// while a change is in flight.
    pub(super) fn all_members(&self) -> Vec<SocketAddr> {
        let mut members = self.meta.curr.members.clone();
        if self.pending.is_some() {
            for m in &self.meta.prev.members {
                if !members.contains(m) {
                    members.push(*m);
                }
            }
        }
        members
    }

    /// Whether `server` is a voter in the current or in-flight configs.
    pub(super) fn is_any_member(&self, server: &SocketAddr) -> bool {
        self.meta.curr.is_member(server)
            || (self.pending.is_some() && self.meta.prev.is_member(server))
    }

    #[inline]
    pub(super) fn clear_pending(&mut self) {
        self.pending = None;
    }

    /// Adopts a newer config meta.
    pub(super) fn accept(&mut self, meta: LogConfigMeta) {
        self.history.insert(meta.version, meta.curr.clone());
        self.meta = meta;
    }

    /// Forgets configs older than `oldest_needed`, always keeping the
    /// current one.
    pub(super) fn prune_history(&mut self, oldest_needed: ConfigVersion) {
        let keep_from = oldest_needed.min(self.meta.version);
        self.history = self.history.split_off(&keep_from);
    }
}

impl LogConfigMeta {
    /// Meta a stream is created with: `config` under the initial version.
    pub(super) fn initial(config: MembershipConfig) -> Self {
        LogConfigMeta {
            version: INIT_CONFIG_VERSION,
            prev: config.clone(),
            curr: config,
        }
    }
}

/// Whether every majority of `new` intersects every majority of `old`, so
/// the two can never commit conflicting decisions.
pub(super) fn quorums_intersect(
    old: &[SocketAddr],
    new: &[SocketAddr],
) -> bool {
    let shared = old.iter().filter(|m| new.contains(m)).count();
    let only_old = old.len() - shared;
    let only_new = new.len() - shared;
    let old_quorum = old.len() / 2 + 1;
    let new_quorum = new.len() / 2 + 1;
    // smallest overlap two quorums are forced to have on shared members
    old_quorum.saturating_sub(only_old) + new_quorum.saturating_sub(only_new)
        > shared
}

// PalfReplica membership change logic
impl PalfReplica {
    /// Proposes a new membership configuration as the active leader.
    pub(super) fn change_config(
        &mut self,
        new_config: MembershipConfig,
    ) -> Result<ConfigVersion, PalfError> {
        if !self.is_leader() {
            return Err(PalfError::NotLeader);
        }
        if !new_config.is_valid() {
            return Err(PalfError::invalid(format!("config {:?}", new_config)));
        }
        if let Some(pending) = self.config_mgr.pending.as_ref() {
            return Err(PalfError::StateNotMatch(format!(
                "config change {:?} still in progress",
                pending.version
            )));
        }
        let curr = self.config_mgr.curr_config();
        if *curr == new_config {
            return Ok(self.config_mgr.version());
        }
        if !new_config.is_member(&self.me) {
            return Err(PalfError::StateNotMatch(
                "cannot remove the leader itself".into(),
            ));
        }
        if !quorums_intersect(&curr.members, &new_config.members) {
            return Err(PalfError::StateNotMatch(format!(
                "unsafe change {:?} -> {:?}",
                curr.members, new_config.members
            )));
        }

        let version = ConfigVersion::new(
            self.proposal_id,
            self.config_mgr.version().config_seq + 1,
        );
        let meta = LogConfigMeta {
            version,
            prev: curr.clone(),
            curr: new_config,
        };
        pf_info!(
            "palf {} proposing config {:?} -> {:?} at {:?}",
            self.palf_id,
            meta.prev.members,
            meta.curr.members,
            version
        );
        self.propose_config_meta(meta)?;
        Ok(version)
    }

    /// Installs the meta locally, starts collecting acks, and pushes it out.
    fn propose_config_meta(
        &mut self,
        meta: LogConfigMeta,
    ) -> Result<(), PalfError> {
        let voters = meta.prev.members.clone();
        let mut acks = Bitmap::new(voters.len(), false);
        if let Some(idx) = voters.iter().position(|v| *v == self.me) {
            acks.set(idx, true)?;
        }
        self.config_mgr.pending = Some(PendingConfig {
            version: meta.version,
            voters,
            acks,
        });

        let tail = self.tail();
        let req = LogChangeConfigMetaReq {
            msg_proposal_id: self.proposal_id,
            prev_log_proposal_id: tail.log_proposal_id,
            prev_lsn: tail.lsn,
            prev_mode_pid: self.accepted_mode_pid(),
            meta: meta.clone(),
        };
        let learners: Vec<SocketAddr> = meta
            .prev
            .learners
            .iter()
            .chain(meta.curr.learners.iter())
            .map(|l| l.server)
            .collect();
        self.config_mgr.accept(meta);

        self.bcast_members(PalfRequest::ChangeConfigMeta(req.clone()))?;
        self.outbox.bcast_msg(
            &learners,
            self.palf_id,
            PalfRequest::ChangeConfigMeta(req),
        )?;
        self.check_config_change_majority()
    }

    /// Re-proposes my latest config meta under my new proposal ID, so a
    /// change staged by a previous leader gets finished.
    pub(super) fn repropose_config(&mut self) -> Result<(), PalfError> {
        let meta = &self.config_mgr.meta;
        if meta.prev == meta.curr {
            return Ok(());
        }
        let meta = LogConfigMeta {
            version: ConfigVersion::new(
                self.proposal_id,
                meta.version.config_seq,
            ),
            prev: meta.prev.clone(),
            curr: meta.curr.clone(),
        };
        pf_debug!(
            "palf {} re-proposing config meta at {:?}",
            self.palf_id,
            meta.version
        );
        self.propose_config_meta(meta)
    }

    pub(super) fn add_member(
        &mut self,
        server: SocketAddr,
    ) -> Result<ConfigVersion, PalfError> {
        let mut config = self.config_mgr.curr_config().clone();
        if config.is_member(&server) {
            return Err(PalfError::invalid(format!(
                "{} already a member",
                server
            )));
        }
        config.learners.retain(|l| l.server != server);
        config.members.push(server);
        self.change_config(config)
    }

    pub(super) fn remove_member(
        &mut self,
        server: SocketAddr,
    ) -> Result<ConfigVersion, PalfError> {
        let mut config = self.config_mgr.curr_config().clone();
        if !config.is_member(&server) {
            return Err(PalfError::invalid(format!("{} not a member", server)));
        }
        config.members.retain(|m| *m != server);
        self.change_config(config)
    }

    pub(super) fn add_learner(
        &mut self,
        learner: LogLearner,
    ) -> Result<ConfigVersion, PalfError> {
        let mut config = self.config_mgr.curr_config().clone();
        if config.is_learner(&learner.server) {
            return Err(PalfError::invalid(format!(
                "{} already a learner",
                learner.server
            )));
        }
        config.learners.push(learner);
        self.change_config(config)
    }

    pub(super) fn remove_learner(
        &mut self,
        server: SocketAddr,
    ) -> Result<ConfigVersion, PalfError> {
        let mut config = self.config_mgr.curr_config().clone();
        if !config.is_learner(&server) {
            return Err(PalfError::invalid(format!("{} not a learner", server)));
        }
        config.learners.retain(|l| l.server != server);
        self.change_config(config)
    }

    /// Handler of LogChangeConfigMetaReq from leader.
    pub(super) fn receive_config_log(
        &mut self,
        server: SocketAddr,
        req: LogChangeConfigMetaReq,
    ) -> Result<(), PalfError> {
        self.fence_proposal_id(req.msg_proposal_id, Some(server))?;
        if self.role != Role::Follower {
            return logged_err!(
                "palf {} {:?} got config meta <- {} at my own pid {}",
                self.palf_id,
                self.role,
                server,
                self.proposal_id
            );
        }
        pf_trace!(
            "palf {} received LogChangeConfigMetaReq <- {} {:?}",
            self.palf_id,
            server,
            req.meta.version
        );

        // mode fencing
        let local_mode_pid = self.accepted_mode_pid();
        if req.prev_mode_pid != local_mode_pid {
            if req.prev_mode_pid > local_mode_pid {
                self.fetch_mode_meta(server)?;
            }
            return Err(PalfError::ModeMismatch {
                local: local_mode_pid,
                msg: req.prev_mode_pid,
            });
        }

        let local_version = self.config_mgr.version();
        if req.meta.version < local_version {
            return Err(PalfError::StaleConfig {
                local: local_version,
                msg: req.meta.version,
            });
        }

        if req.meta.version > local_version {
            // the leader's log up to prev must be present before adopting
            let prev = LogInfo::new(req.prev_lsn, req.prev_log_proposal_id);
            match self.storage.log_info_at(prev.lsn) {
                Some(local_prev) if self.continues_from(local_prev, prev) => {}
                Some(local_prev) => {
                    let start = self.committed_end_lsn;
                    self.issue_fetch(
                        server,
                        FetchLogType::Follower,
                        start,
                        prev.end_lsn(),
                    )?;
                    return Err(PalfError::LogContinuityGap {
                        expected: local_prev,
                        received: prev,
                    });
                }
                None if prev.lsn >= self.end_lsn() => {
                    let tail = self.tail();
                    self.issue_fetch(
                        server,
                        FetchLogType::Follower,
                        tail.end_lsn(),
                        prev.end_lsn(),
                    )?;
                    return Err(PalfError::LogContinuityGap {
                        expected: tail,
                        received: prev,
                    });
                }
                None => {} // prev already recycled locally
            }

            pf_info!(
                "palf {} adopting config {:?} at {:?}",
                self.palf_id,
                req.meta.curr.members,
                req.meta.version
            );
            self.config_mgr.accept(req.meta.clone());
        }

        // ack if I vote in either config
        if req.meta.prev.is_member(&self.me)
            || req.meta.curr.is_member(&self.me)
        {
            self.send(
                server,
                PalfRequest::ChangeConfigMetaResp(LogChangeConfigMetaResp {
                    proposal_id: self.proposal_id,
                    config_version: req.meta.version,
                }),
            )?;
        }
        Ok(())
    }

    /// Handler of LogChangeConfigMetaResp from a member.
    pub(super) fn ack_config_log(
        &mut self,
        server: SocketAddr,
        proposal_id: ProposalId,
        config_version: ConfigVersion,
    ) -> Result<(), PalfError> {
        self.fence_proposal_id(proposal_id, None)?;
        if !self.is_leader() || proposal_id != self.proposal_id {
            return Ok(()); // ignore if not leading this term
        }
        pf_trace!(
            "palf {} received LogChangeConfigMetaResp <- {} {:?}",
            self.palf_id,
            server,
            config_version
        );

        let local_version = self.config_mgr.version();
        let Some(pending) = self.config_mgr.pending.as_mut() else {
            if config_version < local_version {
                return Err(PalfError::StaleConfig {
                    local: local_version,
                    msg: config_version,
                });
            }
            return Ok(()); // late ack of a committed change
        };
        if config_version != pending.version {
            if config_version < pending.version {
                return Err(PalfError::StaleConfig {
                    local: pending.version,
                    msg: config_version,
                });
            }
            return Ok(());
        }
        if let Some(idx) = pending.voters.iter().position(|v| *v == server) {
            pending.acks.set(idx, true)?;
        }
        self.check_config_change_majority()
    }

    /// Commits the pending change once a majority of the previous config
    /// has acked it.
    fn check_config_change_majority(&mut self) -> Result<(), PalfError> {
        let Some(pending) = self.config_mgr.pending.as_ref() else {
            return Ok(());
        };
        if !pending.acks.has_majority() {
            return Ok(());
        }
        pf_info!(
            "palf {} config {:?} committed with members {:?}",
            self.palf_id,
            pending.version,
            self.config_mgr.curr_config().members
        );
        self.config_mgr.pending = None;

        // forget progress of servers no longer voting
        let curr = self.config_mgr.curr_config().clone();
        self.match_end_lsn.retain(|m, _| curr.is_member(m));
        self.try_advance_committed()
    }

    /// Read-only member-change status, used by a leader before proposing a
    /// reconfiguration.
    pub(super) fn get_memberchange_status(
        &self,
        server: SocketAddr,
        req: &LogGetMCStReq,
    ) -> LogGetMCStResp {
        pf_trace!(
            "palf {} member change status query <- {} {:?}",
            self.palf_id,
            server,
            req.config_version
        );
        let version = self.config_mgr.version();
        LogGetMCStResp {
            msg_proposal_id: self.proposal_id,
            is_normal_replica: self.rebuild_info.is_none(),
            need_update_config_meta: version != req.config_version,
            config_version: version,
            max_flushed_end_lsn: self.end_lsn(),
            committed_end_lsn: self.committed_end_lsn,
        }
    }
}
