//! PALF -- leader reconfirm: log-level prepare, mode meta re-proposal, and
//! catching up on the most advanced tail before serving appends.

use std::net::SocketAddr;

use super::*;

use crate::utils::{Bitmap, PalfError};

/// Stages of leader reconfirm, in order.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(super) enum ReconfirmStage {
    /// Waiting for a majority of granted LogPrepareResp.
    Preparing,
    /// Waiting for a majority to accept the re-stamped mode meta.
    ReconfirmModeMeta,
    /// Fetching the most advanced tail reported during prepare.
    FetchingLog,
}

/// Candidate-side bookkeeping while reconfirming.
#[derive(Debug, Clone)]
pub(super) struct ReconfirmState {
    pub(super) stage: ReconfirmStage,

    /// Members snapshot the majorities are counted against.
    voters: Vec<SocketAddr>,

    /// Servers that granted my prepare, voters or not.
    granted: Vec<SocketAddr>,

    prepare_acks: Bitmap,

    mode_acks: Bitmap,

    /// Most advanced tail reported: (last entry pid, end lsn, reporter).
    max_log: (ProposalId, Lsn, SocketAddr),

    /// Newest mode meta reported.
    max_mode_meta: ModeMeta,

    /// Newest config meta reported.
    max_config_meta: LogConfigMeta,
}

impl ReconfirmState {
    /// Marks `server` in `bitmap`; false if it is not a voter.
    fn ack(
        bitmap: &mut Bitmap,
        voters: &[SocketAddr],
        server: &SocketAddr,
    ) -> Result<bool, PalfError> {
        match voters.iter().position(|v| v == server) {
            Some(idx) => {
                bitmap.set(idx, true)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// PalfReplica leader reconfirm logic
impl PalfReplica {
    /// Becomes a candidate under a proposal ID above both my current one and
    /// the election epoch, and broadcasts LogPrepareReq.
    pub(super) fn begin_reconfirm(
        &mut self,
        epoch: ProposalId,
    ) -> Result<(), PalfError> {
        let Some(next_pid) = self
            .proposal_id
            .checked_add(1)
            .filter(|pid| is_valid_proposal_id(*pid))
        else {
            return Err(PalfError::StateNotMatch(format!(
                "proposal id space exhausted at {}",
                self.proposal_id
            )));
        };
        let new_pid = next_pid.max(epoch);
        self.advance_proposal_id(new_pid, Some(self.me));
        self.role = Role::Candidate;

        let voters = self.config_mgr.curr_config().members.clone();
        let tail = self.tail();
        let mut rc = ReconfirmState {
            stage: ReconfirmStage::Preparing,
            prepare_acks: Bitmap::new(voters.len(), false),
            mode_acks: Bitmap::new(voters.len(), false),
            max_log: (tail.log_proposal_id, tail.end_lsn(), self.me),
            max_mode_meta: self.mode_mgr.meta().clone(),
            max_config_meta: self.config_mgr.meta().clone(),
            granted: vec![self.me],
            voters,
        };
        ReconfirmState::ack(&mut rc.prepare_acks, &rc.voters, &self.me)?;
        self.reconfirm = Some(rc);
        pf_info!(
            "palf {} reconfirming as candidate at pid {}",
            self.palf_id,
            new_pid
        );

        self.bcast_members(PalfRequest::Prepare(LogPrepareReq {
            log_proposal_id: new_pid,
        }))?;
        self.check_reconfirm_progress()
    }

    /// Handler of LogPrepareReq from a candidate.
    pub(super) fn handle_prepare_request(
        &mut self,
        server: SocketAddr,
        log_proposal_id: ProposalId,
    ) -> Result<(), PalfError> {
        pf_trace!(
            "palf {} received LogPrepareReq <- {} pid {}",
            self.palf_id,
            server,
            log_proposal_id
        );
        let tail = self.tail();

        if log_proposal_id < self.proposal_id {
            // tell the candidate about my term so it can move past it
            self.send(
                server,
                PalfRequest::PrepareResp(LogPrepareResp {
                    msg_proposal_id: self.proposal_id,
                    vote_granted: false,
                    log_proposal_id: tail.log_proposal_id,
                    lsn: tail.end_lsn(),
                    log_mode_meta: self.mode_mgr.meta().clone(),
                    log_config_meta: self.config_mgr.meta().clone(),
                }),
            )?;
            return Err(PalfError::StaleTerm {
                local: self.proposal_id,
                msg: log_proposal_id,
            });
        }
        if log_proposal_id > self.proposal_id {
            self.advance_proposal_id(log_proposal_id, Some(server));
        } else if self.leader != Some(server) {
            return Ok(()); // already promised someone else this term
        }

        self.send(
            server,
            PalfRequest::PrepareResp(LogPrepareResp {
                msg_proposal_id: log_proposal_id,
                vote_granted: true,
                log_proposal_id: tail.log_proposal_id,
                lsn: tail.end_lsn(),
                log_mode_meta: self.mode_mgr.meta().clone(),
                log_config_meta: self.config_mgr.meta().clone(),
            }),
        )?;
        pf_trace!(
            "palf {} granted prepare -> {} pid {} tail {:?}",
            self.palf_id,
            server,
            log_proposal_id,
            tail
        );
        Ok(())
    }

    /// Handler of LogPrepareResp from a voter.
    pub(super) fn handle_prepare_response(
        &mut self,
        server: SocketAddr,
        resp: LogPrepareResp,
    ) -> Result<(), PalfError> {
        pf_trace!(
            "palf {} received LogPrepareResp <- {} granted {} pid {}",
            self.palf_id,
            server,
            resp.vote_granted,
            resp.msg_proposal_id
        );
        if !resp.vote_granted {
            if resp.msg_proposal_id > self.proposal_id {
                self.advance_proposal_id(resp.msg_proposal_id, None);
            }
            return Ok(());
        }
        self.fence_proposal_id(resp.msg_proposal_id, None)?;
        if resp.msg_proposal_id != self.proposal_id {
            return Ok(());
        }

        let Some(rc) = self.reconfirm.as_mut() else {
            return Ok(()); // ignore if not reconfirming
        };
        if rc.stage != ReconfirmStage::Preparing {
            return Ok(()); // ignore late replies
        }
        if !rc.granted.contains(&server) {
            rc.granted.push(server);
        }
        if !ReconfirmState::ack(&mut rc.prepare_acks, &rc.voters, &server)? {
            return Ok(());
        }
        if (resp.log_proposal_id, resp.lsn) > (rc.max_log.0, rc.max_log.1) {
            rc.max_log = (resp.log_proposal_id, resp.lsn, server);
        }
        if resp.log_mode_meta.order_key() > rc.max_mode_meta.order_key() {
            rc.max_mode_meta = resp.log_mode_meta;
        }
        if resp.log_config_meta.version > rc.max_config_meta.version {
            rc.max_config_meta = resp.log_config_meta;
        }

        self.check_reconfirm_progress()
    }

    /// Mode meta ack received while reconfirming.
    pub(super) fn reconfirm_mode_acked(
        &mut self,
        server: SocketAddr,
    ) -> Result<(), PalfError> {
        let Some(rc) = self.reconfirm.as_mut() else {
            return Ok(());
        };
        if rc.stage != ReconfirmStage::ReconfirmModeMeta {
            return Ok(());
        }
        ReconfirmState::ack(&mut rc.mode_acks, &rc.voters, &server)?;
        self.check_reconfirm_progress()
    }

    /// Moves reconfirm forward as far as current acks allow.
    fn check_reconfirm_progress(&mut self) -> Result<(), PalfError> {
        let Some(rc) = self.reconfirm.as_mut() else {
            return Ok(());
        };

        if rc.stage == ReconfirmStage::Preparing {
            if !rc.prepare_acks.has_majority() {
                return Ok(());
            }
            if rc.max_config_meta.version > self.config_mgr.version() {
                let meta = rc.max_config_meta.clone();
                return self.adopt_reconfirm_config(meta);
            }
            rc.stage = ReconfirmStage::ReconfirmModeMeta;
            let meta = ModeMeta {
                proposal_id: self.proposal_id,
                ..rc.max_mode_meta.clone()
            };
            let voters = rc.voters.clone();
            ReconfirmState::ack(&mut rc.mode_acks, &voters, &self.me)?;
            pf_debug!(
                "palf {} prepare majority reached, re-proposing mode {:?}",
                self.palf_id,
                meta
            );

            self.mode_mgr.install(meta.clone());
            self.bcast_members(PalfRequest::ChangeModeMeta(
                LogChangeModeMetaReq {
                    msg_proposal_id: self.proposal_id,
                    meta,
                },
            ))?;
            return self.check_reconfirm_progress();
        }

        if rc.stage == ReconfirmStage::ReconfirmModeMeta {
            if !rc.mode_acks.has_majority() {
                return Ok(());
            }
            rc.stage = ReconfirmStage::FetchingLog;
            let (max_pid, max_end, source) = rc.max_log;
            let tail = self.tail();
            if source == self.me
                || (tail.log_proposal_id, tail.end_lsn()) >= (max_pid, max_end)
            {
                return self.finish_reconfirm();
            }

            pf_debug!(
                "palf {} fetching max log (pid {} end {}) from {}",
                self.palf_id,
                max_pid,
                max_end,
                source
            );
            let start = self.committed_end_lsn;
            return self.issue_fetch(
                source,
                FetchLogType::LeaderReconfirm,
                start,
                max_end,
            );
        }

        self.check_reconfirm_fetch_done()
    }

    /// Installs a newer config meta learned from the prepare majority. The
    /// prepare then has to win a majority of the new members as well, unless
    /// I am no longer one of them, in which case I step down.
    fn adopt_reconfirm_config(
        &mut self,
        meta: LogConfigMeta,
    ) -> Result<(), PalfError> {
        pf_info!(
            "palf {} adopting config {:?} {:?} learned during prepare",
            self.palf_id,
            meta.version,
            meta.curr.members
        );
        self.config_mgr.accept(meta);

        if !self.is_member() {
            pf_warn!(
                "palf {} not a member at config {:?}, giving up reconfirm",
                self.palf_id,
                self.config_mgr.version()
            );
            self.reconfirm = None;
            self.catch_up = None;
            self.role = Role::Follower;
            self.leader = None;
            return Ok(());
        }

        let voters = self.config_mgr.curr_config().members.clone();
        let Some(rc) = self.reconfirm.as_mut() else {
            return Ok(());
        };
        let mut prepare_acks = Bitmap::new(voters.len(), false);
        for server in &rc.granted {
            ReconfirmState::ack(&mut prepare_acks, &voters, server)?;
        }
        let missing: Vec<SocketAddr> = voters
            .iter()
            .filter(|v| !rc.granted.contains(v))
            .copied()
            .collect();
        rc.mode_acks = Bitmap::new(voters.len(), false);
        rc.prepare_acks = prepare_acks;
        rc.voters = voters;

        let req = PalfRequest::Prepare(LogPrepareReq {
            log_proposal_id: self.proposal_id,
        });
        self.outbox.bcast_msg(&missing, self.palf_id, req)?;
        self.check_reconfirm_progress()
    }

    /// Whether my log now ends with the most advanced tail reported during
    /// prepare; if so, drops anything beyond it and finishes reconfirm.
    pub(super) fn check_reconfirm_fetch_done(
        &mut self,
    ) -> Result<(), PalfError> {
        let Some(rc) = self.reconfirm.as_ref() else {
            return Ok(());
        };
        if rc.stage != ReconfirmStage::FetchingLog {
            return Ok(());
        }
        let (max_pid, max_end, source) = rc.max_log;
        let last = LogInfo::new(max_end - 1, max_pid);
        if self.storage.log_info_at(last.lsn) != Some(last) {
            // batch exhausted but not there yet: request the next one
            if let Some(catch_up) = self.catch_up.as_ref() {
                if self.end_lsn() >= catch_up.batch_end {
                    let start = self.end_lsn();
                    self.issue_fetch(
                        source,
                        FetchLogType::LeaderReconfirm,
                        start,
                        max_end,
                    )?;
                }
            }
            return Ok(());
        }

        if self.end_lsn() > max_end {
            // stale uncommitted suffix beyond the chosen tail
            if max_end <= self.committed_end_lsn {
                return logged_err!(
                    "palf {} reconfirm would truncate committed lsn {}",
                    self.palf_id,
                    max_end
                );
            }
            self.storage.truncate(max_end)?;
        }
        self.finish_reconfirm()
    }

    /// Becomes the active leader: re-stamps uncommitted entries with my
    /// proposal ID and re-pushes them, then re-proposes any staged config.
    fn finish_reconfirm(&mut self) -> Result<(), PalfError> {
        self.reconfirm = None;
        self.catch_up = None;
        self.role = Role::Leader;
        self.leader = Some(self.me);
        self.match_end_lsn.clear();

        let (committed, end_lsn) = (self.committed_end_lsn, self.end_lsn());
        let restamped = self.storage.rewrite_proposal_id(
            committed,
            end_lsn,
            self.proposal_id,
        )?;
        pf_info!(
            "palf {} became leader at pid {} (end {}, {} uncommitted)",
            self.palf_id,
            self.proposal_id,
            self.end_lsn(),
            restamped
        );

        self.repush_uncommitted()?;
        self.repropose_config()?;
        self.try_advance_committed()
    }
}
