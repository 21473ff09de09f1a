//! PALF -- log push / ack / fetch / committed-info / rebuild handling.

use std::net::SocketAddr;

use super::*;

use crate::utils::{Bitmap, PalfError};

/// Outstanding catch-up fetch of a follower, learner, or reconfirming leader.
#[derive(Debug, Clone)]
pub(super) struct CatchUp {
    /// Server the fetch was sent to.
    pub(super) source: SocketAddr,

    pub(super) fetch_type: FetchLogType,

    /// Exclusive end LSN the catch-up is aiming for.
    pub(super) target_end: Lsn,

    /// Exclusive end LSN of the currently requested batch.
    pub(super) batch_end: Lsn,
}

/// Rebuild notice recorded from a server that recycled logs I'm missing.
#[derive(Debug, Clone)]
pub(super) struct RebuildInfo {
    pub(super) source: SocketAddr,
    pub(super) base_lsn: Lsn,
    pub(super) base_prev_log_info: LogInfo,
}

// PalfReplica log replication handling
impl PalfReplica {
    /// Handler of LogPushReq from leader (or learner parent), or of entries
    /// sent back in answer to a fetch.
    pub(super) fn receive_log(
        &mut self,
        server: SocketAddr,
        req: LogPushReq,
    ) -> Result<(), PalfError> {
        let from_leader = req.push_log_type == PushLogType::PushLog
            && self.config_mgr.curr_config().is_member(&server);
        self.fence_proposal_id(
            req.msg_proposal_id,
            if from_leader { Some(server) } else { None },
        )?;
        if from_leader && self.role != Role::Follower {
            return logged_err!(
                "palf {} {:?} got PushLog <- {} at my own pid {}",
                self.palf_id,
                self.role,
                server,
                self.proposal_id
            );
        }
        if from_leader && self.leader.is_none() {
            self.leader = Some(server);
        }

        // mode fencing
        let local_mode_pid = self.accepted_mode_pid();
        if req.accepted_mode_pid != local_mode_pid {
            if req.accepted_mode_pid > local_mode_pid {
                self.fetch_mode_meta(server)?;
            }
            return Err(PalfError::ModeMismatch {
                local: local_mode_pid,
                msg: req.accepted_mode_pid,
            });
        }

        let prev = req.prev_log_info();
        let entry = req.to_entry();
        pf_trace!(
            "palf {} received {:?} <- {} lsn {} pid {}",
            self.palf_id,
            req.push_log_type,
            server,
            entry.lsn,
            entry.proposal_id
        );

        let base = self.storage.base_info();
        if entry.lsn <= base.lsn {
            return Ok(()); // ignore if already recycled locally
        }

        // same entry already present: idempotent, just re-ack
        if self.storage.log_info_at(entry.lsn) == Some(entry.log_info()) {
            return self.after_log_accepted(server, &req, false);
        }

        // continuity check against the entry right before
        match self.storage.log_info_at(prev.lsn) {
            Some(local_prev) if self.continues_from(local_prev, prev) => {}
            Some(local_prev) => {
                // diverged at or before prev; refetch from the committed point
                let start = self.committed_end_lsn;
                self.issue_fetch(
                    server,
                    self.catch_up_fetch_type(),
                    start,
                    entry.lsn + 1,
                )?;
                return Err(PalfError::LogContinuityGap {
                    expected: local_prev,
                    received: prev,
                });
            }
            None if prev.lsn < base.lsn => {
                return Ok(()); // ignore if prev already recycled locally
            }
            None => {
                let tail = self.tail();
                self.issue_fetch(
                    server,
                    self.catch_up_fetch_type(),
                    tail.end_lsn(),
                    entry.lsn + 1,
                )?;
                return Err(PalfError::LogContinuityGap {
                    expected: tail,
                    received: prev,
                });
            }
        }

        if entry.lsn < self.committed_end_lsn {
            return self.restamp_committed(server, &req, entry);
        }

        // conflicting suffix gets truncated, never below the committed point
        if entry.lsn < self.end_lsn() {
            pf_debug!(
                "palf {} truncating log from lsn {} (end {})",
                self.palf_id,
                entry.lsn,
                self.end_lsn()
            );
            self.storage.truncate(entry.lsn)?;
        }
        self.storage.append(entry)?;

        self.after_log_accepted(server, &req, true)
    }

    /// Whether my entry `local_prev` at `prev.lsn` lets the sender's log
    /// continue from it. Below my committed point the content is settled and
    /// only a reconfirm re-stamp can make proposal IDs differ.
    pub(super) fn continues_from(
        &self,
        local_prev: LogInfo,
        prev: LogInfo,
    ) -> bool {
        local_prev == prev || prev.lsn < self.committed_end_lsn
    }

    /// Handles a pushed entry at a position I already hold as committed. It
    /// must carry the same content as mine; a newer proposal ID from a
    /// reconfirm re-stamp is adopted and acked like a fresh append.
    fn restamp_committed(
        &mut self,
        server: SocketAddr,
        req: &LogPushReq,
        entry: LogEntry,
    ) -> Result<(), PalfError> {
        let Some(local) = self.storage.get_entry(entry.lsn) else {
            return logged_err!(
                "palf {} missing committed entry at lsn {}",
                self.palf_id,
                entry.lsn
            );
        };
        if local.data != entry.data
            || local.config_version != entry.config_version
        {
            return logged_err!(
                "palf {} asked to overwrite committed lsn {} < {}",
                self.palf_id,
                entry.lsn,
                self.committed_end_lsn
            );
        }

        let restamped = local.proposal_id < entry.proposal_id;
        if restamped {
            self.storage.rewrite_proposal_id(
                entry.lsn,
                entry.lsn + 1,
                entry.proposal_id,
            )?;
            pf_debug!(
                "palf {} restamped committed lsn {} pid {} -> {}",
                self.palf_id,
                entry.lsn,
                local.proposal_id,
                entry.proposal_id
            );
        }
        self.after_log_accepted(server, req, restamped)
    }

    /// Follow-ups once a pushed entry is present locally: ack to the leader,
    /// fan out to learner children, and advance any outstanding catch-up.
    fn after_log_accepted(
        &mut self,
        server: SocketAddr,
        req: &LogPushReq,
        newly_appended: bool,
    ) -> Result<(), PalfError> {
        let ack_to = match req.push_log_type {
            PushLogType::PushLog => Some(server),
            PushLogType::FetchLogResp => self.leader.filter(|&l| l == server),
        };
        if let Some(leader) = ack_to {
            if self.role == Role::Follower
                && self.is_member()
                && req.msg_proposal_id == self.proposal_id
            {
                self.send(
                    leader,
                    PalfRequest::PushLogResp(LogPushResp {
                        msg_proposal_id: self.proposal_id,
                        lsn: req.curr_lsn + 1,
                    }),
                )?;
                pf_trace!(
                    "palf {} sent LogPushResp -> {} lsn {}",
                    self.palf_id,
                    leader,
                    req.curr_lsn + 1
                );
            }
        }

        if newly_appended && req.push_log_type == PushLogType::PushLog {
            self.bcast_children(PalfRequest::PushLog(req.clone()))?;
        }

        self.check_catch_up_progress()
    }

    /// Fetch type to use when closing a gap in my current role.
    #[inline]
    fn catch_up_fetch_type(&self) -> FetchLogType {
        if self.role == Role::Candidate {
            FetchLogType::LeaderReconfirm
        } else {
            FetchLogType::Follower
        }
    }

    /// Sends a bounded fetch for entries from `start` to `source`, recording
    /// the catch-up target.
    pub(super) fn issue_fetch(
        &mut self,
        source: SocketAddr,
        fetch_type: FetchLogType,
        start: Lsn,
        target_end: Lsn,
    ) -> Result<(), PalfError> {
        let base = self.storage.base_info();
        let start = start.max(base.end_lsn()).min(self.end_lsn());
        let Some(prev) = self.storage.log_info_at(start - 1) else {
            return logged_err!(
                "palf {} no local entry before fetch start {}",
                self.palf_id,
                start
            );
        };
        let count = (target_end.saturating_sub(start) as usize)
            .clamp(1, self.config.fetch_log_count_limit);

        let req = LogFetchReq {
            fetch_type,
            msg_proposal_id: self.proposal_id,
            prev_lsn: prev.lsn,
            lsn: start,
            fetch_log_size: self.config.fetch_log_size_limit,
            fetch_log_count: count,
            accepted_mode_pid: self.accepted_mode_pid(),
        };
        self.send(source, PalfRequest::FetchLog(req))?;
        pf_debug!(
            "palf {} sent {:?} fetch -> {} lsn {} count {} target {}",
            self.palf_id,
            fetch_type,
            source,
            start,
            count,
            target_end
        );

        self.catch_up = Some(CatchUp {
            source,
            fetch_type,
            target_end: target_end.max(start + 1),
            batch_end: start + count as u64,
        });
        Ok(())
    }

    /// Asks a server with a newer mode meta to send it over.
    pub(super) fn fetch_mode_meta(
        &mut self,
        server: SocketAddr,
    ) -> Result<(), PalfError> {
        let tail = self.tail();
        self.send(
            server,
            PalfRequest::FetchLog(LogFetchReq {
                fetch_type: FetchLogType::ModeMeta,
                msg_proposal_id: self.proposal_id,
                prev_lsn: tail.lsn,
                lsn: tail.end_lsn(),
                fetch_log_size: 1,
                fetch_log_count: 1,
                accepted_mode_pid: self.accepted_mode_pid(),
            }),
        )?;
        pf_debug!("palf {} sent ModeMeta fetch -> {}", self.palf_id, server);
        Ok(())
    }

    /// Checks whether the outstanding catch-up is done, or its current batch
    /// is exhausted and the next one should be requested.
    fn check_catch_up_progress(&mut self) -> Result<(), PalfError> {
        let Some(catch_up) = self.catch_up.clone() else {
            return Ok(());
        };

        if catch_up.fetch_type == FetchLogType::LeaderReconfirm {
            return self.check_reconfirm_fetch_done();
        }

        let end_lsn = self.end_lsn();
        if end_lsn >= catch_up.target_end {
            pf_debug!(
                "palf {} caught up to {} from {}",
                self.palf_id,
                end_lsn,
                catch_up.source
            );
            self.catch_up = None;
        } else if end_lsn >= catch_up.batch_end {
            self.issue_fetch(
                catch_up.source,
                catch_up.fetch_type,
                end_lsn,
                catch_up.target_end,
            )?;
        }
        Ok(())
    }

    /// Re-issues the outstanding catch-up fetch from the current tail, e.g.,
    /// after a size-limited batch came back short.
    pub(super) fn retry_catch_up(&mut self) -> Result<(), PalfError> {
        let Some(catch_up) = self.catch_up.clone() else {
            return Ok(());
        };
        let start = if catch_up.fetch_type == FetchLogType::LeaderReconfirm {
            self.committed_end_lsn
        } else {
            self.end_lsn()
        };
        self.issue_fetch(
            catch_up.source,
            catch_up.fetch_type,
            start,
            catch_up.target_end,
        )
    }

    /// Handler of LogPushResp from follower.
    pub(super) fn ack_log(
        &mut self,
        server: SocketAddr,
        msg_proposal_id: ProposalId,
        lsn: Lsn,
    ) -> Result<(), PalfError> {
        self.fence_proposal_id(msg_proposal_id, None)?;
        if !self.is_leader() || msg_proposal_id != self.proposal_id {
            return Ok(()); // ignore if not leading this term
        }
        if !self.config_mgr.is_any_member(&server) {
            return Ok(()); // ignore acks from non-voters
        }
        pf_trace!(
            "palf {} received LogPushResp <- {} lsn {}",
            self.palf_id,
            server,
            lsn
        );

        let end_lsn = self.end_lsn();
        let match_end = self.match_end_lsn.entry(server).or_insert(0);
        *match_end = (*match_end).max(lsn.min(end_lsn));

        self.try_advance_committed()
    }

    /// Whether a majority of `config` has durably appended up to `end`.
    fn quorum_reached(
        &self,
        config: &MembershipConfig,
        end: Lsn,
    ) -> Result<bool, PalfError> {
        let mut acks = Bitmap::new(config.members.len(), false);
        for (idx, member) in config.members.iter().enumerate() {
            let match_end = if *member == self.me {
                self.end_lsn()
            } else {
                self.match_end_lsn.get(member).copied().unwrap_or(0)
            };
            if match_end >= end {
                acks.set(idx, true)?;
            }
        }
        Ok(acks.has_majority())
    }

    /// Leader-side commit rule: advance entry by entry while a majority of the
    /// membership each entry was proposed under has it. Broadcasts the new
    /// committed info when it moves.
    pub(super) fn try_advance_committed(&mut self) -> Result<(), PalfError> {
        if !self.is_leader() {
            return Ok(());
        }

        let old_committed = self.committed_end_lsn;
        let end_lsn = self.end_lsn();
        let mut new_committed = old_committed;
        while new_committed < end_lsn {
            let Some(entry) = self.storage.get_entry(new_committed) else {
                return logged_err!(
                    "palf {} missing entry at lsn {} below end {}",
                    self.palf_id,
                    new_committed,
                    end_lsn
                );
            };
            let Some(config) = self.config_mgr.config_of(&entry.config_version)
            else {
                return logged_err!(
                    "palf {} lsn {} proposed under unknown config {:?}",
                    self.palf_id,
                    new_committed,
                    entry.config_version
                );
            };
            if !self.quorum_reached(config, new_committed + 1)? {
                break;
            }
            new_committed += 1;
        }

        if new_committed > old_committed {
            self.set_committed_end(new_committed);
            pf_debug!(
                "palf {} committed end {} -> {}",
                self.palf_id,
                old_committed,
                new_committed
            );
            self.bcast_committed_info()?;
        }
        Ok(())
    }

    /// Moves my committed point forward and forgets configs that only
    /// committed entries were proposed under.
    fn set_committed_end(&mut self, committed_end_lsn: Lsn) {
        self.committed_end_lsn = committed_end_lsn;
        self.config_mgr.prune_history(self.oldest_needed_version());
    }

    /// Oldest config version still referenced by an uncommitted entry.
    fn oldest_needed_version(&self) -> ConfigVersion {
        self.storage
            .get_entry(self.committed_end_lsn)
            .map_or(self.config_mgr.version(), |e| e.config_version)
    }

    /// Broadcasts the current committed info to members and learner children.
    fn bcast_committed_info(&self) -> Result<(), PalfError> {
        let prev_lsn = self.committed_end_lsn - 1;
        let Some(prev) = self.storage.log_info_at(prev_lsn) else {
            return Ok(()); // nothing to anchor on after a rebuild
        };
        let req = PalfRequest::CommittedInfo(CommittedInfo {
            msg_proposal_id: self.proposal_id,
            prev_lsn,
            prev_log_proposal_id: prev.log_proposal_id,
            committed_end_lsn: self.committed_end_lsn,
        });
        self.bcast_members(req.clone())?;
        self.bcast_children(req)
    }

    /// Handler of CommittedInfo from leader (or learner parent).
    pub(super) fn handle_committed_info(
        &mut self,
        server: SocketAddr,
        msg_proposal_id: ProposalId,
        prev_lsn: Lsn,
        prev_log_proposal_id: ProposalId,
        committed_end_lsn: Lsn,
    ) -> Result<(), PalfError> {
        let from_leader = self.config_mgr.curr_config().is_member(&server);
        self.fence_proposal_id(
            msg_proposal_id,
            if from_leader { Some(server) } else { None },
        )?;
        if self.is_leader() {
            return Ok(()); // ignore, I drive my own committed point
        }
        pf_trace!(
            "palf {} received CommittedInfo <- {} prev {} end {}",
            self.palf_id,
            server,
            prev_lsn,
            committed_end_lsn
        );

        match self.storage.log_info_at(prev_lsn) {
            Some(info) if info.log_proposal_id == prev_log_proposal_id => {
                let new_committed =
                    committed_end_lsn.min(prev_lsn + 1).min(self.end_lsn());
                if new_committed > self.committed_end_lsn {
                    self.set_committed_end(new_committed);
                    pf_trace!(
                        "palf {} committed end -> {}",
                        self.palf_id,
                        new_committed
                    );
                    self.bcast_children(PalfRequest::CommittedInfo(
                        CommittedInfo {
                            msg_proposal_id,
                            prev_lsn,
                            prev_log_proposal_id,
                            committed_end_lsn: new_committed,
                        },
                    ))?;
                }
            }
            Some(_) if prev_lsn < self.committed_end_lsn => {} // nothing new
            Some(_) => {
                // diverged locally; refetch from my committed point
                if self.catch_up.is_none() {
                    let start = self.committed_end_lsn;
                    self.issue_fetch(
                        server,
                        FetchLogType::Follower,
                        start,
                        committed_end_lsn,
                    )?;
                }
            }
            None if prev_lsn >= self.end_lsn() => {
                // behind the leader; fetch the missing range
                if self.catch_up.is_none() {
                    let start = self.end_lsn();
                    self.issue_fetch(
                        server,
                        FetchLogType::Follower,
                        start,
                        committed_end_lsn,
                    )?;
                }
            }
            None => {} // already recycled locally
        }
        Ok(())
    }

    /// Handler of LogFetchReq: serves a bounded range of entries back to the
    /// requester as FetchLogResp pushes, or the mode meta for mode fetches.
    pub(super) fn get_log(
        &mut self,
        server: SocketAddr,
        req: &LogFetchReq,
    ) -> Result<(), PalfError> {
        pf_trace!(
            "palf {} received {:?} fetch <- {} lsn {} count {}",
            self.palf_id,
            req.fetch_type,
            server,
            req.lsn,
            req.fetch_log_count
        );

        if req.fetch_type == FetchLogType::ModeMeta {
            self.send(
                server,
                PalfRequest::ChangeModeMeta(LogChangeModeMetaReq {
                    msg_proposal_id: self.proposal_id,
                    meta: self.mode_mgr.meta().clone(),
                }),
            )?;
            return Ok(());
        }

        if req.fetch_type == FetchLogType::LeaderReconfirm
            && req.msg_proposal_id != self.proposal_id
        {
            return Err(PalfError::StaleTerm {
                local: self.proposal_id,
                msg: req.msg_proposal_id,
            });
        }

        // mode fencing; help a lagging requester along with my mode meta
        let local_mode_pid = self.accepted_mode_pid();
        if req.accepted_mode_pid != local_mode_pid {
            if req.accepted_mode_pid < local_mode_pid {
                self.send(
                    server,
                    PalfRequest::ChangeModeMeta(LogChangeModeMetaReq {
                        msg_proposal_id: self.proposal_id,
                        meta: self.mode_mgr.meta().clone(),
                    }),
                )?;
            }
            return Err(PalfError::ModeMismatch {
                local: local_mode_pid,
                msg: req.accepted_mode_pid,
            });
        }

        // requested range already recycled: requester must rebuild
        let base = self.storage.base_info();
        if req.lsn <= base.lsn {
            self.send(
                server,
                PalfRequest::NotifyRebuild(NotifyRebuildReq {
                    base_lsn: base.end_lsn(),
                    base_prev_log_info: base,
                }),
            )?;
            pf_info!(
                "palf {} sent NotifyRebuildReq -> {} base {}",
                self.palf_id,
                server,
                base.end_lsn()
            );
            return Ok(());
        }

        let Some(mut prev) = self.storage.log_info_at(req.lsn - 1) else {
            return Ok(()); // nothing to serve beyond my tail
        };
        let entries = self.storage.read(
            req.lsn,
            req.fetch_log_size.min(self.config.fetch_log_size_limit),
            req.fetch_log_count.min(self.config.fetch_log_count_limit),
        );
        let num_entries = entries.len();
        for entry in entries {
            self.send(
                server,
                PalfRequest::PushLog(LogPushReq::new(
                    PushLogType::FetchLogResp,
                    self.proposal_id,
                    prev,
                    local_mode_pid,
                    &entry,
                )),
            )?;
            prev = entry.log_info();
        }
        pf_trace!(
            "palf {} served {} entries -> {} from lsn {}",
            self.palf_id,
            num_entries,
            server,
            req.lsn
        );
        Ok(())
    }

    /// Handler of NotifyRebuildReq: the sender can no longer serve entries
    /// before `base_lsn`; record it if I am actually behind that point.
    pub(super) fn handle_notify_rebuild_req(
        &mut self,
        server: SocketAddr,
        base_lsn: Lsn,
        base_prev_log_info: LogInfo,
    ) -> Result<(), PalfError> {
        if self.end_lsn() >= base_lsn {
            return Ok(()); // ignore if not behind
        }
        pf_warn!(
            "palf {} needs rebuild from {} at base {} (my end {})",
            self.palf_id,
            server,
            base_lsn,
            self.end_lsn()
        );
        self.rebuild_info = Some(RebuildInfo {
            source: server,
            base_lsn,
            base_prev_log_info,
        });
        Ok(())
    }

    /// Restarts the log after the given base, typically once a snapshot of
    /// everything before `base_lsn` has been installed.
    pub(super) fn rebuild(
        &mut self,
        base_lsn: Lsn,
        base_prev_log_info: LogInfo,
    ) -> Result<(), PalfError> {
        if self.role != Role::Follower {
            return Err(PalfError::StateNotMatch(format!(
                "cannot rebuild as {:?}",
                self.role
            )));
        }
        if base_prev_log_info.end_lsn() != base_lsn
            || base_lsn < self.storage.base_info().end_lsn()
        {
            return Err(PalfError::invalid(format!(
                "rebuild base {} prev {:?}",
                base_lsn, base_prev_log_info
            )));
        }

        self.storage.reset_base(base_prev_log_info)?;
        self.set_committed_end(self.committed_end_lsn.max(base_lsn));
        self.catch_up = None;
        let source = self.rebuild_info.take().map(|info| {
            pf_debug!(
                "palf {} rebuild notice from {} at {:?} resolved",
                self.palf_id,
                info.source,
                info.base_prev_log_info
            );
            info.source
        });
        pf_info!("palf {} rebuilt at base {}", self.palf_id, base_lsn);

        // resume catching up from whoever told me to rebuild
        if let Some(source) = source.or(self.leader) {
            self.fetch_from(source)?;
        }
        Ok(())
    }

    /// Starts a plain follower catch-up from the given server.
    fn fetch_from(&mut self, source: SocketAddr) -> Result<(), PalfError> {
        let end_lsn = self.end_lsn();
        self.issue_fetch(source, FetchLogType::Follower, end_lsn, end_lsn + 1)
    }

    /// Appends a new entry as the active leader and pushes it out.
    pub(super) fn submit_log(
        &mut self,
        data: Vec<u8>,
    ) -> Result<Lsn, PalfError> {
        if !self.is_leader() {
            return Err(PalfError::NotLeader);
        }
        if self.mode_mgr.meta().access_mode != AccessMode::Append {
            return Err(PalfError::StateNotMatch(format!(
                "access mode {:?}",
                self.mode_mgr.meta().access_mode
            )));
        }
        if data.is_empty() {
            return Err(PalfError::invalid("empty log data"));
        }

        let prev = self.tail();
        let entry = LogEntry {
            lsn: prev.end_lsn(),
            proposal_id: self.proposal_id,
            config_version: self.config_mgr.version(),
            data,
        };
        let lsn = entry.lsn;
        let push = LogPushReq::new(
            PushLogType::PushLog,
            self.proposal_id,
            prev,
            self.accepted_mode_pid(),
            &entry,
        );
        self.storage.append(entry)?;
        pf_trace!("palf {} submitted log at lsn {}", self.palf_id, lsn);

        let req = PalfRequest::PushLog(push);
        self.bcast_members(req.clone())?;
        self.bcast_children(req)?;

        // single-member clusters commit right away
        self.try_advance_committed()?;
        Ok(lsn)
    }

    /// Re-pushes every uncommitted entry under the current term, chained after
    /// the committed point.
    pub(super) fn repush_uncommitted(&self) -> Result<(), PalfError> {
        let start = self.committed_end_lsn;
        let Some(mut prev) = self.storage.log_info_at(start - 1) else {
            return Ok(());
        };
        let mode_pid = self.accepted_mode_pid();
        for entry in self.storage.read(start, usize::MAX, usize::MAX) {
            let req = PalfRequest::PushLog(LogPushReq::new(
                PushLogType::PushLog,
                self.proposal_id,
                prev,
                mode_pid,
                &entry,
            ));
            self.bcast_members(req.clone())?;
            self.bcast_children(req)?;
            prev = entry.log_info();
        }
        Ok(())
    }
}
