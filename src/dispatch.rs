//! Inbound request dispatcher: validates each message, acquires a scoped
//! handle for its partition and forwards it to exactly one handle operation.

use std::net::SocketAddr;

use crate::env::{PalfEnv, PalfHandleGuard};
use crate::palf::{
    is_valid_addr, is_valid_palf_id, CommittedInfo, ElectionMessage,
    ElectionMsg, LogChangeConfigMetaReq, LogChangeConfigMetaResp,
    LogChangeModeMetaReq, LogChangeModeMetaResp, LogFetchReq, LogGetMCStReq,
    LogGetMCStResp, LogLearnerReq, LogPrepareReq, LogPrepareResp, LogPushReq,
    LogPushResp, LogRegisterParentReq, LogRegisterParentResp,
    NotifyRebuildReq, PalfId, PalfRequest,
};
use crate::utils::PalfError;

/// Stateless dispatcher over a `PalfEnv`; safe to use from many tasks at
/// once, for the same or different partitions.
#[derive(Debug, Clone, Copy)]
pub struct LogRequestHandler<'e> {
    palf_env: &'e PalfEnv,
}

impl<'e> LogRequestHandler<'e> {
    pub fn new(palf_env: &'e PalfEnv) -> Self {
        LogRequestHandler { palf_env }
    }

    /// Dispatches one fire-and-forget message from `server`.
    pub fn handle_request(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: PalfRequest,
    ) -> Result<(), PalfError> {
        match req {
            PalfRequest::PushLog(req) => {
                self.handle_push_log(palf_id, server, req)
            }
            PalfRequest::PushLogResp(req) => {
                self.handle_push_log_resp(palf_id, server, req)
            }
            PalfRequest::NotifyRebuild(req) => {
                self.handle_notify_rebuild(palf_id, server, req)
            }
            PalfRequest::CommittedInfo(req) => {
                self.handle_committed_info(palf_id, server, req)
            }
            PalfRequest::FetchLog(req) => {
                self.handle_fetch_log(palf_id, server, req)
            }
            PalfRequest::Prepare(req) => {
                self.handle_prepare(palf_id, server, req)
            }
            PalfRequest::PrepareResp(req) => {
                self.handle_prepare_resp(palf_id, server, req)
            }
            PalfRequest::ChangeConfigMeta(req) => {
                self.handle_change_config_meta(palf_id, server, req)
            }
            PalfRequest::ChangeConfigMetaResp(req) => {
                self.handle_change_config_meta_resp(palf_id, server, req)
            }
            PalfRequest::ChangeModeMeta(req) => {
                self.handle_change_mode_meta(palf_id, server, req)
            }
            PalfRequest::ChangeModeMetaResp(req) => {
                self.handle_change_mode_meta_resp(palf_id, server, req)
            }
            PalfRequest::Learner(req) => {
                self.handle_learner(palf_id, server, req)
            }
            PalfRequest::RegisterParent(req) => {
                self.handle_register_parent(palf_id, server, req)
            }
            PalfRequest::RegisterParentResp(req) => {
                self.handle_register_parent_resp(palf_id, server, req)
            }
            PalfRequest::Election(msg) => match msg {
                ElectionMsg::PrepareRequest(m) => {
                    self.handle_election_msg(palf_id, m)
                }
                ElectionMsg::PrepareResponse(m) => {
                    self.handle_election_msg(palf_id, m)
                }
                ElectionMsg::AcceptRequest(m) => {
                    self.handle_election_msg(palf_id, m)
                }
                ElectionMsg::AcceptResponse(m) => {
                    self.handle_election_msg(palf_id, m)
                }
                ElectionMsg::ChangeLeader(m) => {
                    self.handle_election_msg(palf_id, m)
                }
            },
        }
    }

    /// Answers a member-change status query. A server short on disk or
    /// memory reports itself as not a normal replica without looking the
    /// partition up.
    pub fn handle_sync_request(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: &LogGetMCStReq,
    ) -> Result<LogGetMCStResp, PalfError> {
        self.check_args(palf_id, server, "LogGetMCStReq", req.is_valid())?;

        if self.palf_env.config().check_resource_on_status_query {
            let monitor = self.palf_env.resource_monitor();
            let disk_enough = monitor.check_disk_space_enough();
            let memory_enough = monitor.check_memory_enough();
            if !disk_enough || !memory_enough {
                pf_warn!(
                    "palf {} not a normal replica: disk_enough {} \
                     memory_enough {}",
                    palf_id,
                    disk_enough,
                    memory_enough
                );
                return Ok(LogGetMCStResp {
                    is_normal_replica: false,
                    ..Default::default()
                });
            }
        }

        let guard = self.acquire(palf_id)?;
        match guard.get_memberchange_status(server, req) {
            Ok(resp) => {
                pf_trace!(
                    "palf {} get_memberchange_status from {} ok: {:?}",
                    palf_id,
                    server,
                    resp
                );
                Ok(resp)
            }
            Err(e) => {
                pf_warn!(
                    "palf {} get_memberchange_status from {} failed: {}",
                    palf_id,
                    server,
                    e
                );
                Err(e)
            }
        }
    }
}

// LogRequestHandler per-message handlers
impl<'e> LogRequestHandler<'e> {
    fn handle_push_log(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: LogPushReq,
    ) -> Result<(), PalfError> {
        self.check_args(palf_id, server, "LogPushReq", req.is_valid())?;
        let guard = self.acquire(palf_id)?;
        let op = format!(
            "receive_log {:?} {}",
            req.push_log_type, req.curr_lsn
        );
        Self::log_outcome(palf_id, server, &op, guard.receive_log(server, req))
    }

    fn handle_push_log_resp(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: LogPushResp,
    ) -> Result<(), PalfError> {
        self.check_args(palf_id, server, "LogPushResp", req.is_valid())?;
        let guard = self.acquire(palf_id)?;
        Self::log_outcome(
            palf_id,
            server,
            "ack_log",
            guard.ack_log(server, req.msg_proposal_id, req.lsn),
        )
    }

    fn handle_notify_rebuild(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: NotifyRebuildReq,
    ) -> Result<(), PalfError> {
        self.check_args(palf_id, server, "NotifyRebuildReq", req.is_valid())?;
        let guard = self.acquire(palf_id)?;
        Self::log_outcome(
            palf_id,
            server,
            "handle_notify_rebuild_req",
            guard.handle_notify_rebuild_req(
                server,
                req.base_lsn,
                req.base_prev_log_info,
            ),
        )
    }

    fn handle_committed_info(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: CommittedInfo,
    ) -> Result<(), PalfError> {
        self.check_args(palf_id, server, "CommittedInfo", req.is_valid())?;
        let guard = self.acquire(palf_id)?;
        Self::log_outcome(
            palf_id,
            server,
            "handle_committed_info",
            guard.handle_committed_info(
                server,
                req.msg_proposal_id,
                req.prev_lsn,
                req.prev_log_proposal_id,
                req.committed_end_lsn,
            ),
        )
    }

    fn handle_fetch_log(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: LogFetchReq,
    ) -> Result<(), PalfError> {
        self.check_args(palf_id, server, "LogFetchReq", req.is_valid())?;
        let guard = self.acquire(palf_id)?;
        Self::log_outcome(
            palf_id,
            server,
            "get_log",
            guard.get_log(server, &req),
        )
    }

    fn handle_prepare(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: LogPrepareReq,
    ) -> Result<(), PalfError> {
        self.check_args(palf_id, server, "LogPrepareReq", req.is_valid())?;
        let guard = self.acquire(palf_id)?;
        Self::log_outcome(
            palf_id,
            server,
            "handle_prepare_request",
            guard.handle_prepare_request(server, req.log_proposal_id),
        )
    }

    fn handle_prepare_resp(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: LogPrepareResp,
    ) -> Result<(), PalfError> {
        self.check_args(palf_id, server, "LogPrepareResp", req.is_valid())?;
        let guard = self.acquire(palf_id)?;
        Self::log_outcome(
            palf_id,
            server,
            "handle_prepare_response",
            guard.handle_prepare_response(server, req),
        )
    }

    fn handle_change_config_meta(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: LogChangeConfigMetaReq,
    ) -> Result<(), PalfError> {
        self.check_args(
            palf_id,
            server,
            "LogChangeConfigMetaReq",
            req.is_valid(),
        )?;
        let guard = self.acquire(palf_id)?;
        Self::log_outcome(
            palf_id,
            server,
            "receive_config_log",
            guard.receive_config_log(server, req),
        )
    }

    fn handle_change_config_meta_resp(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: LogChangeConfigMetaResp,
    ) -> Result<(), PalfError> {
        self.check_args(
            palf_id,
            server,
            "LogChangeConfigMetaResp",
            req.is_valid(),
        )?;
        let guard = self.acquire(palf_id)?;
        Self::log_outcome(
            palf_id,
            server,
            "ack_config_log",
            guard.ack_config_log(server, req.proposal_id, req.config_version),
        )
    }

    fn handle_change_mode_meta(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: LogChangeModeMetaReq,
    ) -> Result<(), PalfError> {
        self.check_args(
            palf_id,
            server,
            "LogChangeModeMetaReq",
            req.is_valid(),
        )?;
        let guard = self.acquire(palf_id)?;
        Self::log_outcome(
            palf_id,
            server,
            "receive_mode_meta",
            guard.receive_mode_meta(server, req.msg_proposal_id, req.meta),
        )
    }

    fn handle_change_mode_meta_resp(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: LogChangeModeMetaResp,
    ) -> Result<(), PalfError> {
        self.check_args(
            palf_id,
            server,
            "LogChangeModeMetaResp",
            req.is_valid(),
        )?;
        let guard = self.acquire(palf_id)?;
        Self::log_outcome(
            palf_id,
            server,
            "ack_mode_meta",
            guard.ack_mode_meta(server, req.msg_proposal_id),
        )
    }

    fn handle_learner(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: LogLearnerReq,
    ) -> Result<(), PalfError> {
        self.check_args(palf_id, server, "LogLearnerReq", req.is_valid())?;
        let guard = self.acquire(palf_id)?;
        Self::log_outcome(
            palf_id,
            server,
            "handle_learner_req",
            guard.handle_learner_req(req.sender, req.req_type),
        )
    }

    fn handle_register_parent(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: LogRegisterParentReq,
    ) -> Result<(), PalfError> {
        self.check_args(
            palf_id,
            server,
            "LogRegisterParentReq",
            req.is_valid(),
        )?;
        let guard = self.acquire(palf_id)?;
        Self::log_outcome(
            palf_id,
            server,
            "handle_register_parent_req",
            guard.handle_register_parent_req(req.child, req.is_to_leader),
        )
    }

    fn handle_register_parent_resp(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        req: LogRegisterParentResp,
    ) -> Result<(), PalfError> {
        self.check_args(
            palf_id,
            server,
            "LogRegisterParentResp",
            req.is_valid(),
        )?;
        let guard = self.acquire(palf_id)?;
        Self::log_outcome(
            palf_id,
            server,
            "handle_register_parent_resp",
            guard.handle_register_parent_resp(
                req.parent,
                req.candidate_list,
                req.reg_ret,
            ),
        )
    }

    /// Shared path of every election message kind; contents stay opaque
    /// here and are interpreted by the election state machine.
    fn handle_election_msg<M: ElectionMessage>(
        &self,
        palf_id: PalfId,
        msg: M,
    ) -> Result<(), PalfError> {
        if !is_valid_palf_id(palf_id) || !msg.is_valid() {
            pf_error!("invalid {} for palf {}: {:?}", M::NAME, palf_id, msg);
            return Err(PalfError::invalid(format!(
                "{} for palf {}",
                M::NAME,
                palf_id
            )));
        }
        let guard = self.acquire(palf_id)?;
        let sender = msg.sender();
        match guard.handle_election_message(msg.into()) {
            Ok(()) => {
                pf_debug!(
                    "palf {} handled {} from {}",
                    palf_id,
                    M::NAME,
                    sender
                );
                Ok(())
            }
            Err(e) => {
                pf_warn!(
                    "palf {} handle {} from {} failed: {}",
                    palf_id,
                    M::NAME,
                    sender,
                    e
                );
                Err(e)
            }
        }
    }
}

// LogRequestHandler common helpers
impl<'e> LogRequestHandler<'e> {
    /// Fails with `InvalidArgument` before any registry access.
    fn check_args(
        &self,
        palf_id: PalfId,
        server: SocketAddr,
        name: &str,
        msg_valid: bool,
    ) -> Result<(), PalfError> {
        if !is_valid_palf_id(palf_id) || !is_valid_addr(&server) || !msg_valid
        {
            pf_error!(
                "invalid {} for palf {} from {}",
                name,
                palf_id,
                server
            );
            return Err(PalfError::invalid(format!(
                "{} for palf {} from {}",
                name, palf_id, server
            )));
        }
        Ok(())
    }

    fn acquire(&self, palf_id: PalfId) -> Result<PalfHandleGuard, PalfError> {
        self.palf_env.get_palf_handle(palf_id).map_err(|e| {
            pf_warn!("get palf handle {} failed: {}", palf_id, e);
            e
        })
    }

    fn log_outcome(
        palf_id: PalfId,
        server: SocketAddr,
        op: &str,
        result: Result<(), PalfError>,
    ) -> Result<(), PalfError> {
        match &result {
            Ok(()) => {
                pf_trace!("palf {} {} from {} ok", palf_id, op, server)
            }
            Err(e) => pf_warn!(
                "palf {} {} from {} failed: {}",
                palf_id,
                op,
                server,
                e
            ),
        }
        result
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;
    use crate::palf::{
        ConfigVersion, ElectionChangeLeaderMsg, ElectionPrepareRequestMsg,
        MembershipConfig, PushLogType,
    };
    use crate::transport::OutboxReceiver;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn push_req(msg_proposal_id: u64) -> LogPushReq {
        LogPushReq {
            push_log_type: PushLogType::PushLog,
            msg_proposal_id,
            prev_lsn: 0,
            prev_log_proposal_id: 0,
            curr_lsn: 1,
            accepted_mode_pid: 0,
            log_proposal_id: msg_proposal_id,
            config_version: ConfigVersion::new(0, 1),
            data: b"x".to_vec(),
        }
    }

    fn env_with_palf(me: SocketAddr) -> (PalfEnv, OutboxReceiver) {
        let (env, rx) = PalfEnv::new_and_setup(me, None).expect("env set up");
        env.create_palf_handle(
            1,
            MembershipConfig::new(vec![me, addr(8002), addr(8003)]),
        )
        .expect("palf created");
        (env, rx)
    }

    #[test]
    fn invalid_args_rejected_before_lookup() {
        let (env, _rx) = env_with_palf(addr(8001));
        let handler = LogRequestHandler::new(&env);

        // unknown partition with a bad message still reports invalid
        let mut bad = push_req(1);
        bad.data.clear();
        assert!(matches!(
            handler.handle_request(
                42,
                addr(8002),
                PalfRequest::PushLog(bad)
            ),
            Err(PalfError::InvalidArgument(_))
        ));
        assert!(matches!(
            handler.handle_request(
                -1,
                addr(8002),
                PalfRequest::PushLog(push_req(1))
            ),
            Err(PalfError::InvalidArgument(_))
        ));
        assert!(matches!(
            handler.handle_request(
                1,
                "0.0.0.0:0".parse().expect("addr"),
                PalfRequest::PushLog(push_req(1))
            ),
            Err(PalfError::InvalidArgument(_))
        ));
        let election: ElectionMsg = ElectionChangeLeaderMsg {
            sender: addr(8002),
            ballot: 1,
            new_leader: "0.0.0.0:0".parse().expect("addr"),
        }
        .into();
        assert!(matches!(
            handler.handle_request(
                1,
                addr(8002),
                PalfRequest::Election(election)
            ),
            Err(PalfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn unknown_partition_not_found() {
        let (env, _rx) = env_with_palf(addr(8001));
        let handler = LogRequestHandler::new(&env);
        let err = handler
            .handle_request(7, addr(8002), PalfRequest::PushLog(push_req(1)))
            .expect_err("partition 7 absent");
        assert_eq!(err, PalfError::PartitionNotFound(7));
        assert!(err.is_retryable());
    }

    #[test]
    fn outcome_propagated_unchanged() -> Result<(), PalfError> {
        let (env, _rx) = env_with_palf(addr(8001));
        let handler = LogRequestHandler::new(&env);
        handler.handle_request(
            1,
            addr(8002),
            PalfRequest::PushLog(push_req(5)),
        )?;
        assert_eq!(env.get_palf_handle(1)?.stat()?.end_lsn, 2);
        assert_eq!(
            handler.handle_request(
                1,
                addr(8002),
                PalfRequest::PushLog(push_req(4))
            ),
            Err(PalfError::StaleTerm { local: 5, msg: 4 })
        );
        let mut gap = push_req(5);
        gap.prev_lsn = 4;
        gap.curr_lsn = 5;
        assert!(matches!(
            handler.handle_request(1, addr(8002), PalfRequest::PushLog(gap)),
            Err(PalfError::LogContinuityGap { .. })
        ));
        assert_eq!(env.get_palf_handle(1)?.stat()?.end_lsn, 2);

        let election: ElectionMsg = ElectionPrepareRequestMsg {
            sender: addr(8002),
            ballot: 9,
        }
        .into();
        handler.handle_request(1, addr(8002), PalfRequest::Election(election))
    }

    #[test]
    fn status_query_with_exhausted_resources() -> Result<(), PalfError> {
        let (env, _rx) = env_with_palf(addr(8001));
        let handler = LogRequestHandler::new(&env);
        let req = LogGetMCStReq {
            config_version: ConfigVersion::new(0, 1),
        };

        let resp = handler.handle_sync_request(1, addr(8002), &req)?;
        assert!(resp.is_normal_replica);
        assert_eq!(resp.config_version, ConfigVersion::new(0, 1));

        env.resource_monitor().set_disk_space_enough(false);
        // answered even for a partition that does not exist
        let resp = handler.handle_sync_request(99, addr(8002), &req)?;
        assert!(!resp.is_normal_replica);
        let guard = env.get_palf_handle(1)?;
        assert_eq!(guard.ref_cnt(), 1);
        drop(guard);

        env.resource_monitor().set_disk_space_enough(true);
        env.resource_monitor().set_memory_enough(false);
        let resp = handler.handle_sync_request(1, addr(8002), &req)?;
        assert!(!resp.is_normal_replica);
        Ok(())
    }
}
