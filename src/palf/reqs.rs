//! PALF -- wire-level request and response structures.
//!
//! Every message exposes an `is_valid()` self-check which the dispatcher runs
//! before touching the handle registry.

use std::net::SocketAddr;

use super::*;

use crate::utils::PalfError;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

/// Origin of a pushed log entry.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum PushLogType {
    /// Leader (or learner parent) pushing freshly proposed entries.
    PushLog,
    /// Entry sent back as the answer to a fetch request.
    FetchLogResp,
}

/// Purpose of a fetch request.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum FetchLogType {
    /// Follower or learner catching up a gap.
    Follower,
    /// New leader pulling the most advanced tail reported during prepare.
    LeaderReconfirm,
    /// Requester asks for the server's current mode meta.
    ModeMeta,
}

/// Log push from leader (or learner parent) to a replica.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogPushReq {
    pub push_log_type: PushLogType,
    pub msg_proposal_id: ProposalId,
    pub prev_lsn: Lsn,
    pub prev_log_proposal_id: ProposalId,
    pub curr_lsn: Lsn,
    /// Mode proposal ID the sender has accepted.
    pub accepted_mode_pid: ProposalId,
    /// Proposal ID stamped on the entry itself.
    pub log_proposal_id: ProposalId,
    /// Membership version the entry was proposed under.
    pub config_version: ConfigVersion,
    pub data: Vec<u8>,
}

impl LogPushReq {
    /// Builds a push carrying the given entry, chained after `prev`.
    pub(crate) fn new(
        push_log_type: PushLogType,
        msg_proposal_id: ProposalId,
        prev: LogInfo,
        accepted_mode_pid: ProposalId,
        entry: &LogEntry,
    ) -> Self {
        LogPushReq {
            push_log_type,
            msg_proposal_id,
            prev_lsn: prev.lsn,
            prev_log_proposal_id: prev.log_proposal_id,
            curr_lsn: entry.lsn,
            accepted_mode_pid,
            log_proposal_id: entry.proposal_id,
            config_version: entry.config_version,
            data: entry.data.clone(),
        }
    }

    pub fn is_valid(&self) -> bool {
        is_valid_proposal_id(self.msg_proposal_id)
            && is_valid_lsn(self.prev_lsn)
            && is_valid_proposal_id(self.prev_log_proposal_id)
            && is_valid_lsn(self.curr_lsn)
            && self.curr_lsn == self.prev_lsn + 1
            && is_valid_proposal_id(self.accepted_mode_pid)
            && is_valid_proposal_id(self.log_proposal_id)
            && self.log_proposal_id <= self.msg_proposal_id
            && self.prev_log_proposal_id <= self.log_proposal_id
            && self.config_version.is_valid()
            && !self.data.is_empty()
    }

    /// Prev log info this push claims to follow.
    pub fn prev_log_info(&self) -> LogInfo {
        LogInfo::new(self.prev_lsn, self.prev_log_proposal_id)
    }

    /// The entry carried by this push.
    pub fn to_entry(&self) -> LogEntry {
        LogEntry {
            lsn: self.curr_lsn,
            proposal_id: self.log_proposal_id,
            config_version: self.config_version,
            data: self.data.clone(),
        }
    }
}

/// Ack of a pushed entry, carrying the acker's flushed end LSN.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogPushResp {
    pub msg_proposal_id: ProposalId,
    pub lsn: Lsn,
}

impl LogPushResp {
    pub fn is_valid(&self) -> bool {
        is_valid_proposal_id(self.msg_proposal_id) && is_valid_lsn(self.lsn)
    }
}

/// Tells the receiver the sender can no longer serve logs before `base_lsn`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct NotifyRebuildReq {
    pub base_lsn: Lsn,
    pub base_prev_log_info: LogInfo,
}

impl NotifyRebuildReq {
    pub fn is_valid(&self) -> bool {
        is_valid_lsn(self.base_lsn)
            && self.base_prev_log_info.is_valid()
            && self.base_prev_log_info.lsn + 1 == self.base_lsn
    }
}

/// Leader advisory of the majority-durable end LSN.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CommittedInfo {
    pub msg_proposal_id: ProposalId,
    /// LSN of the entry right before `committed_end_lsn` on the leader.
    pub prev_lsn: Lsn,
    pub prev_log_proposal_id: ProposalId,
    pub committed_end_lsn: Lsn,
}

impl CommittedInfo {
    pub fn is_valid(&self) -> bool {
        is_valid_proposal_id(self.msg_proposal_id)
            && is_valid_lsn(self.prev_lsn)
            && is_valid_proposal_id(self.prev_log_proposal_id)
            && is_valid_lsn(self.committed_end_lsn)
            && self.prev_lsn < self.committed_end_lsn
    }
}

/// Bounded range request for log entries starting at `lsn`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogFetchReq {
    pub fetch_type: FetchLogType,
    pub msg_proposal_id: ProposalId,
    pub prev_lsn: Lsn,
    pub lsn: Lsn,
    pub fetch_log_size: usize,
    pub fetch_log_count: usize,
    pub accepted_mode_pid: ProposalId,
}

impl LogFetchReq {
    pub fn is_valid(&self) -> bool {
        is_valid_proposal_id(self.msg_proposal_id)
            && is_valid_lsn(self.prev_lsn)
            && is_valid_lsn(self.lsn)
            && self.prev_lsn < self.lsn
            && self.fetch_log_size > 0
            && self.fetch_log_count > 0
            && is_valid_proposal_id(self.accepted_mode_pid)
    }
}

/// Log-level prepare sent by a freshly elected leader.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogPrepareReq {
    pub log_proposal_id: ProposalId,
}

impl LogPrepareReq {
    pub fn is_valid(&self) -> bool {
        is_valid_proposal_id(self.log_proposal_id)
    }
}

/// Answer to a log-level prepare, reporting the voter's tail.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogPrepareResp {
    pub msg_proposal_id: ProposalId,
    pub vote_granted: bool,
    /// Proposal ID of the voter's last entry.
    pub log_proposal_id: ProposalId,
    /// Voter's end LSN.
    pub lsn: Lsn,
    pub log_mode_meta: ModeMeta,
    /// Voter's latest accepted config meta.
    pub log_config_meta: LogConfigMeta,
}

impl LogPrepareResp {
    pub fn is_valid(&self) -> bool {
        is_valid_proposal_id(self.msg_proposal_id)
            && is_valid_proposal_id(self.log_proposal_id)
            && is_valid_lsn(self.lsn)
            && self.log_mode_meta.is_valid()
            && self.log_config_meta.is_valid()
    }
}

/// Membership change pushed by the leader.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogChangeConfigMetaReq {
    pub msg_proposal_id: ProposalId,
    pub prev_log_proposal_id: ProposalId,
    pub prev_lsn: Lsn,
    pub prev_mode_pid: ProposalId,
    pub meta: LogConfigMeta,
}

impl LogChangeConfigMetaReq {
    pub fn is_valid(&self) -> bool {
        is_valid_proposal_id(self.msg_proposal_id)
            && is_valid_proposal_id(self.prev_log_proposal_id)
            && is_valid_lsn(self.prev_lsn)
            && is_valid_proposal_id(self.prev_mode_pid)
            && self.meta.is_valid()
    }
}

/// Ack of a membership change.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogChangeConfigMetaResp {
    pub proposal_id: ProposalId,
    pub config_version: ConfigVersion,
}

impl LogChangeConfigMetaResp {
    pub fn is_valid(&self) -> bool {
        is_valid_proposal_id(self.proposal_id) && self.config_version.is_valid()
    }
}

/// Access mode change pushed by the leader.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogChangeModeMetaReq {
    pub msg_proposal_id: ProposalId,
    pub meta: ModeMeta,
}

impl LogChangeModeMetaReq {
    pub fn is_valid(&self) -> bool {
        is_valid_proposal_id(self.msg_proposal_id)
            && self.meta.is_valid()
            && self.meta.proposal_id <= self.msg_proposal_id
    }
}

/// Ack of an access mode change.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogChangeModeMetaResp {
    pub msg_proposal_id: ProposalId,
}

impl LogChangeModeMetaResp {
    pub fn is_valid(&self) -> bool {
        is_valid_proposal_id(self.msg_proposal_id)
    }
}

/// Kinds of learner tree maintenance requests.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum LogLearnerReqType {
    /// Child -> parent: still here.
    KeepaliveReq,
    /// Parent -> child: still serving you.
    KeepaliveResp,
    /// Child -> parent: detaching from you.
    RetireParent,
    /// Parent -> child: no longer serving you, register elsewhere.
    RetireChild,
}

/// Learner tree maintenance request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogLearnerReq {
    pub sender: LogLearner,
    pub req_type: LogLearnerReqType,
}

impl LogLearnerReq {
    pub fn is_valid(&self) -> bool {
        self.sender.is_valid()
    }
}

/// Learner asking to attach to a parent.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogRegisterParentReq {
    pub child: LogLearner,
    pub is_to_leader: bool,
}

impl LogRegisterParentReq {
    pub fn is_valid(&self) -> bool {
        self.child.is_valid()
    }
}

/// Structured registration outcome.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum RegisterReturn {
    /// Parent accepted the child.
    Done,
    /// Parent cannot serve; try the candidate list (or the leader when empty).
    Retry,
    /// Registration sent to the leader reached a non-leader.
    NotLeader,
}

/// Answer to a parent registration.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogRegisterParentResp {
    pub parent: LogLearner,
    pub candidate_list: Vec<LogLearner>,
    pub reg_ret: RegisterReturn,
}

impl LogRegisterParentResp {
    pub fn is_valid(&self) -> bool {
        self.parent.is_valid()
            && self.candidate_list.iter().all(|c| c.is_valid())
    }
}

/// Member-change status query sent before a reconfiguration.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogGetMCStReq {
    /// Config version the querying leader holds.
    pub config_version: ConfigVersion,
}

impl LogGetMCStReq {
    pub fn is_valid(&self) -> bool {
        self.config_version.is_valid()
    }
}

/// Member-change status answer.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogGetMCStResp {
    pub msg_proposal_id: ProposalId,
    pub is_normal_replica: bool,
    pub need_update_config_meta: bool,
    pub config_version: ConfigVersion,
    pub max_flushed_end_lsn: Lsn,
    pub committed_end_lsn: Lsn,
}

impl Default for LogGetMCStResp {
    fn default() -> Self {
        LogGetMCStResp {
            msg_proposal_id: INVALID_PROPOSAL_ID,
            is_normal_replica: true,
            need_update_config_meta: false,
            config_version: ConfigVersion::default(),
            max_flushed_end_lsn: LSN_INVALID,
            committed_end_lsn: LSN_INVALID,
        }
    }
}

/// Closed set of fire-and-forget messages routed through the dispatcher.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PalfRequest {
    PushLog(LogPushReq),
    PushLogResp(LogPushResp),
    NotifyRebuild(NotifyRebuildReq),
    CommittedInfo(CommittedInfo),
    FetchLog(LogFetchReq),
    Prepare(LogPrepareReq),
    PrepareResp(LogPrepareResp),
    ChangeConfigMeta(LogChangeConfigMetaReq),
    ChangeConfigMetaResp(LogChangeConfigMetaResp),
    ChangeModeMeta(LogChangeModeMetaReq),
    ChangeModeMetaResp(LogChangeModeMetaResp),
    Learner(LogLearnerReq),
    RegisterParent(LogRegisterParentReq),
    RegisterParentResp(LogRegisterParentResp),
    Election(ElectionMsg),
}

impl PalfRequest {
    /// Message kind name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            PalfRequest::PushLog(_) => "LogPushReq",
            PalfRequest::PushLogResp(_) => "LogPushResp",
            PalfRequest::NotifyRebuild(_) => "NotifyRebuildReq",
            PalfRequest::CommittedInfo(_) => "CommittedInfo",
            PalfRequest::FetchLog(_) => "LogFetchReq",
            PalfRequest::Prepare(_) => "LogPrepareReq",
            PalfRequest::PrepareResp(_) => "LogPrepareResp",
            PalfRequest::ChangeConfigMeta(_) => "LogChangeConfigMetaReq",
            PalfRequest::ChangeConfigMetaResp(_) => "LogChangeConfigMetaResp",
            PalfRequest::ChangeModeMeta(_) => "LogChangeModeMetaReq",
            PalfRequest::ChangeModeMetaResp(_) => "LogChangeModeMetaResp",
            PalfRequest::Learner(_) => "LogLearnerReq",
            PalfRequest::RegisterParent(_) => "LogRegisterParentReq",
            PalfRequest::RegisterParentResp(_) => "LogRegisterParentResp",
            PalfRequest::Election(msg) => msg.name(),
        }
    }

    /// Serializes the message into MessagePack bytes.
    pub fn encode(&self) -> Result<Vec<u8>, PalfError> {
        Ok(encode_to_vec(self)?)
    }

    /// Deserializes a message from MessagePack bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, PalfError> {
        Ok(decode_from_slice(bytes)?)
    }
}

/// The unspecified address or port 0 can never identify a peer.
#[inline]
pub(crate) fn is_valid_addr(addr: &SocketAddr) -> bool {
    !addr.ip().is_unspecified() && addr.port() != 0
}

#[cfg(test)]
mod reqs_tests {
    use super::*;

    fn push_req() -> LogPushReq {
        LogPushReq {
            push_log_type: PushLogType::PushLog,
            msg_proposal_id: 5,
            prev_lsn: 100,
            prev_log_proposal_id: 5,
            curr_lsn: 101,
            accepted_mode_pid: 1,
            log_proposal_id: 5,
            config_version: ConfigVersion::new(1, 1),
            data: b"abc".to_vec(),
        }
    }

    #[test]
    fn push_validity() {
        assert!(push_req().is_valid());

        let mut req = push_req();
        req.data.clear();
        assert!(!req.is_valid());

        let mut req = push_req();
        req.curr_lsn = 150;
        assert!(!req.is_valid());

        let mut req = push_req();
        req.log_proposal_id = 6;
        assert!(!req.is_valid());

        let mut req = push_req();
        req.msg_proposal_id = INVALID_PROPOSAL_ID;
        assert!(!req.is_valid());
    }

    #[test]
    fn fetch_and_committed_validity() {
        let fetch = LogFetchReq {
            fetch_type: FetchLogType::Follower,
            msg_proposal_id: 3,
            prev_lsn: 9,
            lsn: 10,
            fetch_log_size: 1024,
            fetch_log_count: 8,
            accepted_mode_pid: 1,
        };
        assert!(fetch.is_valid());
        assert!(!LogFetchReq {
            fetch_log_count: 0,
            ..fetch.clone()
        }
        .is_valid());

        let info = CommittedInfo {
            msg_proposal_id: 3,
            prev_lsn: 9,
            prev_log_proposal_id: 3,
            committed_end_lsn: 10,
        };
        assert!(info.is_valid());
        assert!(!CommittedInfo {
            committed_end_lsn: 9,
            ..info
        }
        .is_valid());
    }

    #[test]
    fn learner_validity() {
        let bad = LogLearner::new("0.0.0.0:0".parse().unwrap(), "z1");
        assert!(!LogRegisterParentReq {
            child: bad,
            is_to_leader: true
        }
        .is_valid());
        let good = LogLearner::new("127.0.0.1:7001".parse().unwrap(), "z1");
        assert!(LogRegisterParentReq {
            child: good,
            is_to_leader: true
        }
        .is_valid());
    }

    #[test]
    fn request_codec() -> Result<(), PalfError> {
        let req = PalfRequest::PushLog(push_req());
        let bytes = req.encode()?;
        assert_eq!(PalfRequest::decode(&bytes)?, req);
        assert!(PalfRequest::decode(&bytes[..bytes.len() / 2]).is_err());
        Ok(())
    }
}
