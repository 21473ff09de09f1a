//! PALF: Paxos-backed append-only log replication core.
//!
//! One `PalfHandleImpl` exists per replicated log stream (partition). It holds
//! the proposal ID (term), the log tail, the committed marker, the membership
//! configuration and the access mode of that stream, and applies inbound
//! protocol messages to them. Submodules split the handling by concern:
//!   - `replication`: push / ack / fetch / committed-info / rebuild
//!   - `election`: lease election (prepare / accept / change-leader)
//!   - `leadership`: log-level prepare (leader reconfirm) and role changes
//!   - `config_mgr`: membership change proposals
//!   - `mode_mgr`: access mode change proposals
//!   - `learner`: learner registration tree

mod config_mgr;
mod election;
mod leadership;
mod learner;
mod mode_mgr;
mod replication;
mod reqs;

pub use election::{
    Ballot, ElectionAcceptRequestMsg, ElectionAcceptResponseMsg,
    ElectionChangeLeaderMsg, ElectionMessage, ElectionMsg,
    ElectionPrepareRequestMsg, ElectionPrepareResponseMsg,
};
pub use reqs::{
    CommittedInfo, FetchLogType, LogChangeConfigMetaReq,
    LogChangeConfigMetaResp, LogChangeModeMetaReq, LogChangeModeMetaResp,
    LogFetchReq, LogGetMCStReq, LogGetMCStResp, LogLearnerReq,
    LogLearnerReqType, LogPrepareReq, LogPrepareResp, LogPushReq, LogPushResp,
    LogRegisterParentReq, LogRegisterParentResp, NotifyRebuildReq,
    PalfRequest, PushLogType, RegisterReturn,
};

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::storage::LogStorage;
use crate::transport::Outbox;
use crate::utils::PalfError;

use config_mgr::ConfigMgr;
use election::Election;
use leadership::ReconfirmState;
use learner::LearnerTree;
use mode_mgr::ModeMgr;
pub(crate) use reqs::is_valid_addr;
use replication::{CatchUp, RebuildInfo};

use get_size::GetSize;

use serde::{Deserialize, Serialize};

use tokio::sync::Notify;

/// Partition (log stream) identifier.
pub type PalfId = i64;

/// Proposal ID (term) type; fences stale leaders.
pub type ProposalId = u64;

/// Log sequence number type. LSNs are dense: each entry takes one position.
pub type Lsn = u64;

pub const INVALID_PROPOSAL_ID: ProposalId = u64::MAX;
pub const LSN_INVALID: Lsn = u64::MAX;

/// LSN of the virtual genesis entry every fresh log starts after.
pub const PALF_INITIAL_LSN: Lsn = 0;

#[inline]
pub fn is_valid_palf_id(id: PalfId) -> bool {
    id >= 0
}

#[inline]
pub fn is_valid_proposal_id(pid: ProposalId) -> bool {
    pid != INVALID_PROPOSAL_ID
}

#[inline]
pub fn is_valid_lsn(lsn: Lsn) -> bool {
    lsn != LSN_INVALID
}

/// Position plus proposal ID of one entry, enough to check log continuity.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize, GetSize,
)]
pub struct LogInfo {
    pub lsn: Lsn,
    pub log_proposal_id: ProposalId,
}

impl LogInfo {
    #[inline]
    pub fn new(lsn: Lsn, log_proposal_id: ProposalId) -> Self {
        LogInfo {
            lsn,
            log_proposal_id,
        }
    }

    /// The virtual entry preceding the first entry of a fresh log.
    #[inline]
    pub fn genesis() -> Self {
        LogInfo::new(PALF_INITIAL_LSN, 0)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        is_valid_lsn(self.lsn) && is_valid_proposal_id(self.log_proposal_id)
    }

    /// Exclusive end LSN if this is the last entry.
    #[inline]
    pub fn end_lsn(&self) -> Lsn {
        self.lsn + 1
    }
}

/// One log entry: payload plus the term and position it was proposed under.
/// Immutable once accepted, except for leader reconfirm re-stamping its
/// proposal ID.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct LogEntry {
    pub lsn: Lsn,
    pub proposal_id: ProposalId,
    /// Membership version in effect when the entry was proposed.
    pub config_version: ConfigVersion,
    pub data: Vec<u8>,
}

impl LogEntry {
    #[inline]
    pub fn log_info(&self) -> LogInfo {
        LogInfo::new(self.lsn, self.proposal_id)
    }
}

/// Membership configuration version, ordered by proposal ID first.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Clone,
    Copy,
    Hash,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct ConfigVersion {
    pub proposal_id: ProposalId,
    pub config_seq: u64,
}

impl ConfigVersion {
    #[inline]
    pub fn new(proposal_id: ProposalId, config_seq: u64) -> Self {
        ConfigVersion {
            proposal_id,
            config_seq,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        is_valid_proposal_id(self.proposal_id)
    }
}

/// A non-voting replica (or any server acting as a learner parent).
#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub struct LogLearner {
    pub server: SocketAddr,
    pub region: String,
}

impl LogLearner {
    pub fn new(server: SocketAddr, region: impl ToString) -> Self {
        LogLearner {
            server,
            region: region.to_string(),
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        is_valid_addr(&self.server) && !self.region.is_empty()
    }
}

/// Ordered voting member set plus the learners attached to the stream.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    pub members: Vec<SocketAddr>,
    pub learners: Vec<LogLearner>,
}

impl MembershipConfig {
    pub fn new(members: Vec<SocketAddr>) -> Self {
        MembershipConfig {
            members,
            learners: Vec::new(),
        }
    }

    /// Non-empty, well-formed, no duplicates, no server both member and
    /// learner.
    pub fn is_valid(&self) -> bool {
        !self.members.is_empty()
            && self.members.iter().all(is_valid_addr)
            && self.learners.iter().all(|l| l.is_valid())
            && self
                .members
                .iter()
                .enumerate()
                .all(|(i, m)| !self.members[..i].contains(m))
            && self
                .learners
                .iter()
                .enumerate()
                .all(|(i, l)| {
                    !self.members.contains(&l.server)
                        && !self.learners[..i]
                            .iter()
                            .any(|o| o.server == l.server)
                })
    }

    #[inline]
    pub fn is_member(&self, server: &SocketAddr) -> bool {
        self.members.contains(server)
    }

    #[inline]
    pub fn member_idx(&self, server: &SocketAddr) -> Option<usize> {
        self.members.iter().position(|m| m == server)
    }

    #[inline]
    pub fn is_learner(&self, server: &SocketAddr) -> bool {
        self.learners.iter().any(|l| &l.server == server)
    }

    /// Smallest number of members forming a majority.
    #[inline]
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

/// Config meta carried by a membership change: the previous and the proposed
/// configuration under a new version.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogConfigMeta {
    pub version: ConfigVersion,
    pub prev: MembershipConfig,
    pub curr: MembershipConfig,
}

impl LogConfigMeta {
    pub fn is_valid(&self) -> bool {
        self.version.is_valid() && self.prev.is_valid() && self.curr.is_valid()
    }
}

/// Write access mode gating which operations are legal.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum AccessMode {
    /// Normal mode: the leader accepts `submit_log`.
    Append,
    /// Restricted: appends come only from an external raw writer.
    RawWrite,
    /// Restricted: log is being flashed back; no appends.
    Flashback,
}

/// Installed access mode, tagged with the proposal ID it was accepted under.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ModeMeta {
    pub proposal_id: ProposalId,
    pub mode_version: u64,
    pub access_mode: AccessMode,
}

impl ModeMeta {
    /// Mode meta every fresh stream starts with.
    pub fn initial() -> Self {
        ModeMeta {
            proposal_id: 0,
            mode_version: 0,
            access_mode: AccessMode::Append,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        is_valid_proposal_id(self.proposal_id)
    }

    /// Ordering key; a meta is newer if this key is larger.
    #[inline]
    pub fn order_key(&self) -> (ProposalId, u64) {
        (self.proposal_id, self.mode_version)
    }
}

/// Replica role within its stream.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Role {
    Follower,
    /// Elected but still reconfirming the log with a majority.
    Candidate,
    Leader,
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct PalfConfig {
    /// Max total bytes served per fetch request.
    pub fetch_log_size_limit: usize,

    /// Max entries served per fetch request.
    pub fetch_log_count_limit: usize,

    /// Max learner children a server accepts.
    pub max_learner_children: usize,

    /// Forward accepted pushes and committed info down to learner children.
    pub enable_learner_fan_out: bool,

    /// Reply "not a normal replica" to member-change status queries when
    /// local disk or memory headroom checks fail.
    pub check_resource_on_status_query: bool,

    /// Region this server lives in; learners prefer same-region parents.
    pub region: String,
}

#[allow(clippy::derivable_impls)]
impl Default for PalfConfig {
    fn default() -> Self {
        PalfConfig {
            fetch_log_size_limit: 2 * 1024 * 1024,
            fetch_log_count_limit: 64,
            max_learner_children: 4,
            enable_learner_fan_out: true,
            check_resource_on_status_query: true,
            region: "default".into(),
        }
    }
}

impl PalfConfig {
    /// Parses config from an optional TOML string over the defaults and
    /// validates it.
    pub fn from_config_str(
        config_str: Option<&str>,
    ) -> Result<Self, PalfError> {
        let config = parsed_config!(config_str => PalfConfig;
                                    fetch_log_size_limit,
                                    fetch_log_count_limit,
                                    max_learner_children,
                                    enable_learner_fan_out,
                                    check_resource_on_status_query,
                                    region)?;
        if config.fetch_log_size_limit == 0 {
            return logged_err!(
                "invalid config.fetch_log_size_limit '{}'",
                config.fetch_log_size_limit
            );
        }
        if config.fetch_log_count_limit == 0 {
            return logged_err!(
                "invalid config.fetch_log_count_limit '{}'",
                config.fetch_log_count_limit
            );
        }
        if config.region.is_empty() {
            return logged_err!("invalid config.region '{}'", config.region);
        }
        Ok(config)
    }
}

/// Per-partition consensus state. All mutation goes through `&mut self`, so
/// the owning `PalfHandleImpl`'s write lock serializes structural changes.
pub(crate) struct PalfReplica {
    /// Stream this replica belongs to.
    palf_id: PalfId,

    /// My server address.
    me: SocketAddr,

    /// Configuration parameters struct.
    config: PalfConfig,

    /// Outbound message channel.
    outbox: Outbox,

    /// Log storage capability.
    storage: Box<dyn LogStorage>,

    /// Current proposal ID (term); never decreases.
    proposal_id: ProposalId,

    role: Role,

    /// Who do I think is the leader under the current proposal ID?
    leader: Option<SocketAddr>,

    /// Exclusive end of the majority-durable prefix; never decreases.
    committed_end_lsn: Lsn,

    /// Leader-side map from member -> acked end LSN under current term.
    match_end_lsn: HashMap<SocketAddr, Lsn>,

    /// Leader reconfirm progress while a Candidate.
    reconfirm: Option<ReconfirmState>,

    /// Outstanding catch-up fetch, if any.
    catch_up: Option<CatchUp>,

    /// Pending rebuild notice from a server that recycled my missing logs.
    rebuild_info: Option<RebuildInfo>,

    /// Lease election state machine.
    election: Election,

    /// Membership configuration manager.
    config_mgr: ConfigMgr,

    /// Access mode manager.
    mode_mgr: ModeMgr,

    /// Learner tree position of this server.
    learner_tree: LearnerTree,
}

// PalfReplica common helpers
impl PalfReplica {
    /// Creates the state of one stream on top of the given storage.
    pub(crate) fn new(
        palf_id: PalfId,
        me: SocketAddr,
        config: PalfConfig,
        outbox: Outbox,
        storage: Box<dyn LogStorage>,
        init_config: MembershipConfig,
    ) -> Result<Self, PalfError> {
        if !is_valid_palf_id(palf_id) {
            return Err(PalfError::invalid(format!("palf_id {}", palf_id)));
        }
        if !init_config.is_valid() {
            return Err(PalfError::invalid(format!(
                "init config {:?}",
                init_config
            )));
        }

        let base = storage.base_info();
        let tail = storage.last_log_info();
        Ok(PalfReplica {
            palf_id,
            me,
            config,
            outbox,
            proposal_id: tail.log_proposal_id,
            role: Role::Follower,
            leader: None,
            committed_end_lsn: base.end_lsn(),
            match_end_lsn: HashMap::new(),
            reconfirm: None,
            catch_up: None,
            rebuild_info: None,
            election: Election::new(me),
            config_mgr: ConfigMgr::new(init_config),
            mode_mgr: ModeMgr::new(),
            learner_tree: LearnerTree::new(),
            storage,
        })
    }

    /// Do I think I am the current active leader?
    #[inline]
    fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Am I a voting member of the current configuration?
    #[inline]
    fn is_member(&self) -> bool {
        self.config_mgr.curr_config().is_member(&self.me)
    }

    /// This server described as a learner-tree node.
    #[inline]
    fn self_learner(&self) -> LogLearner {
        LogLearner::new(self.me, &self.config.region)
    }

    #[inline]
    fn tail(&self) -> LogInfo {
        self.storage.last_log_info()
    }

    #[inline]
    fn end_lsn(&self) -> Lsn {
        self.storage.end_lsn()
    }

    #[inline]
    fn accepted_mode_pid(&self) -> ProposalId {
        self.mode_mgr.meta().proposal_id
    }

    /// Term fencing shared by every mutating message: a strictly smaller
    /// proposal ID is rejected without touching state, a strictly larger one
    /// is adopted (stepping down if needed), an equal one passes.
    fn fence_proposal_id(
        &mut self,
        msg_proposal_id: ProposalId,
        new_leader: Option<SocketAddr>,
    ) -> Result<(), PalfError> {
        if msg_proposal_id < self.proposal_id {
            return Err(PalfError::StaleTerm {
                local: self.proposal_id,
                msg: msg_proposal_id,
            });
        }
        if msg_proposal_id > self.proposal_id {
            self.advance_proposal_id(msg_proposal_id, new_leader);
        }
        Ok(())
    }

    /// Adopts a strictly larger proposal ID, becoming a follower of the given
    /// leader (or of an unknown one).
    fn advance_proposal_id(
        &mut self,
        proposal_id: ProposalId,
        new_leader: Option<SocketAddr>,
    ) {
        debug_assert!(proposal_id > self.proposal_id);
        if self.role != Role::Follower {
            pf_info!(
                "palf {} stepping down from {:?} at pid {} -> {}",
                self.palf_id,
                self.role,
                self.proposal_id,
                proposal_id
            );
        }
        self.proposal_id = proposal_id;
        self.role = Role::Follower;
        self.leader = new_leader;
        self.match_end_lsn.clear();
        self.reconfirm = None;
        self.catch_up = None;
        self.config_mgr.clear_pending();
        self.mode_mgr.clear_pending();
    }

    /// Sends a message to one peer.
    #[inline]
    fn send(&self, dst: SocketAddr, req: PalfRequest) -> Result<(), PalfError> {
        self.outbox.send_msg(dst, self.palf_id, req)
    }

    /// Sends a message to every member of the current configuration (and of
    /// the previous one while a change is in flight), except myself.
    fn bcast_members(&self, req: PalfRequest) -> Result<(), PalfError> {
        self.outbox
            .bcast_msg(&self.config_mgr.all_members(), self.palf_id, req)
    }

    /// Sends a message to my learner children if fan-out is enabled.
    fn bcast_children(&self, req: PalfRequest) -> Result<(), PalfError> {
        if !self.config.enable_learner_fan_out {
            return Ok(());
        }
        self.outbox.bcast_msg(
            self.learner_tree.children().iter().map(|c| &c.server),
            self.palf_id,
            req,
        )
    }
}

/// Read-only status snapshot of one stream.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PalfStat {
    pub palf_id: PalfId,
    pub me: SocketAddr,
    pub role: Role,
    pub leader: Option<SocketAddr>,
    pub proposal_id: ProposalId,
    pub base: LogInfo,
    pub tail: LogInfo,
    pub end_lsn: Lsn,
    pub committed_end_lsn: Lsn,
    pub mode_meta: ModeMeta,
    pub config_version: ConfigVersion,
    pub config: MembershipConfig,
    pub parent: Option<LogLearner>,
    pub children: Vec<LogLearner>,
    pub rebuild_base_lsn: Option<Lsn>,
}

/// Partition consensus handle: the long-lived per-partition object owned by
/// the registry. Only reachable through a `PalfHandleGuard`, whose lifetime
/// is tracked by `ref_cnt` so teardown can wait for in-flight handlers.
pub struct PalfHandleImpl {
    palf_id: PalfId,

    /// Consensus state; writers serialize structural mutations, readers serve
    /// status queries.
    replica: RwLock<PalfReplica>,

    /// Number of outstanding guards.
    ref_cnt: AtomicUsize,

    /// Signalled whenever `ref_cnt` drops to zero.
    drained: Notify,

    /// Set once teardown has started; the state must not be used afterwards.
    destroyed: AtomicBool,
}

impl fmt::Debug for PalfHandleImpl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PalfHandleImpl")
            .field("palf_id", &self.palf_id)
            .field("ref_cnt", &self.ref_cnt.load(Ordering::SeqCst))
            .field("destroyed", &self.destroyed.load(Ordering::SeqCst))
            .finish()
    }
}

// PalfHandleImpl lifecycle and reference counting
impl PalfHandleImpl {
    pub(crate) fn new(replica: PalfReplica) -> Self {
        PalfHandleImpl {
            palf_id: replica.palf_id,
            replica: RwLock::new(replica),
            ref_cnt: AtomicUsize::new(0),
            drained: Notify::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn palf_id(&self) -> PalfId {
        self.palf_id
    }

    /// Number of outstanding guards.
    #[inline]
    pub fn ref_cnt(&self) -> usize {
        self.ref_cnt.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn inc_ref(&self) {
        self.ref_cnt.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn dec_ref(&self) {
        if self.ref_cnt.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Waits until every outstanding guard has been released.
    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // register interest before checking to not miss a wakeup
            notified.as_mut().enable();
            if self.ref_cnt() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Marks the handle destroyed and drops its in-memory log. Callers must
    /// have drained all guards first.
    pub(crate) fn destroy(&self) -> Result<(), PalfError> {
        if self.ref_cnt() != 0 {
            return logged_err!(
                "palf {} destroyed with {} outstanding refs",
                self.palf_id,
                self.ref_cnt()
            );
        }
        self.destroyed.store(true, Ordering::SeqCst);
        let mut replica = self.replica.write()?;
        let base = replica.tail();
        replica.storage.reset_base(base)?;
        replica.role = Role::Follower;
        pf_info!("palf {} destroyed", self.palf_id);
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<PalfReplica>, PalfError> {
        if self.is_destroyed() {
            return Err(PalfError::PartitionNotFound(self.palf_id));
        }
        Ok(self.replica.read()?)
    }

    fn write(&self) -> Result<RwLockWriteGuard<PalfReplica>, PalfError> {
        if self.is_destroyed() {
            return Err(PalfError::PartitionNotFound(self.palf_id));
        }
        Ok(self.replica.write()?)
    }
}

// PalfHandleImpl inbound message operations
impl PalfHandleImpl {
    pub fn receive_log(
        &self,
        server: SocketAddr,
        req: LogPushReq,
    ) -> Result<(), PalfError> {
        self.write()?.receive_log(server, req)
    }

    pub fn ack_log(
        &self,
        server: SocketAddr,
        msg_proposal_id: ProposalId,
        lsn: Lsn,
    ) -> Result<(), PalfError> {
        self.write()?.ack_log(server, msg_proposal_id, lsn)
    }

    pub fn get_log(
        &self,
        server: SocketAddr,
        req: &LogFetchReq,
    ) -> Result<(), PalfError> {
        self.write()?.get_log(server, req)
    }

    pub fn handle_committed_info(
        &self,
        server: SocketAddr,
        msg_proposal_id: ProposalId,
        prev_lsn: Lsn,
        prev_log_proposal_id: ProposalId,
        committed_end_lsn: Lsn,
    ) -> Result<(), PalfError> {
        self.write()?.handle_committed_info(
            server,
            msg_proposal_id,
            prev_lsn,
            prev_log_proposal_id,
            committed_end_lsn,
        )
    }

    pub fn handle_notify_rebuild_req(
        &self,
        server: SocketAddr,
        base_lsn: Lsn,
        base_prev_log_info: LogInfo,
    ) -> Result<(), PalfError> {
        self.write()?
            .handle_notify_rebuild_req(server, base_lsn, base_prev_log_info)
    }

    pub fn handle_prepare_request(
        &self,
        server: SocketAddr,
        log_proposal_id: ProposalId,
    ) -> Result<(), PalfError> {
        self.write()?.handle_prepare_request(server, log_proposal_id)
    }

    pub fn handle_prepare_response(
        &self,
        server: SocketAddr,
        resp: LogPrepareResp,
    ) -> Result<(), PalfError> {
        self.write()?.handle_prepare_response(server, resp)
    }

    pub fn receive_config_log(
        &self,
        server: SocketAddr,
        req: LogChangeConfigMetaReq,
    ) -> Result<(), PalfError> {
        self.write()?.receive_config_log(server, req)
    }

    pub fn ack_config_log(
        &self,
        server: SocketAddr,
        proposal_id: ProposalId,
        config_version: ConfigVersion,
    ) -> Result<(), PalfError> {
        self.write()?
            .ack_config_log(server, proposal_id, config_version)
    }

    pub fn receive_mode_meta(
        &self,
        server: SocketAddr,
        msg_proposal_id: ProposalId,
        meta: ModeMeta,
    ) -> Result<(), PalfError> {
        self.write()?.receive_mode_meta(server, msg_proposal_id, meta)
    }

    pub fn ack_mode_meta(
        &self,
        server: SocketAddr,
        msg_proposal_id: ProposalId,
    ) -> Result<(), PalfError> {
        self.write()?.ack_mode_meta(server, msg_proposal_id)
    }

    pub fn handle_learner_req(
        &self,
        sender: LogLearner,
        req_type: LogLearnerReqType,
    ) -> Result<(), PalfError> {
        self.write()?.handle_learner_req(sender, req_type)
    }

    pub fn handle_register_parent_req(
        &self,
        child: LogLearner,
        is_to_leader: bool,
    ) -> Result<(), PalfError> {
        self.write()?.handle_register_parent_req(child, is_to_leader)
    }

    pub fn handle_register_parent_resp(
        &self,
        parent: LogLearner,
        candidate_list: Vec<LogLearner>,
        reg_ret: RegisterReturn,
    ) -> Result<(), PalfError> {
        self.write()?
            .handle_register_parent_resp(parent, candidate_list, reg_ret)
    }

    pub fn handle_election_message(
        &self,
        msg: ElectionMsg,
    ) -> Result<(), PalfError> {
        self.write()?.handle_election_message(msg)
    }

    /// Read-only: served under the read lock.
    pub fn get_memberchange_status(
        &self,
        server: SocketAddr,
        req: &LogGetMCStReq,
    ) -> Result<LogGetMCStResp, PalfError> {
        Ok(self.read()?.get_memberchange_status(server, req))
    }
}

// PalfHandleImpl locally initiated operations
impl PalfHandleImpl {
    /// Appends a new entry as the leader, returning its LSN.
    pub fn submit_log(&self, data: Vec<u8>) -> Result<Lsn, PalfError> {
        self.write()?.submit_log(data)
    }

    /// Starts a lease election campaign with this server as candidate.
    pub fn election_campaign(&self) -> Result<(), PalfError> {
        self.write()?.election_campaign()
    }

    /// Hands leadership over to the given member.
    pub fn change_leader_to(&self, dst: SocketAddr) -> Result<(), PalfError> {
        self.write()?.change_leader_to(dst)
    }

    /// Proposes a new membership configuration, returning its version.
    pub fn change_config(
        &self,
        new_config: MembershipConfig,
    ) -> Result<ConfigVersion, PalfError> {
        self.write()?.change_config(new_config)
    }

    pub fn add_member(
        &self,
        server: SocketAddr,
    ) -> Result<ConfigVersion, PalfError> {
        self.write()?.add_member(server)
    }

    pub fn remove_member(
        &self,
        server: SocketAddr,
    ) -> Result<ConfigVersion, PalfError> {
        self.write()?.remove_member(server)
    }

    pub fn add_learner(
        &self,
        learner: LogLearner,
    ) -> Result<ConfigVersion, PalfError> {
        self.write()?.add_learner(learner)
    }

    pub fn remove_learner(
        &self,
        server: SocketAddr,
    ) -> Result<ConfigVersion, PalfError> {
        self.write()?.remove_learner(server)
    }

    /// Proposes a new access mode.
    pub fn change_access_mode(
        &self,
        access_mode: AccessMode,
    ) -> Result<(), PalfError> {
        self.write()?.change_access_mode(access_mode)
    }

    /// Installs a new base after a snapshot restore.
    pub fn rebuild(
        &self,
        base_lsn: Lsn,
        base_prev_log_info: LogInfo,
    ) -> Result<(), PalfError> {
        self.write()?.rebuild(base_lsn, base_prev_log_info)
    }

    /// Re-issues the outstanding catch-up fetch from the current tail.
    pub fn retry_catch_up(&self) -> Result<(), PalfError> {
        self.write()?.retry_catch_up()
    }

    /// Starts registering this learner against `target`.
    pub fn register_parent(
        &self,
        target: SocketAddr,
        is_to_leader: bool,
    ) -> Result<(), PalfError> {
        self.write()?.register_parent(target, is_to_leader)
    }

    /// Sends a keepalive to my learner parent, if any.
    pub fn learner_keepalive(&self) -> Result<(), PalfError> {
        self.read()?.learner_keepalive()
    }

    /// Read-only status snapshot.
    pub fn stat(&self) -> Result<PalfStat, PalfError> {
        let r = self.read()?;
        Ok(PalfStat {
            palf_id: r.palf_id,
            me: r.me,
            role: r.role,
            leader: r.leader,
            proposal_id: r.proposal_id,
            base: r.storage.base_info(),
            tail: r.tail(),
            end_lsn: r.end_lsn(),
            committed_end_lsn: r.committed_end_lsn,
            mode_meta: r.mode_mgr.meta().clone(),
            config_version: r.config_mgr.version(),
            config: r.config_mgr.curr_config().clone(),
            parent: r.learner_tree.parent().cloned(),
            children: r.learner_tree.children().to_vec(),
            rebuild_base_lsn: r.rebuild_info.as_ref().map(|i| i.base_lsn),
        })
    }

    /// Copy of the stored entry at `lsn`.
    pub fn get_entry(&self, lsn: Lsn) -> Result<Option<LogEntry>, PalfError> {
        Ok(self.read()?.storage.get_entry(lsn))
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;
    use crate::storage::MemLogStorage;
    use crate::transport::OutboxReceiver;

    pub(crate) fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Builds a standalone replica (no registry) for unit tests.
    pub(crate) fn replica_with(
        me: SocketAddr,
        members: Vec<SocketAddr>,
        base: LogInfo,
    ) -> (PalfReplica, OutboxReceiver) {
        let (outbox, rx) = Outbox::new_pair(me);
        let replica = PalfReplica::new(
            1,
            me,
            PalfConfig::default(),
            outbox,
            Box::new(MemLogStorage::with_base(base)),
            MembershipConfig::new(members),
        )
        .expect("valid replica");
        (replica, rx)
    }

    impl PalfReplica {
        /// Forces a term for tests that start mid-history.
        pub(crate) fn force_proposal_id(
            &mut self,
            proposal_id: ProposalId,
            leader: Option<SocketAddr>,
        ) {
            if proposal_id > self.proposal_id {
                self.advance_proposal_id(proposal_id, leader);
            } else {
                self.leader = leader;
            }
        }

        pub(crate) fn proposal_id(&self) -> ProposalId {
            self.proposal_id
        }

        pub(crate) fn role(&self) -> Role {
            self.role
        }

        pub(crate) fn committed_end(&self) -> Lsn {
            self.committed_end_lsn
        }

        pub(crate) fn tail_info(&self) -> LogInfo {
            self.tail()
        }

        pub(crate) fn mode_pid(&self) -> ProposalId {
            self.accepted_mode_pid()
        }
    }
}
