//! In-process cluster for tests: several `PalfEnv`s whose outbound messages
//! are routed to each other through `LogRequestHandler`, in FIFO order.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::dispatch::LogRequestHandler;
use crate::env::{PalfEnv, PalfHandleGuard};
use crate::palf::{MembershipConfig, PalfId};
use crate::storage::LogStorage;
use crate::transport::{OutboundMsg, OutboxReceiver};
use crate::utils::PalfError;

/// Upper bound on deliveries per `run_until_quiet()`; a protocol that keeps
/// chattering past it is considered livelocked.
const MAX_DELIVERIES: usize = 100_000;

/// Decides whether a message `(src, msg)` gets lost in transit.
pub(crate) type DropFilter = Box<dyn Fn(SocketAddr, &OutboundMsg) -> bool>;

/// Record of one routed message and the receiver's outcome.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub(crate) src: SocketAddr,
    pub(crate) msg: OutboundMsg,
    pub(crate) result: Result<(), PalfError>,
}

struct TestNode {
    env: PalfEnv,
    rx: OutboxReceiver,
}

pub(crate) struct TestCluster {
    nodes: Vec<TestNode>,
    in_flight: VecDeque<(SocketAddr, OutboundMsg)>,
    drop_filter: Option<DropFilter>,
    delivered: Vec<Delivery>,
}

impl TestCluster {
    /// Address of the `idx`-th node.
    pub(crate) fn addr(idx: usize) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000 + idx as u16))
    }

    /// Cluster of `num` nodes with default configs.
    pub(crate) fn new(num: usize) -> Self {
        Self::with_configs(&vec![None; num])
    }

    /// Cluster with one node per given (optional) TOML config string.
    pub(crate) fn with_configs(configs: &[Option<&str>]) -> Self {
        let nodes = configs
            .iter()
            .enumerate()
            .map(|(idx, config_str)| {
                let (env, rx) =
                    PalfEnv::new_and_setup(Self::addr(idx), *config_str)
                        .expect("env set up");
                TestNode { env, rx }
            })
            .collect();
        TestCluster {
            nodes,
            in_flight: VecDeque::new(),
            drop_filter: None,
            delivered: Vec::new(),
        }
    }

    pub(crate) fn env(&self, idx: usize) -> &PalfEnv {
        &self.nodes[idx].env
    }

    /// Guard over the partition on the `idx`-th node.
    pub(crate) fn handle(
        &self,
        idx: usize,
        palf_id: PalfId,
    ) -> PalfHandleGuard {
        self.env(idx)
            .get_palf_handle(palf_id)
            .expect("partition exists")
    }

    /// Creates the partition on every node in `on`, voting members being the
    /// nodes in `members`.
    pub(crate) fn create_palf(
        &self,
        palf_id: PalfId,
        members: &[usize],
        on: &[usize],
    ) {
        for &idx in on {
            self.env(idx)
                .create_palf_handle(palf_id, Self::config_of(members))
                .expect("partition created");
        }
    }

    /// Creates the partition on one node on top of the given storage.
    pub(crate) fn create_palf_with_storage(
        &self,
        idx: usize,
        palf_id: PalfId,
        members: &[usize],
        storage: Box<dyn LogStorage>,
    ) {
        self.env(idx)
            .create_palf_handle_with_storage(
                palf_id,
                Self::config_of(members),
                storage,
            )
            .expect("partition created");
    }

    fn config_of(members: &[usize]) -> MembershipConfig {
        MembershipConfig::new(members.iter().map(|&m| Self::addr(m)).collect())
    }

    pub(crate) fn set_drop_filter(
        &mut self,
        filter: impl Fn(SocketAddr, &OutboundMsg) -> bool + 'static,
    ) {
        self.drop_filter = Some(Box::new(filter));
    }

    pub(crate) fn clear_drop_filter(&mut self) {
        self.drop_filter = None;
    }

    /// Every message routed so far.
    pub(crate) fn delivered(&self) -> &[Delivery] {
        &self.delivered
    }

    /// Moves everything queued in the nodes' outboxes into the network.
    fn collect(&mut self) {
        for node in self.nodes.iter_mut() {
            let src = node.env.me();
            for msg in node.rx.drain() {
                self.in_flight.push_back((src, msg));
            }
        }
    }

    /// Hands one message to its destination's dispatcher.
    pub(crate) fn deliver(
        &self,
        src: SocketAddr,
        msg: &OutboundMsg,
    ) -> Result<(), PalfError> {
        let Some(node) = self.nodes.iter().find(|n| n.env.me() == msg.dst)
        else {
            return Err(PalfError::msg(format!("no node at {}", msg.dst)));
        };
        LogRequestHandler::new(&node.env).handle_request(
            msg.palf_id,
            src,
            msg.req.clone(),
        )
    }

    /// Routes messages until no node has anything more to say. Returns the
    /// number of messages delivered.
    pub(crate) fn run_until_quiet(&mut self) -> usize {
        let mut num_delivered = 0;
        loop {
            self.collect();
            let Some((src, msg)) = self.in_flight.pop_front() else {
                return num_delivered;
            };
            if self.drop_filter.as_ref().is_some_and(|f| f(src, &msg)) {
                continue;
            }

            let result = self.deliver(src, &msg);
            self.delivered.push(Delivery { src, msg, result });
            num_delivered += 1;
            assert!(
                num_delivered < MAX_DELIVERIES,
                "cluster never went quiet"
            );
        }
    }
}

#[cfg(test)]
mod cluster_tests {
    use super::*;
    use crate::palf::{
        ConfigVersion, LogGetMCStReq, LogInfo, LogPushResp, PalfRequest,
        PushLogType, RegisterReturn, Role,
    };
    use crate::storage::MemLogStorage;

    const PALF_ID: PalfId = 1;

    fn addr(idx: usize) -> SocketAddr {
        TestCluster::addr(idx)
    }

    /// Protocol bugs surface as `Internal`; every other negative outcome is
    /// routine while messages race.
    fn assert_no_internal_errors(cluster: &TestCluster) {
        for d in cluster.delivered() {
            assert!(
                !matches!(d.result, Err(PalfError::Internal(_))),
                "{} -> {}: {} failed with {:?}",
                d.src,
                d.msg.dst,
                d.msg.req.name(),
                d.result
            );
        }
    }

    /// Cluster of `num` nodes where nodes 0..3 vote, with node 0 elected and
    /// reconfirmed as leader.
    fn cluster_with_leader(num: usize) -> TestCluster {
        let mut cluster = TestCluster::new(num);
        let all: Vec<usize> = (0..num).collect();
        cluster.create_palf(PALF_ID, &[0, 1, 2], &all);
        cluster
            .handle(0, PALF_ID)
            .election_campaign()
            .expect("campaign started");
        cluster.run_until_quiet();
        assert_eq!(
            cluster.handle(0, PALF_ID).stat().expect("stat").role,
            Role::Leader
        );
        cluster
    }

    #[test]
    fn elect_replicate_and_commit() -> Result<(), PalfError> {
        let mut cluster = cluster_with_leader(3);
        for idx in 1..3 {
            let stat = cluster.handle(idx, PALF_ID).stat()?;
            assert_eq!(stat.role, Role::Follower);
            assert_eq!(stat.leader, Some(addr(0)));
            assert_eq!(stat.proposal_id, 1);
            assert_eq!(stat.mode_meta.proposal_id, 1);
        }

        let leader = cluster.handle(0, PALF_ID);
        assert_eq!(leader.submit_log(b"a".to_vec())?, 1);
        assert_eq!(leader.submit_log(b"b".to_vec())?, 2);
        assert_eq!(leader.submit_log(b"c".to_vec())?, 3);
        drop(leader);
        cluster.run_until_quiet();

        for idx in 0..3 {
            let stat = cluster.handle(idx, PALF_ID).stat()?;
            assert_eq!(stat.end_lsn, 4);
            assert_eq!(stat.committed_end_lsn, 4);
        }
        let entry = cluster.handle(2, PALF_ID).get_entry(2)?;
        assert_eq!(entry.map(|e| e.data), Some(b"b".to_vec()));
        assert_eq!(
            cluster.handle(1, PALF_ID).submit_log(b"x".to_vec()),
            Err(PalfError::NotLeader)
        );
        assert_no_internal_errors(&cluster);
        Ok(())
    }

    #[test]
    fn lost_push_recovered_by_fetch() -> Result<(), PalfError> {
        let mut cluster = cluster_with_leader(3);
        cluster.set_drop_filter(|_, msg| {
            msg.dst == addr(2)
                && matches!(
                    &msg.req,
                    PalfRequest::PushLog(push)
                        if push.push_log_type == PushLogType::PushLog
                            && push.curr_lsn == 1
                )
        });

        cluster.handle(0, PALF_ID).submit_log(b"a".to_vec())?;
        cluster.run_until_quiet();
        cluster.handle(0, PALF_ID).submit_log(b"b".to_vec())?;
        cluster.run_until_quiet();

        assert!(cluster.delivered().iter().any(|d| d.src == addr(2)
            && matches!(&d.msg.req, PalfRequest::FetchLog(f) if f.lsn == 1)));
        for idx in 0..3 {
            let stat = cluster.handle(idx, PALF_ID).stat()?;
            assert_eq!(stat.end_lsn, 3);
            assert_eq!(stat.committed_end_lsn, 3);
        }
        assert_no_internal_errors(&cluster);
        Ok(())
    }

    #[test]
    fn handover_fences_old_term() -> Result<(), PalfError> {
        let mut cluster = cluster_with_leader(3);
        cluster.handle(0, PALF_ID).submit_log(b"a".to_vec())?;
        cluster.run_until_quiet();
        let stale_push = cluster
            .delivered()
            .iter()
            .find(|d| {
                d.msg.dst == addr(2)
                    && matches!(d.msg.req, PalfRequest::PushLog(_))
            })
            .map(|d| (d.src, d.msg.clone()))
            .expect("push to node 2 recorded");

        cluster.handle(0, PALF_ID).change_leader_to(addr(1))?;
        cluster.run_until_quiet();
        let stat = cluster.handle(1, PALF_ID).stat()?;
        assert_eq!(stat.role, Role::Leader);
        assert_eq!(stat.proposal_id, 2);
        let stat = cluster.handle(0, PALF_ID).stat()?;
        assert_eq!(stat.role, Role::Follower);
        assert_eq!(stat.leader, Some(addr(1)));
        assert_eq!(
            cluster.handle(0, PALF_ID).submit_log(b"x".to_vec()),
            Err(PalfError::NotLeader)
        );

        // a delayed push from the old term changes nothing
        let tail = cluster.handle(2, PALF_ID).stat()?.tail;
        assert_eq!(
            cluster.deliver(stale_push.0, &stale_push.1),
            Err(PalfError::StaleTerm { local: 2, msg: 1 })
        );
        assert_eq!(cluster.handle(2, PALF_ID).stat()?.tail, tail);

        cluster.handle(1, PALF_ID).submit_log(b"b".to_vec())?;
        cluster.run_until_quiet();
        for idx in 0..3 {
            let stat = cluster.handle(idx, PALF_ID).stat()?;
            assert_eq!(stat.end_lsn, 3);
            assert_eq!(stat.committed_end_lsn, 3);
            assert_eq!(stat.tail, LogInfo::new(2, 2));
        }
        assert_no_internal_errors(&cluster);
        Ok(())
    }

    #[test]
    fn lost_restamp_on_committed_follower() -> Result<(), PalfError> {
        let mut cluster = cluster_with_leader(3);

        // node 2 appends a, b, c but never learns they are committed
        cluster.set_drop_filter(|_, msg| {
            msg.dst == addr(2)
                && matches!(msg.req, PalfRequest::CommittedInfo(_))
        });
        for data in [b"a", b"b", b"c"] {
            cluster.handle(0, PALF_ID).submit_log(data.to_vec())?;
        }
        cluster.run_until_quiet();
        assert_eq!(cluster.handle(1, PALF_ID).stat()?.committed_end_lsn, 4);
        assert_eq!(cluster.handle(2, PALF_ID).stat()?.committed_end_lsn, 1);

        // node 0 goes away; node 2's re-stamped re-pushes to node 1 get lost
        cluster.set_drop_filter(|src, msg| {
            src == addr(0)
                || msg.dst == addr(0)
                || (src == addr(2)
                    && msg.dst == addr(1)
                    && matches!(
                        &msg.req,
                        PalfRequest::PushLog(push) if push.curr_lsn < 4
                    ))
        });
        cluster.handle(2, PALF_ID).election_campaign()?;
        cluster.run_until_quiet();
        let stat = cluster.handle(2, PALF_ID).stat()?;
        assert_eq!(stat.role, Role::Leader);
        assert_eq!(stat.proposal_id, 2);
        assert_eq!(stat.tail, LogInfo::new(3, 2));

        let mark = cluster.delivered().len();
        assert_eq!(cluster.handle(2, PALF_ID).submit_log(b"d".to_vec())?, 4);
        cluster.run_until_quiet();
        for idx in 1..3 {
            let stat = cluster.handle(idx, PALF_ID).stat()?;
            assert_eq!(stat.end_lsn, 5);
            assert_eq!(stat.committed_end_lsn, 5);
            assert_eq!(stat.tail, LogInfo::new(4, 2));
        }
        let entry = cluster.handle(1, PALF_ID).get_entry(1)?;
        assert_eq!(
            entry.map(|e| (e.proposal_id, e.data)),
            Some((1, b"a".to_vec()))
        );
        assert!(cluster.delivered()[mark..]
            .iter()
            .filter(|d| d.msg.dst == addr(1))
            .all(|d| d.result.is_ok()));
        assert_no_internal_errors(&cluster);
        Ok(())
    }

    #[test]
    fn config_change_on_old_majority() -> Result<(), PalfError> {
        let mut cluster = cluster_with_leader(3);

        // node 2 never hears about its removal; nodes 0 and 1 suffice
        cluster.set_drop_filter(|_, msg| msg.dst == addr(2));
        let removed = cluster.handle(0, PALF_ID).remove_member(addr(2))?;
        assert_eq!(removed, ConfigVersion::new(1, 2));
        cluster.run_until_quiet();
        cluster.clear_drop_filter();
        assert_eq!(
            cluster.handle(1, PALF_ID).stat()?.config.members,
            vec![addr(0), addr(1)]
        );
        let old_meta = cluster
            .delivered()
            .iter()
            .find(|d| {
                d.msg.dst == addr(1)
                    && matches!(d.msg.req, PalfRequest::ChangeConfigMeta(_))
            })
            .map(|d| (d.src, d.msg.clone()))
            .expect("config meta to node 1 recorded");

        // committed: a new change is accepted right away
        let added = cluster.handle(0, PALF_ID).add_member(addr(2))?;
        assert_eq!(added, ConfigVersion::new(1, 3));
        cluster.run_until_quiet();
        for idx in 0..3 {
            let stat = cluster.handle(idx, PALF_ID).stat()?;
            assert_eq!(stat.config_version, ConfigVersion::new(1, 3));
            assert_eq!(stat.config.members, vec![addr(0), addr(1), addr(2)]);
        }

        assert_eq!(
            cluster.deliver(old_meta.0, &old_meta.1),
            Err(PalfError::StaleConfig {
                local: ConfigVersion::new(1, 3),
                msg: ConfigVersion::new(1, 2),
            })
        );

        cluster.handle(0, PALF_ID).submit_log(b"a".to_vec())?;
        cluster.run_until_quiet();
        for idx in 0..3 {
            assert_eq!(cluster.handle(idx, PALF_ID).stat()?.end_lsn, 2);
        }
        assert_no_internal_errors(&cluster);
        Ok(())
    }

    #[test]
    fn commit_counts_each_entry_config() -> Result<(), PalfError> {
        let mut cluster = cluster_with_leader(4);
        // log acks only arrive when handed over below
        cluster.set_drop_filter(|_, msg| {
            matches!(msg.req, PalfRequest::PushLogResp(_))
        });

        assert_eq!(cluster.handle(0, PALF_ID).submit_log(b"a".to_vec())?, 1);
        cluster.run_until_quiet();
        let added = cluster.handle(0, PALF_ID).add_member(addr(3))?;
        assert_eq!(added, ConfigVersion::new(1, 2));
        cluster.run_until_quiet();
        assert_eq!(
            cluster.handle(0, PALF_ID).stat()?.config.members,
            vec![addr(0), addr(1), addr(2), addr(3)]
        );
        assert_eq!(cluster.handle(0, PALF_ID).submit_log(b"b".to_vec())?, 2);
        cluster.run_until_quiet();

        let leader = cluster.handle(0, PALF_ID);
        assert_eq!(leader.stat()?.committed_end_lsn, 1);
        let versions: Vec<ConfigVersion> = [1, 2]
            .iter()
            .filter_map(|&lsn| leader.get_entry(lsn).ok().flatten())
            .map(|e| e.config_version)
            .collect();
        assert_eq!(
            versions,
            vec![ConfigVersion::new(0, 1), ConfigVersion::new(1, 2)]
        );
        drop(leader);

        let ack = OutboundMsg {
            dst: addr(0),
            palf_id: PALF_ID,
            req: PalfRequest::PushLogResp(LogPushResp {
                msg_proposal_id: 1,
                lsn: 3,
            }),
        };
        // two of {0, 1, 2} commit a; two of {0, 1, 2, 3} do not commit b
        cluster.deliver(addr(1), &ack)?;
        assert_eq!(cluster.handle(0, PALF_ID).stat()?.committed_end_lsn, 2);
        cluster.deliver(addr(2), &ack)?;
        assert_eq!(cluster.handle(0, PALF_ID).stat()?.committed_end_lsn, 3);
        assert_no_internal_errors(&cluster);
        Ok(())
    }

    #[test]
    fn removed_member_cannot_lead() -> Result<(), PalfError> {
        let mut cluster = cluster_with_leader(3);
        cluster.set_drop_filter(|_, msg| msg.dst == addr(2));
        cluster.handle(0, PALF_ID).remove_member(addr(2))?;
        cluster.run_until_quiet();
        assert_eq!(
            cluster.handle(1, PALF_ID).stat()?.config_version,
            ConfigVersion::new(1, 2)
        );
        assert_eq!(
            cluster.handle(2, PALF_ID).stat()?.config_version,
            ConfigVersion::new(0, 1)
        );

        // node 2 still believes it votes and wins node 1's prepare
        cluster.set_drop_filter(|src, msg| {
            src == addr(0) || msg.dst == addr(0)
        });
        cluster.handle(2, PALF_ID).election_campaign()?;
        cluster.run_until_quiet();
        let stat = cluster.handle(2, PALF_ID).stat()?;
        assert_eq!(stat.role, Role::Follower);
        assert_eq!(stat.config_version, ConfigVersion::new(1, 2));
        assert_eq!(stat.config.members, vec![addr(0), addr(1)]);
        assert_eq!(
            cluster.handle(2, PALF_ID).submit_log(b"x".to_vec()),
            Err(PalfError::NotLeader)
        );

        cluster.clear_drop_filter();
        cluster.handle(1, PALF_ID).election_campaign()?;
        cluster.run_until_quiet();
        assert_eq!(cluster.handle(1, PALF_ID).stat()?.role, Role::Leader);
        assert_eq!(cluster.handle(1, PALF_ID).submit_log(b"a".to_vec())?, 1);
        cluster.run_until_quiet();
        for idx in 0..2 {
            let stat = cluster.handle(idx, PALF_ID).stat()?;
            assert_eq!(stat.committed_end_lsn, 2);
            assert_eq!(stat.config.members, vec![addr(0), addr(1)]);
        }
        assert_no_internal_errors(&cluster);
        Ok(())
    }

    #[test]
    fn recycled_log_leads_to_rebuild() -> Result<(), PalfError> {
        let mut cluster = TestCluster::new(3);
        let base = LogInfo::new(10, 1);
        cluster.create_palf_with_storage(
            0,
            PALF_ID,
            &[0, 1, 2],
            Box::new(MemLogStorage::with_base(base)),
        );
        cluster.create_palf(PALF_ID, &[0, 1, 2], &[1, 2]);
        cluster.handle(0, PALF_ID).election_campaign()?;
        cluster.run_until_quiet();
        assert_eq!(cluster.handle(0, PALF_ID).stat()?.proposal_id, 2);

        assert_eq!(cluster.handle(0, PALF_ID).submit_log(b"a".to_vec())?, 11);
        cluster.run_until_quiet();
        for idx in 1..3 {
            let stat = cluster.handle(idx, PALF_ID).stat()?;
            assert_eq!(stat.rebuild_base_lsn, Some(11));
            assert_eq!(stat.end_lsn, 1);
        }
        assert_eq!(cluster.handle(0, PALF_ID).stat()?.committed_end_lsn, 11);

        let status = LogRequestHandler::new(cluster.env(1))
            .handle_sync_request(
                PALF_ID,
                addr(0),
                &LogGetMCStReq {
                    config_version: ConfigVersion::new(0, 1),
                },
            )?;
        assert!(!status.is_normal_replica);

        for idx in 1..3 {
            cluster.handle(idx, PALF_ID).rebuild(11, base)?;
        }
        cluster.run_until_quiet();
        for idx in 0..3 {
            let stat = cluster.handle(idx, PALF_ID).stat()?;
            assert_eq!(stat.base.lsn, 10);
            assert_eq!(stat.end_lsn, 12);
            assert_eq!(stat.committed_end_lsn, 12);
            assert_eq!(stat.rebuild_base_lsn, None);
        }
        assert_no_internal_errors(&cluster);
        Ok(())
    }

    #[test]
    fn learner_retries_with_candidates() -> Result<(), PalfError> {
        let mut configs = vec![None; 7];
        configs[3] = Some("max_learner_children = 2");
        let mut cluster = TestCluster::with_configs(&configs);
        cluster.create_palf(PALF_ID, &[0, 1, 2], &[0, 1, 2, 3, 4, 5, 6]);
        let (p, q, r, l) = (3, 4, 5, 6);

        for child in [q, r, l] {
            cluster.handle(child, PALF_ID).register_parent(addr(p), false)?;
            cluster.run_until_quiet();
        }

        let retry = cluster
            .delivered()
            .iter()
            .find_map(|d| match &d.msg.req {
                PalfRequest::RegisterParentResp(resp)
                    if d.msg.dst == addr(l) =>
                {
                    Some(resp.clone())
                }
                _ => None,
            })
            .expect("P answered L");
        assert_eq!(retry.reg_ret, RegisterReturn::Retry);
        let candidates: Vec<SocketAddr> =
            retry.candidate_list.iter().map(|c| c.server).collect();
        assert_eq!(candidates, vec![addr(q), addr(r)]);

        let p_stat = cluster.handle(p, PALF_ID).stat()?;
        let children: Vec<SocketAddr> =
            p_stat.children.iter().map(|c| c.server).collect();
        assert_eq!(children, vec![addr(q), addr(r)]);
        let l_stat = cluster.handle(l, PALF_ID).stat()?;
        assert_eq!(l_stat.parent.map(|p| p.server), Some(addr(q)));
        assert_eq!(cluster.handle(q, PALF_ID).stat()?.children.len(), 1);
        assert_no_internal_errors(&cluster);
        Ok(())
    }

    #[test]
    fn learner_child_of_leader_follows_log() -> Result<(), PalfError> {
        let mut cluster = cluster_with_leader(4);
        let learner = 3;
        assert_eq!(
            cluster.handle(learner, PALF_ID).election_campaign(),
            Err(PalfError::StateNotMatch("learner cannot campaign".into()))
        );
        cluster
            .handle(learner, PALF_ID)
            .register_parent(addr(0), true)?;
        cluster.run_until_quiet();
        assert_eq!(
            cluster.handle(learner, PALF_ID).stat()?.parent.map(|p| p.server),
            Some(addr(0))
        );

        cluster.handle(0, PALF_ID).submit_log(b"a".to_vec())?;
        cluster.run_until_quiet();
        cluster.handle(0, PALF_ID).submit_log(b"b".to_vec())?;
        cluster.run_until_quiet();
        cluster.handle(0, PALF_ID).submit_log(b"c".to_vec())?;
        cluster.run_until_quiet();

        let stat = cluster.handle(learner, PALF_ID).stat()?;
        assert_eq!(stat.end_lsn, 4);
        assert_eq!(stat.committed_end_lsn, 4);
        assert_eq!(stat.mode_meta.proposal_id, 1);
        // learners never count toward commit
        assert!(!cluster.delivered().iter().any(|d| d.src == addr(learner)
            && matches!(d.msg.req, PalfRequest::PushLogResp(_))));
        assert_no_internal_errors(&cluster);
        Ok(())
    }
}
