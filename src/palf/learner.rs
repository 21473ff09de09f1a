//! PALF -- learner registration tree.
//!
//! Learners attach to a parent (the leader, a member, or another learner)
//! which forwards them pushed entries and committed info. Registration starts
//! at a target; a parent that cannot take the child answers `Retry` with a
//! candidate list, which the child walks before falling back to the leader.

use std::collections::VecDeque;
use std::net::SocketAddr;

use super::*;

use crate::utils::PalfError;

use rand::prelude::*;

/// In-flight registration of this learner.
#[derive(Debug, Clone)]
struct Registration {
    /// Fallback target when candidates run out.
    leader: Option<SocketAddr>,
    candidates: VecDeque<LogLearner>,
}

/// This server's position in the learner tree.
#[derive(Debug, Default)]
pub(super) struct LearnerTree {
    parent: Option<LogLearner>,
    children: Vec<LogLearner>,
    registering: Option<Registration>,
}

impl LearnerTree {
    pub(super) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(super) fn parent(&self) -> Option<&LogLearner> {
        self.parent.as_ref()
    }

    #[inline]
    pub(super) fn children(&self) -> &[LogLearner] {
        &self.children
    }

    #[inline]
    fn has_child(&self, server: &SocketAddr) -> bool {
        self.children.iter().any(|c| &c.server == server)
    }
}

// PalfReplica learner tree handling
impl PalfReplica {
    /// Starts registering as a learner against `target`.
    pub(super) fn register_parent(
        &mut self,
        target: SocketAddr,
        is_to_leader: bool,
    ) -> Result<(), PalfError> {
        if self.is_member() {
            return Err(PalfError::StateNotMatch(
                "members do not register parents".into(),
            ));
        }
        self.learner_tree.registering = Some(Registration {
            leader: if is_to_leader { Some(target) } else { self.leader },
            candidates: VecDeque::new(),
        });
        self.send_register_req(target, is_to_leader)
    }

    fn send_register_req(
        &self,
        target: SocketAddr,
        is_to_leader: bool,
    ) -> Result<(), PalfError> {
        self.send(
            target,
            PalfRequest::RegisterParent(LogRegisterParentReq {
                child: self.self_learner(),
                is_to_leader,
            }),
        )?;
        pf_debug!(
            "palf {} sent LogRegisterParentReq -> {} to_leader {}",
            self.palf_id,
            target,
            is_to_leader
        );
        Ok(())
    }

    fn send_register_resp(
        &self,
        child: &LogLearner,
        candidate_list: Vec<LogLearner>,
        reg_ret: RegisterReturn,
    ) -> Result<(), PalfError> {
        self.send(
            child.server,
            PalfRequest::RegisterParentResp(LogRegisterParentResp {
                parent: self.self_learner(),
                candidate_list,
                reg_ret,
            }),
        )
    }

    /// Whether I can take `child` as a new child.
    #[inline]
    fn can_adopt(&self, child: &LogLearner) -> bool {
        self.learner_tree.children.len() < self.config.max_learner_children
            && child.region == self.config.region
    }

    /// Handler of LogRegisterParentReq from a learner.
    pub(super) fn handle_register_parent_req(
        &mut self,
        child: LogLearner,
        is_to_leader: bool,
    ) -> Result<(), PalfError> {
        pf_trace!(
            "palf {} received LogRegisterParentReq <- {:?} to_leader {}",
            self.palf_id,
            child,
            is_to_leader
        );
        if child.server == self.me {
            return Err(PalfError::invalid("registering to myself"));
        }

        if is_to_leader && !self.is_leader() {
            return self.send_register_resp(
                &child,
                vec![],
                RegisterReturn::NotLeader,
            );
        }
        if self.learner_tree.has_child(&child.server) {
            return self.send_register_resp(
                &child,
                vec![],
                RegisterReturn::Done,
            );
        }

        if self.can_adopt(&child) {
            pf_info!(
                "palf {} adopted learner child {}",
                self.palf_id,
                child.server
            );
            self.learner_tree.children.push(child.clone());
            return self.send_register_resp(
                &child,
                vec![],
                RegisterReturn::Done,
            );
        }

        let candidates: Vec<LogLearner> = if is_to_leader {
            // same-region learners and members, in random order
            let config = self.config_mgr.curr_config();
            let mut candidates: Vec<LogLearner> = config
                .learners
                .iter()
                .filter(|l| l.server != child.server)
                .cloned()
                .chain(config.members.iter().map(|&m| {
                    LogLearner::new(m, &self.config.region)
                }))
                .filter(|l| l.server != self.me && l.region == child.region)
                .collect();
            candidates.shuffle(&mut thread_rng());
            candidates
        } else {
            self.learner_tree
                .children
                .iter()
                .filter(|c| c.region == child.region)
                .cloned()
                .collect()
        };
        pf_debug!(
            "palf {} cannot adopt {}, suggesting {} candidates",
            self.palf_id,
            child.server,
            candidates.len()
        );
        self.send_register_resp(&child, candidates, RegisterReturn::Retry)
    }

    /// Handler of LogRegisterParentResp from a would-be parent.
    pub(super) fn handle_register_parent_resp(
        &mut self,
        parent: LogLearner,
        candidate_list: Vec<LogLearner>,
        reg_ret: RegisterReturn,
    ) -> Result<(), PalfError> {
        pf_trace!(
            "palf {} received LogRegisterParentResp <- {} {:?}",
            self.palf_id,
            parent.server,
            reg_ret
        );
        let me = self.me;
        let Some(reg) = self.learner_tree.registering.as_mut() else {
            return Ok(()); // ignore if not registering
        };

        match reg_ret {
            RegisterReturn::Done => {
                pf_info!(
                    "palf {} registered to parent {}",
                    self.palf_id,
                    parent.server
                );
                self.learner_tree.registering = None;
                self.learner_tree.parent = Some(parent);
                Ok(())
            }
            RegisterReturn::NotLeader => {
                pf_warn!(
                    "palf {} registration target {} is not leader",
                    self.palf_id,
                    parent.server
                );
                self.learner_tree.registering = None;
                Err(PalfError::NotLeader)
            }
            RegisterReturn::Retry => {
                if !candidate_list.is_empty() {
                    reg.candidates = candidate_list
                        .into_iter()
                        .filter(|c| c.server != me)
                        .collect();
                }
                if let Some(next) = reg.candidates.pop_front() {
                    self.send_register_req(next.server, false)
                } else if let Some(leader) =
                    reg.leader.filter(|&l| l != parent.server)
                {
                    self.send_register_req(leader, true)
                } else {
                    pf_warn!(
                        "palf {} ran out of registration candidates",
                        self.palf_id
                    );
                    self.learner_tree.registering = None;
                    Ok(())
                }
            }
        }
    }

    /// Handler of LogLearnerReq keepalive / retire messages.
    pub(super) fn handle_learner_req(
        &mut self,
        sender: LogLearner,
        req_type: LogLearnerReqType,
    ) -> Result<(), PalfError> {
        pf_trace!(
            "palf {} received LogLearnerReq <- {} {:?}",
            self.palf_id,
            sender.server,
            req_type
        );
        let is_parent = self
            .learner_tree
            .parent
            .as_ref()
            .is_some_and(|p| p.server == sender.server);

        match req_type {
            LogLearnerReqType::KeepaliveReq => {
                let resp = if self.learner_tree.has_child(&sender.server) {
                    LogLearnerReqType::KeepaliveResp
                } else {
                    LogLearnerReqType::RetireChild
                };
                self.send_learner_req(sender.server, resp)
            }
            LogLearnerReqType::KeepaliveResp => {
                if !is_parent {
                    // someone still thinks I'm its child
                    self.send_learner_req(
                        sender.server,
                        LogLearnerReqType::RetireParent,
                    )?;
                }
                Ok(())
            }
            LogLearnerReqType::RetireParent => {
                self.learner_tree
                    .children
                    .retain(|c| c.server != sender.server);
                Ok(())
            }
            LogLearnerReqType::RetireChild => {
                if !is_parent {
                    return Ok(());
                }
                pf_info!(
                    "palf {} retired by parent {}",
                    self.palf_id,
                    sender.server
                );
                self.learner_tree.parent = None;
                match self.leader {
                    Some(leader) => self.register_parent(leader, true),
                    None => Ok(()),
                }
            }
        }
    }

    fn send_learner_req(
        &self,
        dst: SocketAddr,
        req_type: LogLearnerReqType,
    ) -> Result<(), PalfError> {
        self.send(
            dst,
            PalfRequest::Learner(LogLearnerReq {
                sender: self.self_learner(),
                req_type,
            }),
        )
    }

    /// Sends a keepalive to my parent, if any.
    pub(super) fn learner_keepalive(&self) -> Result<(), PalfError> {
        match self.learner_tree.parent.as_ref() {
            Some(parent) => self.send_learner_req(
                parent.server,
                LogLearnerReqType::KeepaliveReq,
            ),
            None => Ok(()),
        }
    }
}
