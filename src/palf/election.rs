//! PALF -- lease election among voting members.
//!
//! A small two-phase ballot protocol: a campaigner collects prepare promises
//! from a majority, then has a majority accept it as lease owner. Winning the
//! lease only makes a server the *elected* leader; it still has to reconfirm
//! the log (see `leadership`) before serving appends.

use std::fmt;
use std::net::SocketAddr;

use super::*;

use crate::utils::{Bitmap, PalfError};

use serde::{Deserialize, Serialize};

/// Election ballot number; doubles as the minimum proposal ID (epoch) the
/// winner will lead under.
pub type Ballot = u64;

/// Campaigner asking for a promise not to accept smaller ballots.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ElectionPrepareRequestMsg {
    pub sender: SocketAddr,
    pub ballot: Ballot,
}

/// Answer to a prepare; `promised` is the voter's highest promised ballot.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ElectionPrepareResponseMsg {
    pub sender: SocketAddr,
    pub ballot: Ballot,
    pub granted: bool,
    pub promised: Ballot,
}

/// Campaigner asking voters to accept it as lease owner.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ElectionAcceptRequestMsg {
    pub sender: SocketAddr,
    pub ballot: Ballot,
}

/// Answer to an accept request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ElectionAcceptResponseMsg {
    pub sender: SocketAddr,
    pub ballot: Ballot,
    pub accepted: bool,
    pub promised: Ballot,
}

/// Current leader asking `new_leader` to campaign and take over.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ElectionChangeLeaderMsg {
    pub sender: SocketAddr,
    pub ballot: Ballot,
    pub new_leader: SocketAddr,
}

/// Common shape of election messages, letting the dispatcher handle every
/// kind through one generic path.
pub trait ElectionMessage: fmt::Debug + Into<ElectionMsg> {
    /// Message kind name for logging.
    const NAME: &'static str;

    fn sender(&self) -> SocketAddr;

    fn ballot(&self) -> Ballot;

    /// Well-formedness self-check.
    fn is_valid(&self) -> bool;
}

macro_rules! impl_election_message {
    ($msg:ident, $variant:ident) => {
        impl_election_message!($msg, $variant, |_m| true);
    };

    ($msg:ident, $variant:ident, |$m:ident| $extra_check:expr) => {
        impl ElectionMessage for $msg {
            const NAME: &'static str = stringify!($msg);

            #[inline]
            fn sender(&self) -> SocketAddr {
                self.sender
            }

            #[inline]
            fn ballot(&self) -> Ballot {
                self.ballot
            }

            fn is_valid(&self) -> bool {
                let $m = self;
                is_valid_addr(&$m.sender)
                    && $m.ballot != Ballot::MAX
                    && $extra_check
            }
        }

        impl From<$msg> for ElectionMsg {
            fn from(msg: $msg) -> Self {
                ElectionMsg::$variant(msg)
            }
        }
    };
}

impl_election_message!(ElectionPrepareRequestMsg, PrepareRequest);
impl_election_message!(ElectionPrepareResponseMsg, PrepareResponse);
impl_election_message!(ElectionAcceptRequestMsg, AcceptRequest);
impl_election_message!(ElectionAcceptResponseMsg, AcceptResponse);
impl_election_message!(ElectionChangeLeaderMsg, ChangeLeader, |m| {
    is_valid_addr(&m.new_leader)
});

/// Any election message.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ElectionMsg {
    PrepareRequest(ElectionPrepareRequestMsg),
    PrepareResponse(ElectionPrepareResponseMsg),
    AcceptRequest(ElectionAcceptRequestMsg),
    AcceptResponse(ElectionAcceptResponseMsg),
    ChangeLeader(ElectionChangeLeaderMsg),
}

impl ElectionMsg {
    pub fn name(&self) -> &'static str {
        match self {
            ElectionMsg::PrepareRequest(_) => ElectionPrepareRequestMsg::NAME,
            ElectionMsg::PrepareResponse(_) => ElectionPrepareResponseMsg::NAME,
            ElectionMsg::AcceptRequest(_) => ElectionAcceptRequestMsg::NAME,
            ElectionMsg::AcceptResponse(_) => ElectionAcceptResponseMsg::NAME,
            ElectionMsg::ChangeLeader(_) => ElectionChangeLeaderMsg::NAME,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            ElectionMsg::PrepareRequest(m) => m.is_valid(),
            ElectionMsg::PrepareResponse(m) => m.is_valid(),
            ElectionMsg::AcceptRequest(m) => m.is_valid(),
            ElectionMsg::AcceptResponse(m) => m.is_valid(),
            ElectionMsg::ChangeLeader(m) => m.is_valid(),
        }
    }
}

/// Outcome of an election step the owning replica must act upon.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(super) enum ElectionEvent {
    /// I won the lease at this ballot.
    Elected { ballot: Ballot },
    /// Another server won the lease at this ballot.
    LeaderChanged { leader: SocketAddr, ballot: Ballot },
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum CampaignPhase {
    Preparing,
    Accepting,
}

/// My in-progress campaign.
#[derive(Debug, Clone)]
struct Campaign {
    ballot: Ballot,
    phase: CampaignPhase,
    /// Voting members snapshot taken when the campaign started.
    voters: Vec<SocketAddr>,
    acks: Bitmap,
}

impl Campaign {
    fn new(ballot: Ballot, voters: Vec<SocketAddr>) -> Self {
        let acks = Bitmap::new(voters.len(), false);
        Campaign {
            ballot,
            phase: CampaignPhase::Preparing,
            voters,
            acks,
        }
    }

    fn ack(&mut self, voter: &SocketAddr) -> Result<(), PalfError> {
        if let Some(idx) = self.voters.iter().position(|v| v == voter) {
            self.acks.set(idx, true)?;
        }
        Ok(())
    }
}

/// Messages to send plus an optional event, produced by one election step.
pub(super) type ElectionOutput =
    (Vec<(SocketAddr, ElectionMsg)>, Option<ElectionEvent>);

/// Per-stream election state machine.
#[derive(Debug)]
pub(super) struct Election {
    me: SocketAddr,

    /// Highest ballot promised.
    promised: Ballot,

    /// Lease owner I accepted and at which ballot.
    accepted: Option<(Ballot, SocketAddr)>,

    campaign: Option<Campaign>,
}

impl Election {
    pub(super) fn new(me: SocketAddr) -> Self {
        Election {
            me,
            promised: 0,
            accepted: None,
            campaign: None,
        }
    }

    /// Lease owner I currently believe in.
    pub(super) fn lease_owner(&self) -> Option<(Ballot, SocketAddr)> {
        self.accepted
    }

    /// Starts campaigning with a ballot above everything seen so far.
    pub(super) fn campaign(
        &mut self,
        voters: &[SocketAddr],
    ) -> Result<ElectionOutput, PalfError> {
        let Some(ballot) =
            self.promised.checked_add(1).filter(|b| *b != Ballot::MAX)
        else {
            return Err(PalfError::StateNotMatch(format!(
                "ballot space exhausted at {}",
                self.promised
            )));
        };
        self.promised = ballot;
        let mut campaign = Campaign::new(ballot, voters.to_vec());
        campaign.ack(&self.me)?;
        pf_debug!("election campaigning at ballot {}", ballot);

        let msgs: Vec<(SocketAddr, ElectionMsg)> = voters
            .iter()
            .filter(|&&v| v != self.me)
            .map(|&v| {
                (
                    v,
                    ElectionPrepareRequestMsg {
                        sender: self.me,
                        ballot,
                    }
                    .into(),
                )
            })
            .collect();
        self.campaign = Some(campaign);

        let (mut more, event) = self.check_campaign_progress()?;
        let mut out = msgs;
        out.append(&mut more);
        Ok((out, event))
    }

    /// Applies one inbound election message.
    pub(super) fn handle_message(
        &mut self,
        msg: ElectionMsg,
    ) -> Result<ElectionOutput, PalfError> {
        match msg {
            ElectionMsg::PrepareRequest(m) => {
                Ok(self.handle_prepare_request(m))
            }
            ElectionMsg::PrepareResponse(m) => self.handle_prepare_response(m),
            ElectionMsg::AcceptRequest(m) => Ok(self.handle_accept_request(m)),
            ElectionMsg::AcceptResponse(m) => self.handle_accept_response(m),
            // handled by the owning replica
            ElectionMsg::ChangeLeader(_) => Ok((vec![], None)),
        }
    }

    /// Abandons my campaign if `ballot` supersedes it.
    fn observe_ballot(&mut self, ballot: Ballot) {
        if ballot > self.promised {
            self.promised = ballot;
        }
        if self.campaign.as_ref().is_some_and(|c| c.ballot < ballot) {
            pf_debug!("election campaign superseded by ballot {}", ballot);
            self.campaign = None;
        }
    }

    fn handle_prepare_request(
        &mut self,
        msg: ElectionPrepareRequestMsg,
    ) -> ElectionOutput {
        let granted = msg.ballot > self.promised;
        if granted {
            self.observe_ballot(msg.ballot);
        }
        let resp = ElectionPrepareResponseMsg {
            sender: self.me,
            ballot: msg.ballot,
            granted,
            promised: self.promised,
        };
        (vec![(msg.sender, resp.into())], None)
    }

    fn handle_prepare_response(
        &mut self,
        msg: ElectionPrepareResponseMsg,
    ) -> Result<ElectionOutput, PalfError> {
        if !msg.granted {
            self.observe_ballot(msg.promised);
            return Ok((vec![], None));
        }
        match self.campaign.as_mut() {
            Some(c)
                if c.ballot == msg.ballot
                    && c.phase == CampaignPhase::Preparing =>
            {
                c.ack(&msg.sender)?;
            }
            _ => return Ok((vec![], None)), // ignore outdated replies
        }
        self.check_campaign_progress()
    }

    fn handle_accept_request(
        &mut self,
        msg: ElectionAcceptRequestMsg,
    ) -> ElectionOutput {
        let accepted = msg.ballot >= self.promised;
        let mut event = None;
        if accepted {
            self.observe_ballot(msg.ballot);
            if self.accepted != Some((msg.ballot, msg.sender)) {
                self.accepted = Some((msg.ballot, msg.sender));
                event = Some(ElectionEvent::LeaderChanged {
                    leader: msg.sender,
                    ballot: msg.ballot,
                });
            }
        }
        let resp = ElectionAcceptResponseMsg {
            sender: self.me,
            ballot: msg.ballot,
            accepted,
            promised: self.promised,
        };
        (vec![(msg.sender, resp.into())], event)
    }

    fn handle_accept_response(
        &mut self,
        msg: ElectionAcceptResponseMsg,
    ) -> Result<ElectionOutput, PalfError> {
        if !msg.accepted {
            self.observe_ballot(msg.promised);
            return Ok((vec![], None));
        }
        match self.campaign.as_mut() {
            Some(c)
                if c.ballot == msg.ballot
                    && c.phase == CampaignPhase::Accepting =>
            {
                c.ack(&msg.sender)?;
            }
            _ => return Ok((vec![], None)), // ignore outdated replies
        }
        self.check_campaign_progress()
    }

    /// Moves my campaign forward once the current phase has a majority.
    fn check_campaign_progress(&mut self) -> Result<ElectionOutput, PalfError> {
        let Some(c) = self.campaign.as_mut() else {
            return Ok((vec![], None));
        };
        if !c.acks.has_majority() {
            return Ok((vec![], None));
        }

        match c.phase {
            CampaignPhase::Preparing => {
                c.phase = CampaignPhase::Accepting;
                c.acks.clear();
                let ballot = c.ballot;
                let voters = c.voters.clone();
                c.ack(&self.me)?;
                self.accepted = Some((ballot, self.me));
                pf_debug!("election enter accept phase at ballot {}", ballot);

                let msgs: Vec<(SocketAddr, ElectionMsg)> = voters
                    .into_iter()
                    .filter(|&v| v != self.me)
                    .map(|v| {
                        (
                            v,
                            ElectionAcceptRequestMsg {
                                sender: self.me,
                                ballot,
                            }
                            .into(),
                        )
                    })
                    .collect();
                // a single voter wins right away
                let (mut more, event) = self.check_campaign_progress()?;
                let mut out = msgs;
                out.append(&mut more);
                Ok((out, event))
            }
            CampaignPhase::Accepting => {
                let ballot = c.ballot;
                self.campaign = None;
                pf_info!("election won lease at ballot {}", ballot);
                Ok((vec![], Some(ElectionEvent::Elected { ballot })))
            }
        }
    }
}

// PalfReplica election integration
impl PalfReplica {
    /// Handler of any election message.
    pub(super) fn handle_election_message(
        &mut self,
        msg: ElectionMsg,
    ) -> Result<(), PalfError> {
        if !self.is_member() {
            return Ok(()); // learners do not vote
        }
        pf_debug!("palf {} received {} {:?}", self.palf_id, msg.name(), msg);

        if let ElectionMsg::ChangeLeader(m) = &msg {
            if m.new_leader != self.me {
                return Ok(());
            }
            pf_info!(
                "palf {} asked by {} to take over leadership",
                self.palf_id,
                m.sender
            );
            return self.election_campaign();
        }

        let output = self.election.handle_message(msg)?;
        self.apply_election_output(output)
    }

    /// Starts a lease election campaign.
    pub(super) fn election_campaign(&mut self) -> Result<(), PalfError> {
        if !self.is_member() {
            return Err(PalfError::StateNotMatch(
                "learner cannot campaign".into(),
            ));
        }
        let voters = self.config_mgr.curr_config().members.clone();
        let output = self.election.campaign(&voters)?;
        self.apply_election_output(output)
    }

    /// Sends out election messages and reacts to the election event.
    fn apply_election_output(
        &mut self,
        (msgs, event): ElectionOutput,
    ) -> Result<(), PalfError> {
        for (dst, msg) in msgs {
            self.send(dst, PalfRequest::Election(msg))?;
        }
        match event {
            Some(ElectionEvent::Elected { ballot }) => {
                self.begin_reconfirm(ballot)?;
            }
            Some(ElectionEvent::LeaderChanged { leader, ballot }) => {
                pf_debug!(
                    "palf {} lease owner now {} at ballot {}",
                    self.palf_id,
                    leader,
                    ballot
                );
            }
            None => {}
        }
        Ok(())
    }

    /// Asks `dst` to campaign and take over as leader.
    pub(super) fn change_leader_to(
        &mut self,
        dst: SocketAddr,
    ) -> Result<(), PalfError> {
        if !self.is_leader() {
            return Err(PalfError::NotLeader);
        }
        if !self.config_mgr.curr_config().is_member(&dst) {
            return Err(PalfError::invalid(format!("{} is not a member", dst)));
        }
        if dst == self.me {
            return Ok(());
        }
        let ballot = self.election.lease_owner().map_or(0, |(b, _)| b);
        self.send(
            dst,
            PalfRequest::Election(
                ElectionChangeLeaderMsg {
                    sender: self.me,
                    ballot,
                    new_leader: dst,
                }
                .into(),
            ),
        )?;
        pf_info!("palf {} handing leadership over to {}", self.palf_id, dst);
        Ok(())
    }
}
