//! Membership contract.
//!
//! The grid consumes membership; it does not run a failure detector. A
//! [`MembershipService`] hands out versioned [`MemberList`] snapshots and a
//! broadcast stream of [`MembershipEvent`]s. [`InMemoryMembership`] is the
//! implementation used by in-process clusters and tests: split-brain is
//! simulated by removing members from each other's views and healed with
//! [`MembershipService::merge_from`].

use std::collections::HashSet;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::node::{Address, Member};

const EVENT_BUFFER: usize = 256;

/// Versioned snapshot of the live members, in join order.
///
/// The first member is the master.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberList {
    pub version: u64,
    pub members: Vec<Member>,
}

impl MemberList {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn master(&self) -> Option<&Address> {
        self.members.first().map(|m| &m.address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.iter().any(|m| &m.address == address)
    }

    /// Member addresses in join order.
    pub fn addresses(&self) -> Vec<Address> {
        self.members.iter().map(|m| m.address.clone()).collect()
    }

    /// Member addresses sorted; the input to partition assignment.
    pub fn sorted_addresses(&self) -> Vec<Address> {
        let mut addrs = self.addresses();
        addrs.sort();
        addrs
    }
}

/// A membership change, tagged with the view version it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    MemberAdded { member: Member, version: u64 },
    MemberRemoved { member: Member, version: u64 },
    MemberSuspected { address: Address, version: u64 },
}

impl MembershipEvent {
    pub fn version(&self) -> u64 {
        match self {
            Self::MemberAdded { version, .. }
            | Self::MemberRemoved { version, .. }
            | Self::MemberSuspected { version, .. } => *version,
        }
    }

    pub fn address(&self) -> &Address {
        match self {
            Self::MemberAdded { member, .. } | Self::MemberRemoved { member, .. } => {
                &member.address
            }
            Self::MemberSuspected { address, .. } => address,
        }
    }
}

/// Source of membership for one member.
pub trait MembershipService: Send + Sync + 'static {
    /// Address of the member this view belongs to.
    fn local_address(&self) -> Address;

    /// Current member list.
    fn member_list(&self) -> MemberList;

    fn is_member(&self, address: &Address) -> bool {
        self.member_list().contains(address)
    }

    /// True if the address is a member but currently suspected.
    fn is_suspected(&self, address: &Address) -> bool;

    /// Subscribes to changes made after this call.
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;

    /// Reconciles this view with the member list of the cluster being
    /// merged into. Returns the events the merge produced.
    fn merge_from(&self, target: &MemberList) -> Vec<MembershipEvent>;
}

#[derive(Debug)]
struct ViewState {
    version: u64,
    members: Vec<Member>,
    suspected: HashSet<Address>,
}

/// Membership view held in memory and driven explicitly.
#[derive(Debug)]
pub struct InMemoryMembership {
    local: Member,
    state: RwLock<ViewState>,
    events: broadcast::Sender<MembershipEvent>,
}

impl InMemoryMembership {
    /// A view containing only the local member.
    pub fn new(local: Member) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: RwLock::new(ViewState {
                version: 1,
                members: vec![local.clone()],
                suspected: HashSet::new(),
            }),
            local,
            events,
        }
    }

    /// Adds a member at the end of the join order. Returns false if it was
    /// already present.
    pub fn add_member(&self, member: Member) -> bool {
        let event = {
            let mut state = self.state.write();
            if state.members.iter().any(|m| m.address == member.address) {
                return false;
            }
            state.version += 1;
            state.members.push(member.clone());
            MembershipEvent::MemberAdded {
                member,
                version: state.version,
            }
        };
        info!(member = %event.address(), version = event.version(), "member added");
        self.publish(event);
        true
    }

    /// Removes a member. The local member cannot be removed from its own
    /// view; returns false for it and for unknown addresses.
    pub fn remove_member(&self, address: &Address) -> bool {
        if address == &self.local.address {
            return false;
        }
        let event = {
            let mut state = self.state.write();
            let Some(pos) = state.members.iter().position(|m| &m.address == address) else {
                return false;
            };
            let member = state.members.remove(pos);
            state.suspected.remove(address);
            state.version += 1;
            MembershipEvent::MemberRemoved {
                member,
                version: state.version,
            }
        };
        info!(member = %address, version = event.version(), "member removed");
        self.publish(event);
        true
    }

    /// Marks a member as suspected; with `remove` the suspicion is treated
    /// as confirmed and the member is dropped from the view.
    pub fn suspect_member(&self, address: &Address, remove: bool) -> bool {
        if address == &self.local.address {
            return false;
        }
        let event = {
            let mut state = self.state.write();
            if !state.members.iter().any(|m| &m.address == address) {
                return false;
            }
            state.suspected.insert(address.clone());
            state.version += 1;
            MembershipEvent::MemberSuspected {
                address: address.clone(),
                version: state.version,
            }
        };
        debug!(member = %address, remove, "member suspected");
        self.publish(event);
        if remove {
            self.remove_member(address);
        }
        true
    }

    /// Clears a suspicion without changing membership.
    pub fn clear_suspicion(&self, address: &Address) -> bool {
        self.state.write().suspected.remove(address)
    }

    fn publish(&self, event: MembershipEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

impl MembershipService for InMemoryMembership {
    fn local_address(&self) -> Address {
        self.local.address.clone()
    }

    fn member_list(&self) -> MemberList {
        let state = self.state.read();
        MemberList {
            version: state.version,
            members: state.members.clone(),
        }
    }

    fn is_suspected(&self, address: &Address) -> bool {
        self.state.read().suspected.contains(address)
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn merge_from(&self, target: &MemberList) -> Vec<MembershipEvent> {
        let events = {
            let mut state = self.state.write();
            let mut merged = target.members.clone();
            if !merged.iter().any(|m| m.address == self.local.address) {
                merged.push(self.local.clone());
            }

            let mut version = state.version.max(target.version);
            let mut events = Vec::new();
            for old in &state.members {
                if !merged.iter().any(|m| m.address == old.address) {
                    version += 1;
                    events.push(MembershipEvent::MemberRemoved {
                        member: old.clone(),
                        version,
                    });
                }
            }
            for new in &merged {
                if !state.members.iter().any(|m| m.address == new.address) {
                    version += 1;
                    events.push(MembershipEvent::MemberAdded {
                        member: new.clone(),
                        version,
                    });
                }
            }
            state.version = version + 1;
            state.members = merged;
            state.suspected.clear();
            events
        };
        info!(
            local = %self.local.address,
            changes = events.len(),
            "membership merged"
        );
        for event in &events {
            self.publish(event.clone());
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(host: &str) -> Member {
        Member::new(Address::new(host, 5701), host)
    }

    #[test]
    fn local_member_is_master_of_fresh_view() {
        let view = InMemoryMembership::new(member("a"));
        let list = view.member_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list.master(), Some(&Address::new("a", 5701)));
    }

    #[test]
    fn version_increases_on_every_change() {
        let view = InMemoryMembership::new(member("a"));
        let v0 = view.member_list().version;
        assert!(view.add_member(member("b")));
        let v1 = view.member_list().version;
        assert!(view.remove_member(&Address::new("b", 5701)));
        let v2 = view.member_list().version;
        assert!(v0 < v1 && v1 < v2);
    }

    #[test]
    fn duplicate_add_and_self_remove_are_rejected() {
        let view = InMemoryMembership::new(member("a"));
        assert!(view.add_member(member("b")));
        assert!(!view.add_member(member("b")));
        assert!(!view.remove_member(&Address::new("a", 5701)));
        assert_eq!(view.member_list().len(), 2);
    }

    #[test]
    fn suspicion_without_removal_keeps_member() {
        let view = InMemoryMembership::new(member("a"));
        view.add_member(member("b"));
        let b = Address::new("b", 5701);
        assert!(view.suspect_member(&b, false));
        assert!(view.is_member(&b));
        assert!(view.is_suspected(&b));
        assert!(view.suspect_member(&b, true));
        assert!(!view.is_member(&b));
        assert!(!view.is_suspected(&b));
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let view = InMemoryMembership::new(member("a"));
        let mut rx = view.subscribe();
        view.add_member(member("b"));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, MembershipEvent::MemberAdded { .. }));
        assert_eq!(event.address(), &Address::new("b", 5701));
    }

    #[test]
    fn merge_adopts_target_list_and_keeps_local() {
        let big = InMemoryMembership::new(member("a"));
        big.add_member(member("b"));
        let lone = InMemoryMembership::new(member("c"));

        let events = lone.merge_from(&big.member_list());
        let list = lone.member_list();
        assert_eq!(list.len(), 3);
        assert_eq!(list.master(), Some(&Address::new("a", 5701)));
        assert_eq!(events.len(), 2);
        assert!(list.version > big.member_list().version);
    }
}
