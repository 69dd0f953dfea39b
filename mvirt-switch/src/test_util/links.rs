//! In-memory `LinkControl`.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, SwitchError};
use crate::iface::{InterfaceDescriptor, InterfaceType, LinkControl};
use crate::mac::MacAddr;

#[derive(Default)]
struct State {
    interfaces: Vec<InterfaceDescriptor>,
    peers: HashMap<String, String>,
    members: HashSet<(String, String)>,
    /// Successful creates left before every create fails
    create_budget: Option<usize>,
}

/// Host interface table kept in memory, with call counters.
#[derive(Default)]
pub struct FakeLinks {
    state: Mutex<State>,
    set_flags_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    bridge_add_calls: AtomicUsize,
}

fn not_found(op: &str, name: &str) -> SwitchError {
    SwitchError::syscall(format!("{op} {name}"), io::Error::from_raw_os_error(libc::ENODEV))
}

impl FakeLinks {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, name: &str, if_type: InterfaceType, flags: u32) {
        let mut desc = InterfaceDescriptor::new(name, if_type, flags);
        desc.mac = Some(MacAddr::random());
        self.state().interfaces.push(desc);
    }

    pub fn flags_of(&self, name: &str) -> Option<u32> {
        self.state().interfaces.iter().find(|i| i.name == name).map(|i| i.flags)
    }

    pub fn interfaces_len(&self) -> usize {
        self.state().interfaces.len()
    }

    pub fn peer_of(&self, name: &str) -> Option<String> {
        self.state().peers.get(name).cloned()
    }

    pub fn is_member(&self, bridge: &str, member: &str) -> bool {
        self.state()
            .members
            .contains(&(bridge.to_string(), member.to_string()))
    }

    /// Simulate a member falling out of its bridge.
    pub fn drop_member(&self, bridge: &str, member: &str) {
        self.state()
            .members
            .remove(&(bridge.to_string(), member.to_string()));
    }

    /// Let `n` more creates succeed, then fail all further ones.
    pub fn fail_create_after(&self, n: usize) {
        self.state().create_budget = Some(n);
    }

    pub fn set_flags_calls(&self) -> usize {
        self.set_flags_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn bridge_add_calls(&self) -> usize {
        self.bridge_add_calls.load(Ordering::SeqCst)
    }
}

impl LinkControl for FakeLinks {
    fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>> {
        Ok(self.state().interfaces.clone())
    }

    fn flags(&self, name: &str) -> Result<u32> {
        self.flags_of(name).ok_or_else(|| not_found("SIOCGIFFLAGS", name))
    }

    fn set_flags(&self, name: &str, flags: u32) -> Result<()> {
        self.set_flags_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        let iface = state
            .interfaces
            .iter_mut()
            .find(|i| i.name == name)
            .ok_or_else(|| not_found("SIOCSIFFLAGS", name))?;
        iface.flags = flags;
        Ok(())
    }

    fn create_virtual_peer(&self, name: &str, peer: Option<&str>) -> Result<()> {
        let mut state = self.state();
        if let Some(budget) = state.create_budget.as_mut() {
            if *budget == 0 {
                return Err(SwitchError::syscall(
                    format!("create {name}"),
                    io::Error::from_raw_os_error(libc::EPERM),
                ));
            }
            *budget -= 1;
        }
        if state.interfaces.iter().any(|i| i.name == name) {
            return Err(SwitchError::syscall(
                format!("create {name}"),
                io::Error::from_raw_os_error(libc::EEXIST),
            ));
        }

        let mut desc = InterfaceDescriptor::new(name, InterfaceType::Ethernet, 0);
        desc.mac = Some(MacAddr::random());
        state.interfaces.push(desc);
        if let Some(peer) = peer {
            state.peers.insert(name.to_string(), peer.to_string());
            state.peers.insert(peer.to_string(), name.to_string());
        }
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        let before = state.interfaces.len();
        state.interfaces.retain(|i| i.name != name);
        if state.interfaces.len() == before {
            return Err(not_found("destroy", name));
        }
        if let Some(peer) = state.peers.remove(name) {
            state.peers.remove(&peer);
        }
        state.members.retain(|(b, m)| b != name && m != name);
        Ok(())
    }

    fn has_bridge_member(&self, bridge: &str, member: &str) -> Result<bool> {
        let state = self.state();
        if !state.interfaces.iter().any(|i| i.name == bridge) {
            return Err(not_found("bridge", bridge));
        }
        Ok(state
            .members
            .contains(&(bridge.to_string(), member.to_string())))
    }

    fn bridge_add(&self, bridge: &str, member: &str) -> Result<()> {
        self.bridge_add_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if !state.interfaces.iter().any(|i| i.name == member) {
            return Err(not_found("bridge add", member));
        }
        state.members.insert((bridge.to_string(), member.to_string()));
        Ok(())
    }
}
