use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::{FileLocation, PeerRecord, PeerSummary};
use crate::network::ControlHandle;
use crate::utils::{P2PError, Result};

#[derive(Debug, Clone)]
struct Publication {
    hostname: String,
    size: Option<u64>,
}

#[derive(Debug, Default)]
struct RegistryState {
    peers: HashMap<String, PeerRecord>,
    /// filename -> publishers, in publish order; the first one is the origin
    files: BTreeMap<String, Vec<Publication>>,
}

impl RegistryState {
    /// Drops every publish entry of `hostname`, removing emptied filenames.
    fn purge_host(&mut self, hostname: &str) -> usize {
        let mut purged = 0;
        self.files.retain(|_, publishers| {
            let before = publishers.len();
            publishers.retain(|p| p.hostname != hostname);
            purged += before - publishers.len();
            !publishers.is_empty()
        });
        purged
    }

    fn remove_peer(&mut self, hostname: &str) -> Option<PeerRecord> {
        let record = self.peers.remove(hostname)?;
        let purged = self.purge_host(hostname);
        info!(
            "Peer '{}' deregistered ({} publish entries removed, {} peers left)",
            hostname,
            purged,
            self.peers.len()
        );
        Some(record)
    }
}

/// Where every file lives. The only shared mutable state of the tracker.
///
/// Both tables sit behind one lock, so a reader never observes a filename
/// listing a host that has already been removed from the peer table.
#[derive(Debug, Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `hostname`, replacing any previous record for it.
    ///
    /// A replaced record loses its publish entries; it is returned so the
    /// caller can close its connection.
    pub async fn register(
        &self,
        hostname: &str,
        address: IpAddr,
        transfer_port: u16,
        control: Arc<ControlHandle>,
    ) -> Option<PeerRecord> {
        let record = PeerRecord::new(hostname.to_string(), address, transfer_port, control);
        let mut state = self.state.write().await;

        let replaced = state.peers.insert(hostname.to_string(), record);
        if replaced.is_some() {
            state.purge_host(hostname);
            info!("Peer '{}' re-registered at {}:{}", hostname, address, transfer_port);
        } else {
            info!(
                "Peer '{}' registered at {}:{} ({} peers)",
                hostname,
                address,
                transfer_port,
                state.peers.len()
            );
        }
        replaced
    }

    /// Removes `hostname` and all of its publish entries. Idempotent.
    pub async fn deregister(&self, hostname: &str) -> Option<PeerRecord> {
        self.state.write().await.remove_peer(hostname)
    }

    /// Like [`Registry::deregister`], but only if the current record still
    /// belongs to the given control connection.
    pub async fn deregister_connection(
        &self,
        hostname: &str,
        connection_id: Uuid,
    ) -> Option<PeerRecord> {
        let mut state = self.state.write().await;
        let owned = state
            .peers
            .get(hostname)
            .map(|record| record.connection_id() == connection_id);
        match owned {
            Some(true) => state.remove_peer(hostname),
            Some(false) => {
                debug!(
                    "Skipping deregistration of '{}': registration now owned by another connection",
                    hostname
                );
                None
            }
            None => None,
        }
    }

    pub async fn publish(&self, hostname: &str, filename: &str, size: Option<u64>) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.peers.contains_key(hostname) {
            return Err(P2PError::NotRegistered);
        }

        let publishers = state.files.entry(filename.to_string()).or_default();
        match publishers.iter_mut().find(|p| p.hostname == hostname) {
            Some(existing) => {
                existing.size = size.or(existing.size);
                debug!("File '{}' re-published by '{}'", filename, hostname);
            }
            None => {
                publishers.push(Publication {
                    hostname: hostname.to_string(),
                    size,
                });
                info!(
                    "File '{}' published by '{}' ({} publishers)",
                    filename,
                    hostname,
                    publishers.len()
                );
            }
        }
        Ok(())
    }

    /// Returns whether an entry was removed.
    pub async fn unpublish(&self, hostname: &str, filename: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(publishers) = state.files.get_mut(filename) else {
            return false;
        };

        let before = publishers.len();
        publishers.retain(|p| p.hostname != hostname);
        let removed = publishers.len() != before;
        if publishers.is_empty() {
            state.files.remove(filename);
        }
        if removed {
            info!("File '{}' unpublished by '{}'", filename, hostname);
        }
        removed
    }

    pub async fn lookup(&self, filename: &str) -> Vec<FileLocation> {
        let state = self.state.read().await;
        let Some(publishers) = state.files.get(filename) else {
            return Vec::new();
        };

        publishers
            .iter()
            .enumerate()
            .filter_map(|(index, publication)| {
                state
                    .peers
                    .get(&publication.hostname)
                    .map(|peer| FileLocation {
                        hostname: peer.hostname.clone(),
                        address: peer.address,
                        transfer_port: peer.transfer_port,
                        size: publication.size,
                        origin: index == 0,
                    })
            })
            .collect()
    }

    pub async fn peer_info(&self, hostname: &str) -> Option<PeerRecord> {
        self.state.read().await.peers.get(hostname).cloned()
    }

    /// All registered peers, sorted by hostname.
    pub async fn all_peers(&self) -> Vec<PeerSummary> {
        let state = self.state.read().await;
        let mut peers: Vec<PeerSummary> = state.peers.values().map(PeerRecord::summary).collect();
        peers.sort();
        peers
    }

    /// filename -> publishing hostnames, origin first.
    pub async fn all_files(&self) -> BTreeMap<String, Vec<String>> {
        let state = self.state.read().await;
        state
            .files
            .iter()
            .map(|(filename, publishers)| {
                let hosts = publishers.iter().map(|p| p.hostname.clone()).collect();
                (filename.clone(), hosts)
            })
            .collect()
    }

    /// Filenames published by `hostname` paired with whether it is their
    /// origin, or `None` if the host is not registered.
    pub async fn files_of(&self, hostname: &str) -> Option<Vec<(String, bool)>> {
        let state = self.state.read().await;
        if !state.peers.contains_key(hostname) {
            return None;
        }

        Some(
            state
                .files
                .iter()
                .filter_map(|(filename, publishers)| {
                    publishers
                        .iter()
                        .position(|p| p.hostname == hostname)
                        .map(|index| (filename.clone(), index == 0))
                })
                .collect(),
        )
    }

    pub async fn peer_count(&self) -> usize {
        self.state.read().await.peers.len()
    }

    pub async fn file_count(&self) -> usize {
        self.state.read().await.files.len()
    }

    /// Empties the registry, handing back the removed records.
    pub async fn clear(&self) -> Vec<PeerRecord> {
        let mut state = self.state.write().await;
        state.files.clear();
        state.peers.drain().map(|(_, record)| record).collect()
    }
}
