//! Per-channel activity statistics.
//!
//! Counters per (server, channel), flushed to
//! `<server>_<channel>.stats.json` every five minutes and on shutdown.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::events::{Event, EventKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub messages: u64,
    pub actions: u64,
    pub joins: u64,
    pub parts: u64,
    pub kicks: u64,
    pub topic_changes: u64,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

pub struct StatsStore {
    dir: PathBuf,
    entries: DashMap<(String, String), ChannelStats>,
    dirty: DashMap<(String, String), ()>,
}

/// Channel names contain characters filesystems dislike.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

impl StatsStore {
    pub fn new(dir: &Path) -> StatsStore {
        StatsStore {
            dir: dir.to_path_buf(),
            entries: DashMap::new(),
            dirty: DashMap::new(),
        }
    }

    fn file_for(&self, server: &str, channel: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{}.stats.json", sanitize(server), sanitize(channel)))
    }

    fn bump(&self, server: &str, channel: &str, f: impl FnOnce(&mut ChannelStats)) {
        let key = (server.to_string(), channel.to_ascii_lowercase());
        let file = self.file_for(&key.0, &key.1);
        let mut entry = self.entries.entry(key.clone()).or_insert_with(|| {
            // Continue existing counters across restarts.
            std::fs::read(&file)
                .ok()
                .and_then(|raw| serde_json::from_slice(&raw).ok())
                .unwrap_or_default()
        });
        f(&mut entry);
        entry.last_activity = Some(Utc::now());
        drop(entry);
        self.dirty.insert(key, ());
    }

    pub fn observe(&self, event: &Event) {
        let server = &event.server_id;
        match &event.kind {
            EventKind::ChannelMessage {
                channel, action, ..
            } => self.bump(server, channel, |s| {
                if *action {
                    s.actions += 1;
                } else {
                    s.messages += 1;
                }
            }),
            EventKind::UserJoined { channel, .. } => {
                self.bump(server, channel, |s| s.joins += 1)
            }
            EventKind::UserParted { channel, .. } => {
                self.bump(server, channel, |s| s.parts += 1)
            }
            EventKind::UserKicked { channel, .. } => {
                self.bump(server, channel, |s| s.kicks += 1)
            }
            EventKind::TopicChanged { channel, .. } => {
                self.bump(server, channel, |s| s.topic_changes += 1)
            }
            _ => {}
        }
    }

    /// Write out every dirty entry. Returns how many files were written.
    pub fn flush(&self) -> usize {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "cannot create stats dir");
            return 0;
        }
        let keys: Vec<(String, String)> = self.dirty.iter().map(|e| e.key().clone()).collect();
        let mut written = 0;
        for key in keys {
            let Some(stats) = self.entries.get(&key).map(|e| e.clone()) else {
                continue;
            };
            let path = self.file_for(&key.0, &key.1);
            match serde_json::to_vec_pretty(&stats) {
                Ok(raw) => match std::fs::write(&path, raw) {
                    Ok(()) => {
                        self.dirty.remove(&key);
                        written += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "stats write failed"),
                },
                Err(e) => warn!(error = %e, "stats serialize failed"),
            }
        }
        if written > 0 {
            debug!(written, "channel statistics flushed");
        }
        written
    }
}
