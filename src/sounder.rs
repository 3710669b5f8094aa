//! Ringtone playback.
//!
//! The default sounder writes the ringtone next to the data directory and
//! spawns the configured player, killing it when the firing resolves.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audio::AudioFormat;
use crate::config::SounderConfig;
use crate::model::AlarmId;

#[derive(Error, Debug)]
pub enum SounderError {
    #[error("failed to write ringtone: {0}")]
    Io(#[from] std::io::Error),

    #[error("no player command configured")]
    NoCommand,
}

#[derive(Debug, Clone)]
pub struct Ringtone {
    pub alarm_id: AlarmId,
    pub bytes: Bytes,
    pub format: AudioFormat,
    pub fallback: bool,
}

#[async_trait]
pub trait Sounder: Send + Sync {
    async fn start(&self, ringtone: &Ringtone) -> Result<(), SounderError>;

    async fn stop(&self, alarm_id: AlarmId);
}

pub struct CommandSounder {
    dir: PathBuf,
    command: Vec<String>,
    playing: Mutex<HashMap<AlarmId, Child>>,
}

impl CommandSounder {
    pub fn new(dir: PathBuf, config: &SounderConfig) -> Self {
        Self {
            dir,
            command: config.command.clone(),
            playing: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, ringtone: &Ringtone) -> PathBuf {
        self.dir
            .join(format!("ringing-{}.{}", ringtone.alarm_id, ringtone.format.extension()))
    }
}

#[async_trait]
impl Sounder for CommandSounder {
    async fn start(&self, ringtone: &Ringtone) -> Result<(), SounderError> {
        let (program, args) = self.command.split_first().ok_or(SounderError::NoCommand)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(ringtone);
        tokio::fs::write(&path, &ringtone.bytes).await?;

        let child = Command::new(program)
            .args(args)
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        info!(
            "Ringing alarm {} via {program} ({})",
            ringtone.alarm_id,
            if ringtone.fallback { "fallback tone" } else { "generated audio" }
        );
        if let Some(previous) = self.playing.lock().await.insert(ringtone.alarm_id, child) {
            debug!("Replaced a running player for alarm {}", ringtone.alarm_id);
            drop(previous);
        }
        Ok(())
    }

    async fn stop(&self, alarm_id: AlarmId) {
        let Some(mut child) = self.playing.lock().await.remove(&alarm_id) else {
            return;
        };
        if let Err(e) = child.kill().await {
            warn!("Failed to stop player for alarm {alarm_id}: {e}");
        }
        let path = self.dir.join(format!("ringing-{alarm_id}"));
        for ext in ["wav", "mp3", "ogg", "flac", "m4a"] {
            let _ = tokio::fs::remove_file(path.with_extension(ext)).await;
        }
        debug!("Stopped ringing alarm {alarm_id}");
    }
}

/// Logs instead of playing; used when the sounder is disabled.
pub struct SilentSounder;

#[async_trait]
impl Sounder for SilentSounder {
    async fn start(&self, ringtone: &Ringtone) -> Result<(), SounderError> {
        info!(
            "Alarm {} ringing silently ({} bytes of {:?})",
            ringtone.alarm_id,
            ringtone.bytes.len(),
            ringtone.format
        );
        Ok(())
    }

    async fn stop(&self, alarm_id: AlarmId) {
        debug!("Silent ring for alarm {alarm_id} stopped");
    }
}
