mod cardio;
mod day;
mod helpers;
mod meal;
mod profile;
mod protocol;
mod strength;
mod sync;
mod user;

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::config::Config;
use crate::postgrest::HttpRemote;
use fitstat_core::clock::SystemClock;
use fitstat_core::db::LocalStore;
use fitstat_core::engine::SyncEngine;
use fitstat_core::monitor::{SignalReceiver, signal_channel};
use fitstat_core::remote::RemoteClient;
use fitstat_core::service::FitstatService;
use fitstat_core::tracker::{ChangeTracker, FileMarker};

pub(crate) use cardio::{cmd_cardio_list, cmd_cardio_log};
pub(crate) use day::{cmd_day_history, cmd_day_log, cmd_day_show};
pub(crate) use meal::{cmd_meal_add, cmd_meal_list, cmd_meal_update};
pub(crate) use profile::{ProfileArgs, cmd_profile_set, cmd_profile_show};
pub(crate) use protocol::{
    PhaseArgs, RoutineArgs, cmd_phase_add, cmd_phase_list, cmd_routine_add, cmd_routine_list,
};
pub(crate) use strength::{StrengthArgs, cmd_strength_list, cmd_strength_log, cmd_strength_reps};
pub(crate) use sync::{WatchArgs, cmd_status, cmd_sync, cmd_watch};
pub(crate) use user::{cmd_user_clear, cmd_user_set, cmd_user_show};

/// The sync engine wired to this machine's stores. Local edits go through
/// [`App::service`]; the remote is only touched by `sync` and `watch`.
pub(crate) struct App {
    pub engine: Arc<SyncEngine>,
    pub signals: SignalReceiver,
    pub remote_url: Option<String>,
}

impl App {
    pub(crate) fn open(config: &Config) -> Result<Self> {
        let store = LocalStore::open(&config.db_path)?;
        let (tx, rx) = signal_channel();
        let tracker = ChangeTracker::new(
            Box::new(FileMarker::new(config.marker_path.clone())),
            tx.clone(),
        );
        let remote = match &config.remote_url {
            Some(url) => RemoteClient::new(Arc::new(HttpRemote::new(
                url,
                config.client_api_key()?,
            )?)),
            None => RemoteClient::disconnected(),
        };
        let engine = SyncEngine::new(
            Arc::new(Mutex::new(store)),
            remote,
            tracker,
            Arc::new(SystemClock),
            tx,
        )?;
        if let Some(user) = &config.user_override {
            engine.set_user(Some(user.clone()));
        }
        Ok(App {
            engine: Arc::new(engine),
            signals: rx,
            remote_url: config.remote_url.clone(),
        })
    }

    /// Service for the signed-in user.
    pub(crate) fn service(&self) -> Result<FitstatService> {
        let user = self
            .engine
            .user_id()
            .context("No user signed in. Run `fitstat user set <id>` or set FITSTAT_USER")?;
        Ok(FitstatService::for_engine(&self.engine, user))
    }
}
