use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use comms::msg::{
    CommandBatch, EditCommand, Event, ModelSettingsUpdate, Scope, SettingsPatch, StateSnapshot,
};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use rand::{SeedableRng, rngs::StdRng};
use tokio::{
    sync::{Semaphore, watch},
    task,
};

use crate::{
    camera::RenderCam,
    dataset::Dataset,
    device,
    error::{Result, ServerErr},
    model::{self, MAX_SH_DEGREE, StoreHandle},
    outbox::Outbox,
    render::{RawEncoder, RenderLoop, SyntheticRasterizer},
    scheduler::Balancer,
    settings::Settings,
    trainer::{SyntheticStep, TrainLoop, TrainMetrics},
};

/// The server coordinator: owns every piece of shared state and turns
/// inbound command batches into state changes and outbound events.
///
/// Clones are handles to the same server. Commands come in two kinds:
/// immediate ones applied inline on the connection task, and
/// long-running ones spawned behind a single admission permit so only
/// one heavy operation mutates the world at a time.
#[derive(Clone)]
pub struct Controller {
    settings: Arc<RwLock<Settings>>,
    store: StoreHandle,
    dataset: Arc<RwLock<Option<Dataset>>>,
    camera: Arc<Mutex<RenderCam>>,
    metrics: Arc<Mutex<TrainMetrics>>,
    balancer: Arc<Balancer>,
    outbox: Outbox,
    busy: Arc<Semaphore>,
    train_enabled: watch::Sender<bool>,
    render_enabled: watch::Sender<bool>,
    model_ready: watch::Sender<bool>,
    debug: Arc<AtomicBool>,
    token: Arc<str>,
}

impl Controller {
    pub fn new(token: &str) -> Self {
        Self {
            settings: Arc::new(RwLock::new(Settings::default())),
            store: StoreHandle::default(),
            dataset: Arc::new(RwLock::new(None)),
            camera: Arc::new(Mutex::new(RenderCam::default())),
            metrics: Arc::new(Mutex::new(TrainMetrics::default())),
            balancer: Arc::new(Balancer::new(0.5)),
            outbox: Outbox::new(),
            busy: Arc::new(Semaphore::new(1)),
            train_enabled: watch::Sender::new(false),
            render_enabled: watch::Sender::new(false),
            model_ready: watch::Sender::new(false),
            debug: Arc::new(AtomicBool::new(false)),
            token: token.into(),
        }
    }

    /// Spawns the training and render session tasks. Called once at
    /// startup; both tasks live for the whole process.
    pub fn spawn_sessions(&self) {
        let train = TrainLoop {
            store: self.store.clone(),
            dataset: Arc::clone(&self.dataset),
            settings: Arc::clone(&self.settings),
            metrics: Arc::clone(&self.metrics),
            enabled: self.train_enabled.subscribe(),
            pause: self.train_enabled.clone(),
            balancer: Arc::clone(&self.balancer),
            outbox: self.outbox.clone(),
            debug: Arc::clone(&self.debug),
            step: Box::new(SyntheticStep::new(rand::random())),
        };
        tokio::spawn(train.run());

        let render = RenderLoop::new(
            self.store.clone(),
            Arc::clone(&self.camera),
            self.render_enabled.subscribe(),
            self.model_ready.subscribe(),
            Arc::clone(&self.balancer),
            self.outbox.clone(),
            Box::new(SyntheticRasterizer::new(rand::random())),
            Box::new(RawEncoder),
        );
        tokio::spawn(render.run());
    }

    pub fn authorize(&self, token: &str) -> bool {
        *self.token == *token
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// True while no long-running command holds the admission permit.
    pub fn is_idle(&self) -> bool {
        self.busy.available_permits() > 0
    }

    /// Runs the connect sequence: rendering resumes for the new client
    /// and the full state is returned for the mandatory first push.
    pub fn on_connect(&self) -> StateSnapshot {
        info!("client connected");
        self.render_enabled.send_replace(true);
        self.snapshot()
    }

    /// Suspends rendering; training keeps running unattended.
    pub fn on_disconnect(&self) {
        info!("client disconnected");
        self.render_enabled.send_replace(false);
    }

    /// The full server state as pushed after connect and after every
    /// completed long-running command.
    pub fn snapshot(&self) -> StateSnapshot {
        let settings = self.settings.read();
        StateSnapshot {
            settings: settings.to_patch(),
            debug: self.debug.load(Ordering::Relaxed),
            dataset_loaded: self.dataset.read().is_some(),
            num_units: self.store.read().len(),
            trainer: self.metrics.lock().progress(settings.iterations),
            renderer: self
                .camera
                .lock()
                .state(*self.render_enabled.borrow(), self.balancer.balance()),
        }
    }

    /// Handles one inbound batch. Every recognized tag is processed
    /// independently; a rejected tag never blocks its siblings.
    pub fn dispatch(&self, batch: CommandBatch) {
        debug!("dispatching {batch:?}");

        if let Some(patch) = batch.initialize_dataset {
            let this = self.clone();
            self.spawn_guarded(Scope::Dataset, async move {
                this.initialize_dataset(patch).await
            });
        }

        if let Some(patch) = batch.update_trainer_settings {
            let this = self.clone();
            self.spawn_guarded(Scope::Trainer, async move {
                this.update_trainer_settings(patch).await
            });
        }

        if let Some(update) = batch.update_model_settings {
            let this = self.clone();
            self.spawn_guarded(Scope::Model, async move {
                this.update_model_settings(update).await
            });
        }

        if let Some(edit) = batch.edit {
            let this = self.clone();
            self.spawn_guarded(Scope::Model, async move { this.edit(edit).await });
        }

        if let Some(path) = batch.load_model {
            let this = self.clone();
            self.spawn_guarded(Scope::Model, async move { this.load_model(path).await });
        }

        if let Some(path) = batch.save_model {
            let this = self.clone();
            self.spawn_guarded(Scope::Model, async move { this.save_model(path).await });
        }

        if batch.training_start == Some(true) {
            if self.dataset.read().is_none() {
                self.outbox.error(Scope::Trainer, ServerErr::MissingDataset);
            } else {
                self.train_enabled.send_replace(true);
            }
        }

        if batch.training_pause == Some(true) {
            self.train_enabled.send_replace(false);
        }

        if let Some(update) = batch.update_renderer_settings {
            self.camera.lock().apply_settings(&update);
            self.balancer.set_balance(update.balance);
            self.render_enabled.send_replace(update.renderer_enabled);
        }

        if let Some(mv) = batch.camera_move {
            // pointless while the preview is off, and the arcball state
            // should not drift invisibly
            if *self.render_enabled.borrow() {
                self.camera.lock().process_move(&mv);
            }
        }

        if let Some(debug) = batch.debug {
            self.debug.store(debug, Ordering::Relaxed);
        }
    }

    /// Spawns a long-running command behind the admission permit.
    ///
    /// A second long-running command while one is in flight is refused
    /// immediately with a busy error instead of queueing. Handlers
    /// hand back their completion events instead of pushing them: the
    /// permit is released first, so a client reacting to a completion
    /// push is never spuriously refused as busy.
    pub(crate) fn spawn_guarded<F>(&self, scope: Scope, command: F)
    where
        F: Future<Output = Result<Vec<Event>>> + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.busy).try_acquire_owned() else {
            self.outbox.error(scope, ServerErr::Busy);
            return;
        };

        let outbox = self.outbox.clone();
        tokio::spawn(async move {
            let result = command.await;
            drop(permit);

            match result {
                Ok(events) => {
                    for event in events {
                        outbox.event(event);
                    }
                }
                Err(err) => outbox.error(scope, &err),
            }
        });
    }

    /// Validates and loads a dataset, bootstrapping a fresh model from
    /// its seed cloud when none exists yet.
    ///
    /// Probe-before-commit: settings and the dataset slot are only
    /// touched after the load fully succeeded.
    async fn initialize_dataset(&self, patch: SettingsPatch) -> Result<Vec<Event>> {
        self.train_enabled.send_replace(false);

        let mut staged = self.settings.read().clone();
        staged.apply_patch(&patch)?;

        self.outbox.notice(Scope::Dataset, "Loading dataset...");
        let dataset = task::block_in_place(|| Dataset::load(&staged))?;
        let num_cameras = dataset.num_cameras;

        if !self.store.read().is_initialized() {
            self.store
                .mutate(|store| store.create_from_seed(dataset.seed_points(), dataset.seed_colors()))
                .await;
        }

        *self.settings.write() = staged;
        *self.dataset.write() = Some(dataset);
        *self.metrics.lock() = TrainMetrics::default();
        self.model_ready.send_replace(true);

        Ok(vec![
            notice(Scope::Dataset, format!("Dataset loaded, {num_cameras} cameras")),
            Event::Snapshot(self.snapshot()),
        ])
    }

    async fn update_trainer_settings(&self, patch: SettingsPatch) -> Result<Vec<Event>> {
        self.settings.write().apply_patch(&patch)?;

        // learning-rate schedules changed under the optimizer
        self.store.mutate(|store| store.rebuild_accumulators()).await;
        Ok(vec![notice(Scope::Trainer, "Trainer settings updated")])
    }

    async fn update_model_settings(&self, update: ModelSettingsUpdate) -> Result<Vec<Event>> {
        device::probe(&update.device)?;
        if !(0..=MAX_SH_DEGREE).contains(&update.sh_degree) {
            return Err(ServerErr::InvalidShDegree {
                sh_degree: update.sh_degree,
            });
        }

        {
            let mut settings = self.settings.write();
            settings.device = update.device;
            settings.sh_degree = update.sh_degree;
        }
        self.store.mutate(|store| store.rebuild_accumulators()).await;
        Ok(vec![notice(Scope::Model, "Model settings updated")])
    }

    async fn edit(&self, edit: EditCommand) -> Result<Vec<Event>> {
        let message = match edit {
            EditCommand::AddPoints {
                count,
                distribution,
                frame,
            } => {
                let added = self
                    .store
                    .mutate(move |store| {
                        let mut rng = StdRng::from_os_rng();
                        store.add_points(count, distribution, frame, &mut rng)
                    })
                    .await?;
                format!("Added {added} units")
            }
            EditCommand::RemovePoints { region, invert } => {
                let removed = self
                    .store
                    .mutate(move |store| store.remove_points(region, invert))
                    .await?;
                format!("Removed {removed} units")
            }
        };

        Ok(vec![notice(Scope::Model, message)])
    }

    async fn load_model(&self, path: String) -> Result<Vec<Event>> {
        let loaded = task::block_in_place(|| model::io::load(&path))?;
        let num_units = loaded.len();

        self.store.mutate(move |store| store.replace(loaded)).await;
        *self.metrics.lock() = TrainMetrics::default();
        self.model_ready.send_replace(true);

        Ok(vec![
            notice(Scope::Model, format!("Loaded {num_units} units from {path}")),
            Event::Snapshot(self.snapshot()),
        ])
    }

    async fn save_model(&self, path: String) -> Result<Vec<Event>> {
        self.store
            .inspect(|store| model::io::save(store, &path))
            .await?;
        Ok(vec![notice(Scope::Model, format!("Saved model to {path}"))])
    }
}

fn notice(scope: Scope, message: impl ToString) -> Event {
    Event::Notice {
        scope,
        message: message.to_string(),
    }
}
