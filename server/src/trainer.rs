use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use comms::msg::{Event, Scope, TrainProgress};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::{sync::watch, task, time};

use crate::{
    dataset::Dataset,
    error::Result,
    model::{GaussianStore, StoreHandle},
    outbox::Outbox,
    scheduler::{Balancer, Loop},
    settings::Settings,
};

/// Progress events are pushed every this many iterations.
const REPORT_EVERY: u64 = 50;

/// EMA smoothing for the reported loss.
const LOSS_ALPHA: f32 = 0.4;

/// EMA smoothing for the reported step time.
const TIME_ALPHA: f32 = 0.2;

/// Counters shared with the coordinator for state snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainMetrics {
    pub iteration: u64,
    pub last_loss: f32,
    pub ema_loss: f32,
    pub update_time: f32,
}

impl TrainMetrics {
    pub fn progress(&self, max_iteration: u64) -> TrainProgress {
        TrainProgress {
            iteration: self.iteration,
            max_iteration,
            loss: self.last_loss,
            ema_loss: self.ema_loss,
            update_time: self.update_time,
        }
    }

    fn observe(&mut self, loss: f32, elapsed: Duration) {
        self.iteration += 1;
        self.last_loss = loss;
        self.ema_loss = if self.iteration == 1 {
            loss
        } else {
            LOSS_ALPHA * loss + (1.0 - LOSS_ALPHA) * self.ema_loss
        };

        let secs = elapsed.as_secs_f32();
        self.update_time = if self.iteration == 1 {
            secs
        } else {
            (1.0 - TIME_ALPHA) * self.update_time + TIME_ALPHA * secs
        };
    }
}

/// One optimization step over the whole store.
///
/// The real optimizer is an external collaborator behind this seam;
/// the loop only cares about the returned loss and that the store's
/// accumulators were fed.
pub trait TrainStep: Send {
    fn step(
        &mut self,
        store: &mut GaussianStore,
        dataset: &Dataset,
        settings: &Settings,
    ) -> Result<f32>;
}

/// CPU stand-in optimizer: jitters positions, feeds the accumulators
/// and reports a decaying noisy loss.
pub struct SyntheticStep {
    rng: StdRng,
    iteration: u64,
}

impl SyntheticStep {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            iteration: 0,
        }
    }
}

impl TrainStep for SyntheticStep {
    fn step(
        &mut self,
        store: &mut GaussianStore,
        dataset: &Dataset,
        _settings: &Settings,
    ) -> Result<f32> {
        self.iteration += 1;

        let n = store.len();
        if n == 0 {
            return Ok(0.0);
        }

        let samples = (n / 16).max(1);
        for _ in 0..samples {
            let index = self.rng.random_range(0..n);
            let grad: f32 = self.rng.random_range(0.0..1e-3);
            let radius: f32 = self.rng.random_range(0.0..4.0);
            store.accumulate(index, grad, radius);

            let scale = dataset.extent * 1e-4;
            store.nudge_position(
                index,
                [
                    self.rng.random_range(-scale..scale),
                    self.rng.random_range(-scale..scale),
                    self.rng.random_range(-scale..scale),
                ],
            );
        }

        let noise: f32 = self.rng.random_range(0.0..0.05);
        Ok(0.5 / (1.0 + self.iteration as f32 / 500.0) + noise)
    }
}

/// The training loop, one spawned task for the process lifetime.
///
/// Pausing is a watch flag, not task teardown: counters, optimizer
/// state and the store survive any number of pause/resume cycles and
/// any number of client reconnects.
pub struct TrainLoop {
    pub store: StoreHandle,
    pub dataset: Arc<RwLock<Option<Dataset>>>,
    pub settings: Arc<RwLock<Settings>>,
    pub metrics: Arc<Mutex<TrainMetrics>>,
    pub enabled: watch::Receiver<bool>,
    pub pause: watch::Sender<bool>,
    pub balancer: Arc<Balancer>,
    pub outbox: Outbox,
    /// Debug mode reports progress on every iteration instead of the
    /// throttled cadence.
    pub debug: Arc<AtomicBool>,
    pub step: Box<dyn TrainStep>,
}

impl TrainLoop {
    pub async fn run(mut self) {
        info!("training loop started");

        loop {
            if !*self.enabled.borrow() {
                self.balancer.set_enabled(Loop::Train, false);
                if self.enabled.changed().await.is_err() {
                    break;
                }
                continue;
            }
            self.balancer.set_enabled(Loop::Train, true);

            let sleep = match self.pass() {
                Ok(Some(sleep)) => sleep,
                Ok(None) => continue,
                Err(err) => {
                    self.outbox.error(Scope::Trainer, &err);
                    self.pause.send_replace(false);
                    continue;
                }
            };

            if !sleep.is_zero() {
                time::sleep(sleep).await;
            } else {
                task::yield_now().await;
            }
        }

        info!("training loop stopped");
    }

    /// Runs one training pass on the blocking pool.
    ///
    /// # Returns
    /// The balancer-mandated sleep, or `None` when the pass could not
    /// run (no dataset, or the iteration cap was reached) and the loop
    /// paused itself.
    fn pass(&mut self) -> Result<Option<Duration>> {
        let started = Instant::now();

        let (loss, max_iteration) = {
            let settings = self.settings.read().clone();
            let dataset = self.dataset.read();
            let Some(dataset) = dataset.as_ref() else {
                self.pause.send_replace(false);
                return Ok(None);
            };

            if self.metrics.lock().iteration >= settings.iterations {
                self.outbox
                    .notice(Scope::Trainer, "Training reached the configured iteration cap");
                self.pause.send_replace(false);
                return Ok(None);
            }

            let loss = task::block_in_place(|| {
                self.step.step(&mut self.store.write(), dataset, &settings)
            })?;

            (loss, settings.iterations)
        };

        let elapsed = started.elapsed();
        let progress = {
            let mut metrics = self.metrics.lock();
            metrics.observe(loss, elapsed);
            metrics.progress(max_iteration)
        };

        let report_every = if self.debug.load(Ordering::Relaxed) {
            1
        } else {
            REPORT_EVERY
        };
        if progress.iteration % report_every == 0 {
            debug!(
                "iteration {} loss={:.5} ema={:.5}",
                progress.iteration, progress.loss, progress.ema_loss
            );
            self.outbox.event(Event::TrainStep(progress));
        }

        Ok(Some(self.balancer.record(Loop::Train, elapsed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded_dataset() -> Dataset {
        let mut settings = Settings::default();
        settings.dataset_path = std::env::temp_dir().to_string_lossy().into_owned();
        Dataset::load(&settings).unwrap()
    }

    fn seeded_handle(dataset: &Dataset) -> StoreHandle {
        let mut store = GaussianStore::default();
        store.create_from_seed(dataset.seed_points(), dataset.seed_colors());
        StoreHandle::new(store)
    }

    #[test]
    fn synthetic_step_feeds_accumulators() {
        let dataset = loaded_dataset();
        let handle = seeded_handle(&dataset);
        let mut step = SyntheticStep::new(7);

        let loss = step
            .step(&mut handle.write(), &dataset, &Settings::default())
            .unwrap();

        assert!(loss.is_finite() && loss > 0.0);
        let store = handle.read();
        assert_eq!(store.aux_lens(), [store.len(); 3]);
    }

    #[test]
    fn loss_ema_blends_recent_losses() {
        let mut metrics = TrainMetrics::default();
        metrics.observe(1.0, Duration::from_millis(10));
        assert_eq!(metrics.ema_loss, 1.0);

        metrics.observe(0.0, Duration::from_millis(10));
        assert!((metrics.ema_loss - 0.6).abs() < 1e-6);
    }

    #[test]
    fn step_time_ema_is_slow_moving() {
        let mut metrics = TrainMetrics::default();
        metrics.observe(0.5, Duration::from_secs(1));
        metrics.observe(0.5, Duration::from_secs(2));

        assert!((metrics.update_time - 1.2).abs() < 1e-6);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn iteration_cap_pauses_the_loop() {
        let dataset = loaded_dataset();
        let store = seeded_handle(&dataset);
        let settings = Arc::new(RwLock::new({
            let mut s = Settings::default();
            s.iterations = 3;
            s
        }));
        let metrics = Arc::new(Mutex::new(TrainMetrics::default()));
        let (pause, enabled) = watch::channel(true);
        let outbox = Outbox::new();
        let mut events = outbox.attach(64);

        let train = TrainLoop {
            store,
            dataset: Arc::new(RwLock::new(Some(dataset))),
            settings,
            metrics: Arc::clone(&metrics),
            enabled,
            pause: pause.clone(),
            balancer: Arc::new(Balancer::new(1.0)),
            outbox,
            debug: Arc::new(AtomicBool::new(false)),
            step: Box::new(SyntheticStep::new(7)),
        };
        let handle = tokio::spawn(train.run());

        // the loop flips its own flag back off at the cap
        let mut watcher = pause.subscribe();
        while *watcher.borrow_and_update() {
            watcher.changed().await.unwrap();
        }

        assert_eq!(metrics.lock().iteration, 3);
        let mut saw_cap_notice = false;
        while let Ok(msg) = events.try_recv() {
            if let crate::outbox::OutMsg::Event(Event::Notice { scope, .. }) = msg {
                saw_cap_notice = scope == Scope::Trainer;
            }
        }
        assert!(saw_cap_notice);
        handle.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn debug_mode_reports_every_iteration() {
        let dataset = loaded_dataset();
        let store = seeded_handle(&dataset);
        let settings = Arc::new(RwLock::new({
            let mut s = Settings::default();
            s.iterations = 3;
            s
        }));
        let (pause, enabled) = watch::channel(true);
        let outbox = Outbox::new();
        let mut events = outbox.attach(64);

        let train = TrainLoop {
            store,
            dataset: Arc::new(RwLock::new(Some(dataset))),
            settings,
            metrics: Arc::new(Mutex::new(TrainMetrics::default())),
            enabled,
            pause: pause.clone(),
            balancer: Arc::new(Balancer::new(1.0)),
            outbox,
            debug: Arc::new(AtomicBool::new(true)),
            step: Box::new(SyntheticStep::new(7)),
        };
        let handle = tokio::spawn(train.run());

        let mut watcher = pause.subscribe();
        while *watcher.borrow_and_update() {
            watcher.changed().await.unwrap();
        }

        let mut reported = Vec::new();
        while let Ok(msg) = events.try_recv() {
            if let crate::outbox::OutMsg::Event(Event::TrainStep(progress)) = msg {
                reported.push(progress.iteration);
            }
        }
        // throttled cadence would report nothing before iteration 50
        assert_eq!(reported, vec![1, 2, 3]);
        handle.abort();
    }
}
