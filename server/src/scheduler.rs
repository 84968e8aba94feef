use std::time::Duration;

use parking_lot::Mutex;

/// Smoothing factor for the per-loop cost estimates.
const EMA_ALPHA: f64 = 0.2;

/// Which cooperating loop is reporting a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loop {
    Train,
    Render,
}

#[derive(Debug)]
struct BalancerState {
    ema_train: f64,
    ema_render: f64,
    train_enabled: bool,
    render_enabled: bool,
    /// Target share of wall-clock time the training loop should get.
    balance: f64,
}

/// Time-share arbiter between the training and render loops.
///
/// Both loops report the wall-clock cost of each pass; the balancer
/// keeps an exponential moving average per loop and answers with how
/// long the reporting loop should sleep before its next pass. A loop
/// consuming more than its target share gets throttled; a loop running
/// alone is never throttled.
#[derive(Debug)]
pub struct Balancer {
    state: Mutex<BalancerState>,
}

impl Balancer {
    pub fn new(balance: f32) -> Self {
        Self {
            state: Mutex::new(BalancerState {
                ema_train: 0.0,
                ema_render: 0.0,
                train_enabled: false,
                render_enabled: false,
                balance: f64::from(balance.clamp(0.0, 1.0)),
            }),
        }
    }

    /// Updates the train/render share target, clamped to `[0, 1]`.
    pub fn set_balance(&self, balance: f32) {
        self.state.lock().balance = f64::from(balance.clamp(0.0, 1.0));
    }

    pub fn balance(&self) -> f32 {
        self.state.lock().balance as f32
    }

    /// Marks a loop as running or paused. A paused loop stops counting
    /// against the other loop's share.
    pub fn set_enabled(&self, which: Loop, enabled: bool) {
        let mut state = self.state.lock();
        match which {
            Loop::Train => state.train_enabled = enabled,
            Loop::Render => state.render_enabled = enabled,
        }
    }

    /// Records one pass of `which` and returns the sleep to apply
    /// before its next pass.
    ///
    /// # Arguments
    /// * `which` - The reporting loop.
    /// * `elapsed` - Wall-clock cost of the pass just finished.
    pub fn record(&self, which: Loop, elapsed: Duration) -> Duration {
        let mut state = self.state.lock();

        let ema = match which {
            Loop::Train => &mut state.ema_train,
            Loop::Render => &mut state.ema_render,
        };
        *ema = if *ema == 0.0 {
            elapsed.as_secs_f64()
        } else {
            *ema * (1.0 - EMA_ALPHA) + elapsed.as_secs_f64() * EMA_ALPHA
        };

        let (own, other, other_enabled, target) = match which {
            Loop::Train => (
                state.ema_train,
                state.ema_render,
                state.render_enabled,
                state.balance,
            ),
            Loop::Render => (
                state.ema_render,
                state.ema_train,
                state.train_enabled,
                1.0 - state.balance,
            ),
        };

        // A lone loop gets the whole machine.
        if !other_enabled || other <= 0.0 {
            return Duration::ZERO;
        }

        let total = own + other;
        if total <= 0.0 {
            return Duration::ZERO;
        }

        let share = own / total;
        if share <= target {
            return Duration::ZERO;
        }

        Duration::from_secs_f64((share - target) * total)
    }
}
