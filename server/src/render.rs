use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use log::info;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::{sync::watch, task, time};

use crate::{
    camera::RenderCam,
    model::{GaussianStore, StoreHandle},
    outbox::Outbox,
    scheduler::{Balancer, Loop},
};

/// EMA smoothing for the reported frame time.
const TIME_ALPHA: f32 = 0.2;

/// One rendered preview image, tightly packed RGB.
#[derive(Debug, Clone)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Projects the model store through a camera into an image.
pub trait Rasterizer: Send {
    fn rasterize(&mut self, store: &GaussianStore, cam: &RenderCam) -> Image;
}

/// Turns an image into the wire payload of a frame message.
pub trait FrameEncoder: Send {
    fn encode(&mut self, image: &Image) -> Vec<u8>;
}

/// CPU stand-in rasterizer: splats every unit's position as a single
/// brightened pixel over a noise floor. Enough to see the cloud move.
pub struct SyntheticRasterizer {
    rng: StdRng,
}

impl SyntheticRasterizer {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Rasterizer for SyntheticRasterizer {
    fn rasterize(&mut self, store: &GaussianStore, cam: &RenderCam) -> Image {
        let (w, h) = (cam.width as usize, cam.height as usize);
        let mut rgb = vec![0u8; w * h * 3];
        for byte in rgb.iter_mut() {
            *byte = self.rng.random_range(0..16);
        }

        // orthographic along the camera ray, positions mapped into the
        // viewport around the orbit target
        let scale = (w.min(h) as f32) / (2.0 * cam.radius.max(0.1));
        for (position, color) in store.positions().iter().zip(store.colors()) {
            let x = (position[0] - cam.target[0]) * scale + w as f32 / 2.0;
            let y = (position[1] - cam.target[1]) * scale + h as f32 / 2.0;
            if x < 0.0 || y < 0.0 || x >= w as f32 || y >= h as f32 {
                continue;
            }

            let at = (y as usize * w + x as usize) * 3;
            for (channel, value) in rgb[at..at + 3].iter_mut().zip(color) {
                *channel = channel.saturating_add((value * 192.0) as u8);
            }
        }

        Image {
            width: cam.width,
            height: cam.height,
            rgb,
        }
    }
}

/// Pass-through encoder, raw RGB bytes on the wire.
#[derive(Default)]
pub struct RawEncoder;

impl FrameEncoder for RawEncoder {
    fn encode(&mut self, image: &Image) -> Vec<u8> {
        image.rgb.clone()
    }
}

/// The preview render loop, one spawned task for the process lifetime.
///
/// Renders only while a client is connected with rendering enabled and
/// a model exists; both conditions are watch flags so suspending drops
/// the loop into an await instead of burning a core.
pub struct RenderLoop {
    pub store: StoreHandle,
    pub camera: Arc<Mutex<RenderCam>>,
    pub enabled: watch::Receiver<bool>,
    pub model_ready: watch::Receiver<bool>,
    pub balancer: Arc<Balancer>,
    pub outbox: Outbox,
    pub rasterizer: Box<dyn Rasterizer>,
    pub encoder: Box<dyn FrameEncoder>,
    frame_time: f32,
}

impl RenderLoop {
    pub fn new(
        store: StoreHandle,
        camera: Arc<Mutex<RenderCam>>,
        enabled: watch::Receiver<bool>,
        model_ready: watch::Receiver<bool>,
        balancer: Arc<Balancer>,
        outbox: Outbox,
        rasterizer: Box<dyn Rasterizer>,
        encoder: Box<dyn FrameEncoder>,
    ) -> Self {
        Self {
            store,
            camera,
            enabled,
            model_ready,
            balancer,
            outbox,
            rasterizer,
            encoder,
            frame_time: 0.0,
        }
    }

    pub async fn run(mut self) {
        info!("render loop started");

        loop {
            if !*self.enabled.borrow() || !*self.model_ready.borrow() {
                self.balancer.set_enabled(Loop::Render, false);
                let stop = tokio::select! {
                    changed = self.enabled.changed() => changed.is_err(),
                    changed = self.model_ready.changed() => changed.is_err(),
                };
                if stop {
                    break;
                }
                continue;
            }
            self.balancer.set_enabled(Loop::Render, true);

            let sleep = self.pass();
            if !sleep.is_zero() {
                time::sleep(sleep).await;
            } else {
                task::yield_now().await;
            }
        }

        info!("render loop stopped");
    }

    fn pass(&mut self) -> Duration {
        let started = Instant::now();

        let payload = task::block_in_place(|| {
            let cam = self.camera.lock().clone();
            let image = self.rasterizer.rasterize(&self.store.read(), &cam);
            self.encoder.encode(&image)
        });

        let elapsed = started.elapsed();
        self.frame_time = if self.frame_time == 0.0 {
            elapsed.as_secs_f32()
        } else {
            (1.0 - TIME_ALPHA) * self.frame_time + TIME_ALPHA * elapsed.as_secs_f32()
        };

        self.outbox.frame(self.frame_time, payload);
        self.balancer.record(Loop::Render, elapsed)
    }
}
