use std::f32::consts::TAU;

use comms::msg::{CameraMove, RenderSettingsUpdate, RenderState};

/// The preview camera, orbiting a target point.
///
/// Field-of-view angles are stored in radians; the wire carries
/// degrees, converted at the update/snapshot boundary.
#[derive(Debug, Clone)]
pub struct RenderCam {
    pub width: u32,
    pub height: u32,
    pub fov_x: f32,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,

    pub yaw: f32,
    pub pitch: f32,
    pub radius: f32,
    pub target: [f32; 3],
}

impl Default for RenderCam {
    fn default() -> Self {
        Self {
            width: 800,
            height: 800,
            fov_x: 65f32.to_radians(),
            fov_y: 65f32.to_radians(),
            near: 0.01,
            far: 100.0,
            yaw: 0.0,
            pitch: 0.0,
            radius: 5.0,
            target: [0.0; 3],
        }
    }
}

impl RenderCam {
    const MAX_PITCH: f32 = 1.5;
    const MIN_RADIUS: f32 = 0.05;

    /// Applies a renderer settings update. The enabled flag and the
    /// balance target live outside the camera and are handled by the
    /// coordinator.
    pub fn apply_settings(&mut self, update: &RenderSettingsUpdate) {
        self.width = update.width.max(1);
        self.height = update.height.max(1);
        self.fov_x = update.fov_x.to_radians();
        self.fov_y = update.fov_y.to_radians();
        self.near = update.near_plane;
        self.far = update.far_plane;
    }

    /// Processes one batch of pointer/scroll deltas, arcball style:
    /// a full drag across the viewport is one full revolution.
    pub fn process_move(&mut self, mv: &CameraMove) {
        if mv.pan {
            let scale = self.radius / self.width as f32;
            let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
            self.target[0] -= mv.dx * scale * cos_yaw;
            self.target[2] += mv.dx * scale * sin_yaw;
            self.target[1] += mv.dy * scale;
        } else {
            self.yaw += TAU * mv.dx / self.width as f32;
            self.pitch = (self.pitch + TAU * mv.dy / self.height as f32)
                .clamp(-Self::MAX_PITCH, Self::MAX_PITCH);
        }

        if mv.scroll != 0.0 {
            self.radius = (self.radius * (1.0 - 0.1 * mv.scroll)).max(Self::MIN_RADIUS);
        }
    }

    /// The camera position in world space, derived from the orbit pose.
    pub fn position(&self) -> [f32; 3] {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();

        [
            self.target[0] + self.radius * cos_pitch * sin_yaw,
            self.target[1] + self.radius * sin_pitch,
            self.target[2] + self.radius * cos_pitch * cos_yaw,
        ]
    }

    /// The render configuration as reported in state snapshots.
    pub fn state(&self, renderer_enabled: bool, balance: f32) -> RenderState {
        RenderState {
            renderer_enabled,
            width: self.width,
            height: self.height,
            fov_x: self.fov_x.to_degrees(),
            fov_y: self.fov_y.to_degrees(),
            near_plane: self.near,
            far_plane: self.far,
            balance,
        }
    }
}
