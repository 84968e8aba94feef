pub mod camera;
pub mod controller;
pub mod dataset;
pub mod device;
pub mod error;
pub mod model;
pub mod net;
pub mod outbox;
pub mod render;
pub mod scheduler;
pub mod settings;
pub mod trainer;
