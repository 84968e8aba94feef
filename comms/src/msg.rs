use std::{borrow::Cow, collections::BTreeMap, io};

use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_H: Header = 0;
const COMMAND_H: Header = 1;
const EVENT_H: Header = 2;
const FRAME_H: Header = 3;

/// Subsystem attribution for outbound errors and notices, so the
/// client can tell which part of the server rejected a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, SerdeSerialize, SerdeDeserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Dataset,
    Trainer,
    Model,
    Render,
    Other,
}

/// A free-form settings patch, validated server-side against the
/// settings whitelist before any key is applied.
pub type SettingsPatch = BTreeMap<String, serde_json::Value>;

/// Initial placement distribution for newly added units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, SerdeSerialize, SerdeDeserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    Uniform,
    Normal,
}

/// An axis-aligned region used both as an add-points reference frame
/// and as a remove-points predicate volume.
#[derive(Debug, Clone, Copy, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub struct Region {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

/// A structural edit on the model store.
#[derive(Debug, Clone, SerdeSerialize, SerdeDeserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditCommand {
    AddPoints {
        count: usize,
        distribution: Distribution,
        frame: Region,
    },
    RemovePoints {
        region: Region,
        #[serde(default)]
        invert: bool,
    },
}

/// Model reconfiguration: target device plus spherical-harmonics degree.
#[derive(Debug, Clone, SerdeSerialize, SerdeDeserialize)]
pub struct ModelSettingsUpdate {
    pub device: String,
    pub sh_degree: i64,
}

/// Render reconfiguration, applied immediately.
#[derive(Debug, Clone, Copy, SerdeSerialize, SerdeDeserialize)]
pub struct RenderSettingsUpdate {
    pub renderer_enabled: bool,
    pub width: u32,
    pub height: u32,
    pub fov_x: f32,
    pub fov_y: f32,
    pub near_plane: f32,
    pub far_plane: f32,
    /// Target train/render wall-clock share in `[0, 1]`, 1 = train-favored.
    pub balance: f32,
}

/// Pointer/scroll deltas for the preview camera.
#[derive(Debug, Clone, Copy, Default, SerdeSerialize, SerdeDeserialize)]
pub struct CameraMove {
    pub dx: f32,
    pub dy: f32,
    #[serde(default)]
    pub scroll: f32,
    #[serde(default)]
    pub pan: bool,
}

/// One inbound client message.
///
/// A single batch may carry several independent tags; each recognized
/// tag is handled on its own and unknown JSON fields are ignored, so
/// old servers tolerate newer clients.
#[derive(Debug, Clone, Default, SerdeSerialize, SerdeDeserialize)]
pub struct CommandBatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<Connect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialize_dataset: Option<SettingsPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_trainer_settings: Option<SettingsPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_model_settings: Option<ModelSettingsUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_renderer_settings: Option<RenderSettingsUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub training_start: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub training_pause: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_move: Option<CameraMove>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit: Option<EditCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

/// Connection handshake carrying the pre-shared token.
#[derive(Debug, Clone, SerdeSerialize, SerdeDeserialize)]
pub struct Connect {
    pub token: String,
}

/// Training progress as reported in step events and snapshots.
#[derive(Debug, Clone, Copy, Default, SerdeSerialize, SerdeDeserialize)]
pub struct TrainProgress {
    pub iteration: u64,
    pub max_iteration: u64,
    pub loss: f32,
    pub ema_loss: f32,
    /// EMA of the full step wall-clock time, seconds.
    pub update_time: f32,
}

/// Render configuration as reported in snapshots.
#[derive(Debug, Clone, Copy, SerdeSerialize, SerdeDeserialize)]
pub struct RenderState {
    pub renderer_enabled: bool,
    pub width: u32,
    pub height: u32,
    pub fov_x: f32,
    pub fov_y: f32,
    pub near_plane: f32,
    pub far_plane: f32,
    pub balance: f32,
}

/// The full state push a client receives right after connecting.
#[derive(Debug, Clone, SerdeSerialize, SerdeDeserialize)]
pub struct StateSnapshot {
    pub settings: SettingsPatch,
    pub debug: bool,
    pub dataset_loaded: bool,
    pub num_units: usize,
    pub trainer: TrainProgress,
    pub renderer: RenderState,
}

/// One outbound server event.
#[derive(Debug, Clone, SerdeSerialize, SerdeDeserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Connection { connected: bool },
    Snapshot(StateSnapshot),
    TrainStep(TrainProgress),
    Error { scope: Scope, message: String },
    Notice { scope: Scope, message: String },
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    /// Inbound command batch, JSON payload.
    Command(CommandBatch),
    /// Outbound event, JSON payload.
    Event(Event),
    /// Outbound encoded preview frame, binary payload.
    Frame { update_time: f32, data: &'a [u8] },
    /// Transport-level error string.
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    fn buf_is_too_small<T>(size: usize, needed: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {needed} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid message kind {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_H.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Command(batch) => {
                buf.extend_from_slice(&COMMAND_H.to_be_bytes());

                // SAFETY: the Serialize impl for `CommandBatch` is derived,
                //         has string keys only and cannot fail.
                serde_json::to_writer(buf, batch).unwrap();
                None
            }
            Msg::Event(event) => {
                buf.extend_from_slice(&EVENT_H.to_be_bytes());

                // SAFETY: same as above, derived impl over string-keyed maps.
                serde_json::to_writer(buf, event).unwrap();
                None
            }
            Msg::Frame { update_time, data } => {
                buf.extend_from_slice(&FRAME_H.to_be_bytes());
                buf.extend_from_slice(&update_time.to_be_bytes());
                Some(data)
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len(), HEADER_SIZE);
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);

        // SAFETY: we split the buffer at `HEADER_SIZE` just above.
        let kind = Header::from_be_bytes(kind_buf.try_into().unwrap());

        match kind {
            ERR_H => {
                let string = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            COMMAND_H => {
                let batch = serde_json::from_slice(rest)?;
                Ok(Self::Command(batch))
            }
            EVENT_H => {
                let event = serde_json::from_slice(rest)?;
                Ok(Self::Event(event))
            }
            FRAME_H => {
                if rest.len() < size_of::<f32>() {
                    return Self::buf_is_too_small(buf.len(), HEADER_SIZE + size_of::<f32>());
                }

                let (time_buf, data) = rest.split_at(size_of::<f32>());
                let update_time = f32::from_be_bytes(time_buf.try_into().unwrap());

                Ok(Self::Frame { update_time, data })
            }
            kind => Self::invalid_kind(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<'a>(msg: &'a Msg<'a>, buf: &'a mut Vec<u8>) -> Msg<'a> {
        buf.clear();
        let tail = msg.serialize(buf);
        if let Some(tail) = tail {
            buf.extend_from_slice(tail);
        }
        Msg::deserialize(buf).expect("frame must deserialize")
    }

    #[test]
    fn command_batch_carries_multiple_tags() {
        let mut batch = CommandBatch::default();
        batch.training_start = Some(true);
        batch.camera_move = Some(CameraMove {
            dx: 2.0,
            dy: -3.0,
            ..Default::default()
        });

        let msg = Msg::Command(batch);
        let mut buf = Vec::new();
        let back = roundtrip(&msg, &mut buf);

        let Msg::Command(batch) = back else {
            panic!("expected command, got {back:?}");
        };
        assert_eq!(batch.training_start, Some(true));
        assert_eq!(batch.camera_move.unwrap().dx, 2.0);
        assert!(batch.edit.is_none());
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let json = br#"{"training_pause": true, "future_feature": {"x": 1}}"#;
        let mut buf = COMMAND_H.to_be_bytes().to_vec();
        buf.extend_from_slice(json);

        let Msg::Command(batch) = Msg::deserialize(&buf).unwrap() else {
            panic!("expected command");
        };
        assert_eq!(batch.training_pause, Some(true));
    }

    #[test]
    fn frame_payload_is_zero_copy() {
        let pixels = vec![7u8; 64];
        let msg = Msg::Frame {
            update_time: 0.25,
            data: &pixels,
        };

        let mut buf = Vec::new();
        let back = roundtrip(&msg, &mut buf);

        let Msg::Frame { update_time, data } = back else {
            panic!("expected frame, got {back:?}");
        };
        assert_eq!(update_time, 0.25);
        assert_eq!(data, &pixels[..]);
    }

    #[test]
    fn garbage_kind_is_rejected() {
        let buf = 99u32.to_be_bytes().to_vec();
        assert!(Msg::deserialize(&buf).is_err());
    }

    #[test]
    fn edit_command_tags() {
        let edit = EditCommand::RemovePoints {
            region: Region {
                min: [-1.0; 3],
                max: [1.0; 3],
            },
            invert: true,
        };
        let json = serde_json::to_string(&edit).unwrap();
        assert!(json.contains("\"op\":\"remove_points\""));

        let back: EditCommand = serde_json::from_str(&json).unwrap();
        let EditCommand::RemovePoints { invert, .. } = back else {
            panic!("wrong variant");
        };
        assert!(invert);
    }
}
